//! Dependency resolution over the requires-graph.
//!
//! The graph is an index keyed by plugin identifier: forward edges hold the
//! dependencies each installed plugin declares, reverse edges hold the
//! plugins declaring a dependency on an identifier. Both are maintained
//! incrementally as plugins are installed and uninstalled, so a plugin never
//! owns a reference to another.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::descriptor::{Dependency, PluginDescriptor};
use crate::error::{Error, Result};
use crate::registry::PluginRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Activation order of a plugin and its requires-closure.
#[derive(Debug, Default)]
pub struct ActivationPlan {
    /// Members in activation order, the target last.
    pub order: Vec<String>,
    /// Members with an unsatisfied required dependency, keyed by identifier.
    /// Holds the first unsatisfied dependency of each.
    pub unsatisfied: HashMap<String, Error>,
}

#[derive(Default)]
struct Walk {
    marks: HashMap<String, Mark>,
    stack: Vec<String>,
    order: Vec<String>,
    unsatisfied: HashMap<String, Error>,
}

/// Requires-graph and the orderings derived from it.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    forward: HashMap<String, Vec<Dependency>>,
    reverse: HashMap<String, BTreeSet<String>>,
}

impl DependencyResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the edges declared by a newly installed descriptor.
    pub fn add(&mut self, descriptor: &PluginDescriptor) {
        self.remove(&descriptor.id);

        let mut deps = descriptor.dependencies.clone();
        deps.sort_by(|a, b| a.id.cmp(&b.id));

        for dep in &deps {
            self.reverse
                .entry(dep.id.clone())
                .or_default()
                .insert(descriptor.id.clone());
        }
        self.forward.insert(descriptor.id.clone(), deps);
    }

    /// Drop every edge declared by `id`.
    ///
    /// Edges other plugins declare towards `id` stay: they belong to those
    /// plugins and become unsatisfied until `id` is installed again.
    pub fn remove(&mut self, id: &str) {
        let Some(deps) = self.forward.remove(id) else {
            return;
        };

        for dep in deps {
            if let Some(dependents) = self.reverse.get_mut(&dep.id) {
                dependents.remove(id);
                if dependents.is_empty() {
                    self.reverse.remove(&dep.id);
                }
            }
        }
    }

    /// Plugins declaring a dependency on `id`, ascending.
    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.reverse
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Identifiers `id` requires (non-optional edges), ascending.
    pub fn required(&self, id: &str) -> Vec<String> {
        self.forward
            .get(id)
            .map(|deps| {
                deps.iter()
                    .filter(|d| !d.optional)
                    .map(|d| d.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Order in which `target` and its requires-closure must be activated.
    ///
    /// Dependencies come before their dependents and `target` comes last.
    /// Siblings are visited by identifier, ascending. Unsatisfied optional
    /// dependencies are left out of the closure. Fails on the first member
    /// with an unsatisfied required dependency; see
    /// [`DependencyResolver::activation_plan`] for a per-member view.
    pub fn activation_order(&self, registry: &PluginRegistry, target: &str) -> Result<Vec<String>> {
        let mut plan = self.activation_plan(registry, target)?;
        let first = plan
            .order
            .iter()
            .find_map(|id| plan.unsatisfied.remove(id));
        match first {
            Some(err) => Err(err),
            None => Ok(plan.order),
        }
    }

    /// Activation order of `target` together with the members whose
    /// required dependencies cannot be satisfied.
    ///
    /// Only a cycle fails the whole plan. An unsatisfied member stays in the
    /// order so that the cascade can fail it and its dependents while
    /// unrelated members still start.
    pub fn activation_plan(&self, registry: &PluginRegistry, target: &str) -> Result<ActivationPlan> {
        if !registry.contains(target) {
            return Err(Error::plugin_not_found(target));
        }

        let mut walk = Walk::default();
        self.visit_requirements(registry, target, &mut walk)?;

        tracing::debug!("Activation order for {}: {:?}", target, walk.order);
        Ok(ActivationPlan {
            order: walk.order,
            unsatisfied: walk.unsatisfied,
        })
    }

    fn visit_requirements(&self, registry: &PluginRegistry, id: &str, walk: &mut Walk) -> Result<()> {
        match walk.marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = walk.stack.iter().position(|s| s == id).unwrap_or(0);
                let mut cycle: Vec<String> = walk.stack[start..].to_vec();
                cycle.push(id.to_string());
                return Err(Error::CyclicDependency { cycle });
            }
            None => {}
        }

        walk.marks.insert(id.to_string(), Mark::Visiting);
        walk.stack.push(id.to_string());

        for dep in self.forward.get(id).map(Vec::as_slice).unwrap_or_default() {
            match registry.lookup(&dep.id) {
                Some(installed) if dep.matches(&installed.version) => {
                    self.visit_requirements(registry, &dep.id, walk)?;
                }
                other if dep.optional => {
                    tracing::debug!(
                        "Dropping optional dependency {} {} of {} ({})",
                        dep.id,
                        dep.requirement_display(),
                        id,
                        other
                            .map(|d| format!("installed {}", d.version))
                            .unwrap_or_else(|| "not installed".to_string())
                    );
                }
                _ => {
                    walk.unsatisfied.entry(id.to_string()).or_insert_with(|| {
                        Error::unsatisfied(id, dep.id.clone(), dep.requirement_display())
                    });
                }
            }
        }

        walk.stack.pop();
        walk.marks.insert(id.to_string(), Mark::Done);
        walk.order.push(id.to_string());
        Ok(())
    }

    /// Order in which `target` and everything depending on it must stop.
    ///
    /// Deepest dependents come first and `target` comes last.
    pub fn deactivation_order(&self, target: &str) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        self.visit_dependents(target, &mut visited, &mut order);
        order
    }

    /// Order in which every installed plugin must stop: each plugin after all
    /// of its dependents, so leaves of the requires-graph come last.
    pub fn shutdown_order(&self, registry: &PluginRegistry) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        for id in registry.ids() {
            self.visit_dependents(&id, &mut visited, &mut order);
        }
        order.retain(|id| registry.contains(id));
        order
    }

    fn visit_dependents(&self, id: &str, visited: &mut HashSet<String>, order: &mut Vec<String>) {
        if !visited.insert(id.to_string()) {
            return;
        }
        if let Some(dependents) = self.reverse.get(id) {
            for dependent in dependents {
                self.visit_dependents(dependent, visited, order);
            }
        }
        order.push(id.to_string());
    }
}
