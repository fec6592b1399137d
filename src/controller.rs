//! Start and stop cascades.
//!
//! The controller walks the orderings produced by the resolver and drives
//! each member through `starting`/`stopping`. Plugin code runs with only the
//! context's serialization lock held.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;
use crate::descriptor::PluginDescriptor;
use crate::error::{Error, PluginFailure, Result};
use crate::lifecycle::{PluginEvent, PluginLifecycle, PluginState};
use crate::plugin::PluginContext;
use crate::registry::InstallOutcome;

/// Result of a stop cascade that was not aborted.
#[derive(Debug, Default)]
pub(crate) struct StopOutcome {
    pub(crate) stopped: Vec<String>,
    pub(crate) failures: Vec<PluginFailure>,
}

impl StopOutcome {
    fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(Error::TeardownFailed(self.failures))
        }
    }
}

impl Context {
    /// Start a plugin and its requires-closure, dependencies first.
    ///
    /// Starting an active plugin is a no-op. Structural errors (cycles,
    /// unsatisfied dependencies) abort before any state change and are
    /// recorded as the plugin's last error.
    pub fn start(&self, id: &str) -> Result<()> {
        let _ops = self.serialize();
        self.ensure_alive()?;
        self.start_locked(id)
    }

    /// Stop a plugin after everything depending on it.
    ///
    /// Stopping a stopped plugin is a no-op. Failures of individual members
    /// do not interrupt the cascade and are reported together as
    /// [`Error::TeardownFailed`]; a fatal error aborts it.
    pub fn stop(&self, id: &str) -> Result<()> {
        let _ops = self.serialize();
        self.ensure_alive()?;
        self.stop_locked(id)?.into_result()
    }

    /// Start every installed plugin, by identifier.
    pub fn start_all(&self) -> Vec<(String, Result<()>)> {
        let _ops = self.serialize();
        if self.ensure_alive().is_err() {
            return Vec::new();
        }

        let ids = self.state.read().registry.ids();
        ids.into_iter()
            .map(|id| {
                let result = self.start_locked(&id);
                (id, result)
            })
            .collect()
    }

    /// Stop every active plugin, dependents before their dependencies.
    pub fn stop_all(&self) -> Vec<(String, Result<()>)> {
        let _ops = self.serialize();
        if self.ensure_alive().is_err() {
            return Vec::new();
        }

        let mut results = Vec::new();
        for id in self.shutdown_order() {
            if self.plugin_state(&id) != PluginState::Active {
                continue;
            }
            let result = self.deactivate(&id);
            let fatal = matches!(result, Err(ref e) if e.is_fatal());
            results.push((id, result));
            if fatal {
                break;
            }
        }
        results
    }

    /// Uninstall a stopped plugin.
    ///
    /// Resolved dependents return to `installed` since their resolution no
    /// longer holds.
    pub fn uninstall(&self, id: &str) -> Result<Arc<PluginDescriptor>> {
        let _ops = self.serialize();
        self.ensure_alive()?;
        self.uninstall_locked(id)
    }

    pub(crate) fn shutdown_order(&self) -> Vec<String> {
        let state = self.state.read();
        state.resolver.shutdown_order(&state.registry)
    }

    pub(crate) fn start_locked(&self, id: &str) -> Result<()> {
        match self.plugin_state(id) {
            PluginState::Active | PluginState::Starting => return Ok(()),
            PluginState::Uninstalled => return Err(Error::plugin_not_found(id)),
            PluginState::Stopping => {
                return Err(Error::invalid_state("installed or resolved", "stopping"))
            }
            PluginState::Installed | PluginState::Resolved => {}
        }

        let plan = {
            let state = self.state.read();
            state.resolver.activation_plan(&state.registry, id)
        };
        let mut plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!("Cannot start {}: {}", id, e);
                self.set_error(id, Some(e.to_string()));
                return Err(e);
            }
        };

        for member in &plan.order {
            if !plan.unsatisfied.contains_key(member)
                && self.plugin_state(member) == PluginState::Installed
            {
                self.transition(member, PluginState::Resolved);
            }
        }

        let mut failed: HashMap<String, Arc<Error>> = HashMap::new();

        for member in &plan.order {
            self.ensure_alive()?;

            if let Some(err) = plan.unsatisfied.remove(member) {
                tracing::warn!("Cannot start {}: {}", member, err);
                self.set_error(member, Some(err.to_string()));
                if member == id {
                    return Err(err);
                }
                failed.insert(member.clone(), Arc::new(err));
                continue;
            }

            if !self.plugin_state(member).is_stopped() {
                continue;
            }

            if let Some((dependency, source)) = self.blocked_requirement(member, &failed) {
                let err = Error::DependencyStartFailed {
                    plugin: member.clone(),
                    dependency,
                    source,
                };
                tracing::warn!("{}", err);
                self.set_error(member, Some(err.to_string()));
                if member == id {
                    return Err(err);
                }
                failed.insert(member.clone(), Arc::new(err));
                continue;
            }

            if let Err(e) = self.activate(member) {
                if member == id || e.is_fatal() || matches!(e, Error::ContextDestroyed) {
                    return Err(e);
                }
                failed.insert(member.clone(), Arc::new(e));
            }
        }

        Ok(())
    }

    /// First required dependency of `id` that is not active, with the reason.
    fn blocked_requirement(
        &self,
        id: &str,
        failed: &HashMap<String, Arc<Error>>,
    ) -> Option<(String, Arc<Error>)> {
        let required = self.state.read().resolver.required(id);
        required.into_iter().find_map(|dep| {
            if let Some(source) = failed.get(&dep) {
                return Some((dep, source.clone()));
            }
            match self.plugin_state(&dep) {
                PluginState::Active => None,
                state => {
                    let source = Arc::new(Error::invalid_state("active", state.to_string()));
                    Some((dep, source))
                }
            }
        })
    }

    pub(crate) fn activate(&self, id: &str) -> Result<()> {
        let descriptor = self.lookup(id).ok_or_else(|| Error::plugin_not_found(id))?;

        self.args_frozen.store(true, Ordering::SeqCst);
        self.transition(id, PluginState::Starting);

        #[cfg(feature = "metrics-prometheus")]
        let started_at = std::time::Instant::now();

        let ctx = PluginContext::new(self, id);
        let result = self.loader.load(&descriptor).and_then(|mut runtime| {
            runtime.on_start(&ctx)?;
            Ok(runtime)
        });

        match result {
            Ok(runtime) => {
                if self.is_destroyed() {
                    self.discard_started(id, runtime);
                    return Err(Error::ContextDestroyed);
                }

                self.runtimes.insert(id.to_string(), Mutex::new(runtime));
                self.set_error(id, None);
                self.transition(id, PluginState::Active);
                tracing::info!("Activated plugin {} {}", id, descriptor.version);

                #[cfg(feature = "metrics-prometheus")]
                if let Some(ref metrics) = self.metrics {
                    metrics.record_activation(started_at.elapsed().as_secs_f64());
                }

                Ok(())
            }
            Err(e) => {
                self.scheduler().lock().revoke(id);
                self.transition(id, PluginState::Resolved);

                let err = match e {
                    e @ (Error::ActivationFailed { .. } | Error::Fatal(_)) => e,
                    other => Error::activation_failed(id, other.to_string()),
                };
                tracing::error!("{}", err);
                self.set_error(id, Some(err.to_string()));

                #[cfg(feature = "metrics-prometheus")]
                if let Some(ref metrics) = self.metrics {
                    metrics.record_activation_failure();
                }

                Err(err)
            }
        }
    }

    /// Undo an activation whose plugin destroyed the context from inside
    /// `on_start`. The destroy pass skipped it while it was starting.
    fn discard_started(&self, id: &str, mut runtime: Box<dyn PluginLifecycle>) {
        self.scheduler().lock().revoke(id);
        self.transition(id, PluginState::Stopping);
        if let Err(e) = runtime.on_stop(&PluginContext::new(self, id)) {
            tracing::warn!("Plugin {} failed to stop cleanly: {}", id, e);
        }
        drop(runtime);
        self.transition(id, PluginState::Resolved);

        if let Err(e) = self.uninstall_locked(id) {
            tracing::warn!("Failed to uninstall {} after destroy: {}", id, e);
        }
    }

    pub(crate) fn deactivate(&self, id: &str) -> Result<()> {
        // Revoked before listeners see `stopping`.
        self.scheduler().lock().revoke(id);
        self.transition(id, PluginState::Stopping);

        let runtime = self.runtimes.remove(id).map(|(_, runtime)| runtime.into_inner());
        let result = match runtime {
            Some(mut runtime) => runtime.on_stop(&PluginContext::new(self, id)),
            None => Ok(()),
        };

        self.transition(id, PluginState::Resolved);

        #[cfg(feature = "metrics-prometheus")]
        if let Some(ref metrics) = self.metrics {
            metrics.record_deactivation(result.is_ok());
        }

        if self.is_destroyed() && !self.is_tearing_down() {
            if let Err(e) = self.uninstall_locked(id) {
                tracing::warn!("Failed to uninstall {} after destroy: {}", id, e);
            }
        }

        match result {
            Ok(()) => {
                tracing::info!("Deactivated plugin {}", id);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Plugin {} failed to stop cleanly: {}", id, e);
                Err(e)
            }
        }
    }

    pub(crate) fn stop_locked(&self, id: &str) -> Result<StopOutcome> {
        match self.plugin_state(id) {
            PluginState::Uninstalled => return Err(Error::plugin_not_found(id)),
            state if state.is_stopped() => return Ok(StopOutcome::default()),
            _ => {}
        }

        let order = self.state.read().resolver.deactivation_order(id);
        tracing::debug!("Deactivation order for {}: {:?}", id, order);
        self.deactivate_members(order)
    }

    pub(crate) fn stop_all_locked(&self) -> Result<StopOutcome> {
        let order = self.shutdown_order();
        self.deactivate_members(order)
    }

    fn deactivate_members(&self, order: Vec<String>) -> Result<StopOutcome> {
        let mut outcome = StopOutcome::default();

        for member in order {
            if self.plugin_state(&member) != PluginState::Active {
                continue;
            }
            match self.deactivate(&member) {
                Ok(()) => outcome.stopped.push(member),
                Err(e) if e.is_fatal() => {
                    tracing::error!("Aborting stop cascade at {}: {}", member, e);
                    return Err(e);
                }
                Err(e) => {
                    outcome
                        .failures
                        .push(PluginFailure::new(member.clone(), e.to_string()));
                    outcome.stopped.push(member);
                }
            }
        }

        Ok(outcome)
    }

    pub(crate) fn install_locked(
        &self,
        descriptor: PluginDescriptor,
        replace: bool,
    ) -> Result<InstallOutcome> {
        let (outcome, unresolved) = {
            let mut state = self.state.write();
            let outcome = state.registry.install(descriptor, replace)?;
            let unresolved = match &outcome {
                InstallOutcome::Unchanged(_) => Vec::new(),
                InstallOutcome::Installed(new) => {
                    state.resolver.add(new);
                    Vec::new()
                }
                InstallOutcome::Replaced { new, .. } => {
                    state.resolver.add(new);
                    state.unresolve_dependents(&new.id)
                }
            };
            (outcome, unresolved)
        };

        if !matches!(outcome, InstallOutcome::Unchanged(_)) {
            let descriptor = outcome.descriptor();
            tracing::info!("Installed plugin {} {}", descriptor.id, descriptor.version);
            self.emit(&PluginEvent::new(
                descriptor.id.clone(),
                PluginState::Uninstalled,
                PluginState::Installed,
            ));
            for dependent in unresolved {
                self.emit(&PluginEvent::new(
                    dependent,
                    PluginState::Resolved,
                    PluginState::Installed,
                ));
            }
        }

        Ok(outcome)
    }

    pub(crate) fn uninstall_locked(&self, id: &str) -> Result<Arc<PluginDescriptor>> {
        let (descriptor, old, unresolved) = {
            let mut state = self.state.write();
            let old = state.registry.state(id);
            let descriptor = state.registry.uninstall(id)?;
            state.resolver.remove(id);
            let unresolved = state.unresolve_dependents(id);
            (descriptor, old, unresolved)
        };

        self.runtimes.remove(id);
        self.scheduler().lock().revoke(id);

        tracing::info!("Uninstalled plugin {} {}", descriptor.id, descriptor.version);
        self.emit(&PluginEvent::new(
            id,
            old,
            PluginState::Uninstalled,
        ));
        for dependent in unresolved {
            self.emit(&PluginEvent::new(
                dependent,
                PluginState::Resolved,
                PluginState::Installed,
            ));
        }

        Ok(descriptor)
    }
}
