//! Live reconfiguration: install, upgrade, uninstall and collection scans
//! as compound operations over the lifecycle controller.
//!
//! Each operation holds the context's serialization lock from the first
//! stop to the last restart, so other threads never observe a dependent
//! running against a missing dependency.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::context::Context;
use crate::controller::StopOutcome;
use crate::descriptor::PluginDescriptor;
use crate::error::{Error, PluginFailure, Result};

/// Flags steering a reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ReconfigFlags {
    /// Restart plugins that were active before an install.
    pub restart_active_on_install: bool,
    /// Restart plugins stopped for an upgrade.
    pub restart_active_on_upgrade: bool,
    /// Stop every plugin before an install.
    pub stop_all_on_install: bool,
    /// Stop every plugin before an upgrade.
    pub stop_all_on_upgrade: bool,
    /// Let collection scans upgrade installed plugins.
    pub upgrade: bool,
    /// Stop active dependents when uninstalling.
    pub cascade_stop: bool,
}

impl Default for ReconfigFlags {
    fn default() -> Self {
        Self {
            restart_active_on_install: false,
            restart_active_on_upgrade: false,
            stop_all_on_install: false,
            stop_all_on_upgrade: false,
            upgrade: false,
            cascade_stop: true,
        }
    }
}

impl ReconfigFlags {
    /// Create the default flags.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart previously active plugins after an install.
    pub fn with_restart_active_on_install(mut self, enabled: bool) -> Self {
        self.restart_active_on_install = enabled;
        self
    }

    /// Restart stopped plugins after an upgrade.
    pub fn with_restart_active_on_upgrade(mut self, enabled: bool) -> Self {
        self.restart_active_on_upgrade = enabled;
        self
    }

    /// Stop everything before an install.
    pub fn with_stop_all_on_install(mut self, enabled: bool) -> Self {
        self.stop_all_on_install = enabled;
        self
    }

    /// Stop everything before an upgrade.
    pub fn with_stop_all_on_upgrade(mut self, enabled: bool) -> Self {
        self.stop_all_on_upgrade = enabled;
        self
    }

    /// Allow scans to upgrade.
    pub fn with_upgrade(mut self, enabled: bool) -> Self {
        self.upgrade = enabled;
        self
    }

    /// Stop active dependents on uninstall.
    pub fn with_cascade_stop(mut self, enabled: bool) -> Self {
        self.cascade_stop = enabled;
        self
    }

    fn without_restarts(self) -> Self {
        Self {
            restart_active_on_install: false,
            restart_active_on_upgrade: false,
            stop_all_on_install: false,
            stop_all_on_upgrade: false,
            ..self
        }
    }
}

/// What a reconfiguration did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconfigReport {
    /// Plugins newly installed.
    pub installed: Vec<String>,
    /// Plugins replaced by a newer version.
    pub upgraded: Vec<String>,
    /// Plugins uninstalled.
    pub uninstalled: Vec<String>,
    /// Plugins stopped along the way.
    pub stopped: Vec<String>,
    /// Plugins started again afterwards.
    pub restarted: Vec<String>,
    /// Failures that did not abort the operation.
    pub failures: Vec<PluginFailure>,
}

impl ReconfigReport {
    /// Check if nothing failed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Check if the operation changed nothing.
    pub fn is_noop(&self) -> bool {
        self.installed.is_empty()
            && self.upgraded.is_empty()
            && self.uninstalled.is_empty()
            && self.stopped.is_empty()
            && self.restarted.is_empty()
    }

    fn absorb(&mut self, outcome: StopOutcome) {
        self.stopped.extend(outcome.stopped);
        self.failures.extend(outcome.failures);
    }

    fn merge(&mut self, other: ReconfigReport) {
        self.installed.extend(other.installed);
        self.upgraded.extend(other.upgraded);
        self.uninstalled.extend(other.uninstalled);
        self.stopped.extend(other.stopped);
        self.restarted.extend(other.restarted);
        self.failures.extend(other.failures);
    }
}

impl Context {
    /// Install a plugin using the context's default flags.
    pub fn install_plugin(&self, descriptor: PluginDescriptor) -> Result<ReconfigReport> {
        self.install_plugin_with(descriptor, self.flags())
    }

    /// Install a plugin.
    ///
    /// Installing an identifier already present at the same version changes
    /// nothing. The new plugin stays `installed` until started.
    pub fn install_plugin_with(
        &self,
        descriptor: PluginDescriptor,
        flags: ReconfigFlags,
    ) -> Result<ReconfigReport> {
        let _ops = self.serialize();
        self.ensure_alive()?;
        self.install_with_locked(descriptor, flags)
    }

    /// Upgrade an installed plugin using the context's default flags.
    pub fn upgrade_plugin(&self, descriptor: PluginDescriptor) -> Result<ReconfigReport> {
        self.upgrade_plugin_with(descriptor, self.flags())
    }

    /// Replace an installed plugin with another version.
    ///
    /// The plugin and its active dependents (or every active plugin under
    /// `stop_all_on_upgrade`) are stopped, the old version is uninstalled and
    /// the new one installed. If the new version cannot be installed the old
    /// one is put back.
    pub fn upgrade_plugin_with(
        &self,
        descriptor: PluginDescriptor,
        flags: ReconfigFlags,
    ) -> Result<ReconfigReport> {
        let _ops = self.serialize();
        self.ensure_alive()?;
        self.upgrade_with_locked(descriptor, flags)
    }

    /// Uninstall a plugin using the context's default flags.
    pub fn uninstall_plugin(&self, id: &str) -> Result<ReconfigReport> {
        self.uninstall_plugin_with(id, self.flags())
    }

    /// Stop and uninstall a plugin.
    ///
    /// Without `cascade_stop`, active dependents make this fail with
    /// [`Error::InUseByDependents`] before anything changes.
    pub fn uninstall_plugin_with(&self, id: &str, flags: ReconfigFlags) -> Result<ReconfigReport> {
        let _ops = self.serialize();
        self.ensure_alive()?;

        if !self.state.read().registry.contains(id) {
            return Err(Error::plugin_not_found(id));
        }

        if !flags.cascade_stop {
            let order = self.state.read().resolver.deactivation_order(id);
            let active: Vec<String> = order
                .into_iter()
                .filter(|member| member != id && self.is_active(member))
                .collect();
            if !active.is_empty() {
                return Err(Error::InUseByDependents {
                    plugin: id.to_string(),
                    dependents: active,
                });
            }
        }

        let mut report = ReconfigReport::default();
        report.absorb(self.stop_locked(id)?);
        self.uninstall_locked(id)?;
        report.uninstalled.push(id.to_string());

        Ok(report)
    }

    /// Scan collections using the context's default flags.
    pub fn scan_plugins(&self) -> Result<ReconfigReport> {
        self.scan_plugins_with(self.flags())
    }

    /// Scan every registered collection and install what it offers.
    ///
    /// When several collections offer one identifier the highest version
    /// wins. Installed plugins are upgraded only with `flags.upgrade`.
    pub fn scan_plugins_with(&self, flags: ReconfigFlags) -> Result<ReconfigReport> {
        let _ops = self.serialize();
        self.ensure_alive()?;

        let loader = self
            .descriptor_loader
            .clone()
            .ok_or_else(|| Error::invalid_state("descriptor loader configured", "none"))?;

        let mut report = ReconfigReport::default();
        let mut offered: BTreeMap<String, (PathBuf, PluginDescriptor)> = BTreeMap::new();
        let mut ignored: Vec<(PathBuf, PluginDescriptor)> = Vec::new();

        for collection in self.collections() {
            let scanned = self.state.write().registry.scan(&collection, loader.as_ref());
            let found = match scanned {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!("Failed to scan {}: {}", collection.display(), e);
                    report.failures.push(PluginFailure::new(
                        collection.display().to_string(),
                        e.to_string(),
                    ));
                    continue;
                }
            };

            for descriptor in found {
                match offered.entry(descriptor.id.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert((collection.clone(), descriptor));
                    }
                    Entry::Occupied(mut slot) if descriptor.version > slot.get().1.version => {
                        ignored.push(slot.insert((collection.clone(), descriptor)));
                    }
                    Entry::Occupied(_) => ignored.push((collection.clone(), descriptor)),
                }
            }
        }

        let mut installs = Vec::new();
        let mut upgrades = Vec::new();
        for (id, (collection, descriptor)) in offered {
            match self.lookup(&id) {
                None => installs.push((collection, descriptor)),
                Some(current) if descriptor.version > current.version => {
                    if flags.upgrade {
                        upgrades.push((collection, descriptor));
                    } else {
                        tracing::info!(
                            "Found {} {} (installed {}), upgrades disabled",
                            id,
                            descriptor.version,
                            current.version
                        );
                    }
                }
                Some(current) => {
                    tracing::debug!(
                        "Ignoring {} {}, installed {} is newer",
                        id,
                        descriptor.version,
                        current.version
                    );
                    ignored.push((collection, descriptor));
                }
            }
        }

        {
            let mut state = self.state.write();
            for (collection, descriptor) in &ignored {
                state.registry.acknowledge(collection, descriptor);
            }
        }

        if installs.is_empty() && upgrades.is_empty() {
            return Ok(report);
        }

        let snapshot = self.active_plugins();
        let stop_all = (!installs.is_empty() && flags.stop_all_on_install)
            || (!upgrades.is_empty() && flags.stop_all_on_upgrade);
        if stop_all {
            report.absorb(self.stop_all_locked()?);
        }

        let single = flags.without_restarts();

        for (collection, descriptor) in installs {
            let id = descriptor.id.clone();
            let scanned = descriptor.clone();
            match self.install_with_locked(descriptor, single) {
                Ok(step) => {
                    self.state.write().registry.acknowledge(&collection, &scanned);
                    report.merge(step);
                }
                Err(e) => {
                    tracing::warn!("Failed to install {}: {}", id, e);
                    report.failures.push(PluginFailure::new(id, e.to_string()));
                }
            }
        }

        for (collection, descriptor) in upgrades {
            let id = descriptor.id.clone();
            let scanned = descriptor.clone();
            match self.upgrade_with_locked(descriptor, single) {
                Ok(step) => {
                    self.state.write().registry.acknowledge(&collection, &scanned);
                    report.merge(step);
                }
                Err(e) => {
                    tracing::warn!("Failed to upgrade {}: {}", id, e);
                    report.failures.push(PluginFailure::new(id, e.to_string()));
                }
            }
        }

        let restart_installs = flags.restart_active_on_install && !report.installed.is_empty();
        let restart_upgrades = flags.restart_active_on_upgrade && !report.upgraded.is_empty();

        if restart_installs {
            for id in report.installed.clone() {
                self.stop_optional_dependents(&id, &mut report)?;
            }
        }
        if restart_installs || restart_upgrades {
            self.restart(&snapshot, &mut report);
        }

        tracing::info!(
            "Scan installed {} and upgraded {} plugin(s)",
            report.installed.len(),
            report.upgraded.len()
        );

        Ok(report)
    }

    fn install_with_locked(
        &self,
        descriptor: PluginDescriptor,
        flags: ReconfigFlags,
    ) -> Result<ReconfigReport> {
        descriptor.validate()?;

        {
            let state = self.state.read();
            match state.registry.lookup(&descriptor.id) {
                Some(existing) if existing.version == descriptor.version => {
                    tracing::debug!(
                        "Plugin {} {} already installed",
                        descriptor.id,
                        descriptor.version
                    );
                    return Ok(ReconfigReport::default());
                }
                Some(existing) if !state.registry.config().allow_replace => {
                    return Err(Error::DuplicateId {
                        id: descriptor.id.clone(),
                        installed: existing.version.to_string(),
                        offered: descriptor.version.to_string(),
                    });
                }
                Some(_) => {}
                None if state.registry.len() >= state.registry.config().max_plugins => {
                    return Err(Error::RegistryFull(state.registry.config().max_plugins));
                }
                None => {}
            }
        }

        let id = descriptor.id.clone();
        let snapshot = self.active_plugins();
        let mut report = ReconfigReport::default();

        if flags.stop_all_on_install {
            report.absorb(self.stop_all_locked()?);
        }

        if let Err(e) = self.install_locked(descriptor, false) {
            if flags.restart_active_on_install {
                self.restart(&snapshot, &mut report);
            }
            return Err(e);
        }
        report.installed.push(id.clone());

        if flags.restart_active_on_install {
            self.stop_optional_dependents(&id, &mut report)?;
            self.restart(&snapshot, &mut report);
        }

        Ok(report)
    }

    fn upgrade_with_locked(
        &self,
        descriptor: PluginDescriptor,
        flags: ReconfigFlags,
    ) -> Result<ReconfigReport> {
        descriptor.validate()?;

        let id = descriptor.id.clone();
        let current = self.lookup(&id).ok_or_else(|| Error::plugin_not_found(&id))?;
        if current.version == descriptor.version {
            return Ok(ReconfigReport::default());
        }

        let snapshot: Vec<String> = if flags.stop_all_on_upgrade {
            self.active_plugins()
        } else {
            let mut order = self.state.read().resolver.deactivation_order(&id);
            order.retain(|member| self.is_active(member));
            // Dependencies first when starting again.
            order.reverse();
            order
        };

        let mut report = ReconfigReport::default();
        let outcome = if flags.stop_all_on_upgrade {
            self.stop_all_locked()?
        } else {
            self.stop_locked(&id)?
        };
        report.absorb(outcome);

        let old = self.uninstall_locked(&id)?;
        let from = old.version.clone();
        let to = descriptor.version.clone();

        if let Err(e) = self.install_locked(descriptor, false) {
            tracing::error!("Upgrade of {} to {} failed, restoring {}: {}", id, to, from, e);
            if let Err(restore) = self.install_locked((*old).clone(), false) {
                return Err(Error::Fatal(format!(
                    "cannot restore {} {} after failed upgrade: {}",
                    id, from, restore
                )));
            }
            if flags.restart_active_on_upgrade {
                self.restart(&snapshot, &mut report);
            }
            return Err(e);
        }

        tracing::info!("Upgraded plugin {} from {} to {}", id, from, to);
        report.upgraded.push(id);

        if flags.restart_active_on_upgrade {
            self.restart(&snapshot, &mut report);
        }

        Ok(report)
    }

    /// Stop active plugins that optionally depend on `id`, so their next
    /// start picks it up.
    fn stop_optional_dependents(&self, id: &str, report: &mut ReconfigReport) -> Result<()> {
        let dependents: Vec<String> = self
            .dependents(id)
            .into_iter()
            .filter(|dependent| {
                self.is_active(dependent)
                    && self
                        .lookup(dependent)
                        .map(|d| d.optionally_depends_on(id))
                        .unwrap_or(false)
            })
            .collect();

        for dependent in dependents {
            report.absorb(self.stop_locked(&dependent)?);
        }
        Ok(())
    }

    /// Start every plugin of `snapshot` that is no longer active.
    fn restart(&self, snapshot: &[String], report: &mut ReconfigReport) {
        let down: Vec<&String> = snapshot
            .iter()
            .filter(|id| !self.is_active(id))
            .collect();

        for id in &down {
            if self.is_active(id) || !self.state.read().registry.contains(id) {
                continue;
            }
            if let Err(e) = self.start_locked(id) {
                tracing::warn!("Failed to restart {}: {}", id, e);
                report
                    .failures
                    .push(PluginFailure::new(id.as_str(), e.to_string()));
            }
        }

        report.restarted.extend(
            down.into_iter()
                .filter(|id| self.is_active(id))
                .cloned(),
        );
    }
}
