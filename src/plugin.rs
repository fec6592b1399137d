//! Per-plugin view of the context and plugin information snapshots.

use std::path::PathBuf;
use std::sync::Arc;

use crate::context::Context;
use crate::descriptor::PluginDescriptor;
use crate::error::{Error, Result};
use crate::lifecycle::PluginState;
use crate::registry::Extension;
use crate::scheduler::{RunHandle, RunMode, RunStatus};

/// Handle given to plugin code while it runs.
///
/// Borrowed for the duration of a lifecycle call or run function; plugin
/// code reaches the context through it and may call back into any context
/// operation on the same thread.
#[derive(Clone, Copy)]
pub struct PluginContext<'a> {
    context: &'a Context,
    plugin: &'a str,
}

impl<'a> PluginContext<'a> {
    pub(crate) fn new(context: &'a Context, plugin: &'a str) -> Self {
        Self { context, plugin }
    }

    /// Identifier of the plugin this handle belongs to.
    pub fn plugin_id(&self) -> &'a str {
        self.plugin
    }

    /// The owning context.
    pub fn context(&self) -> &'a Context {
        self.context
    }

    /// Startup arguments of the host.
    pub fn args(&self) -> Arc<[String]> {
        self.context.args()
    }

    /// Descriptor of this plugin.
    pub fn descriptor(&self) -> Option<Arc<PluginDescriptor>> {
        self.context.lookup(self.plugin)
    }

    /// Current state of this plugin.
    pub fn state(&self) -> PluginState {
        self.context.plugin_state(self.plugin)
    }

    /// Extensions contributed to one of this plugin's extension points,
    /// given by its local identifier.
    pub fn extensions(&self, local_point: &str) -> Vec<Extension> {
        self.context
            .extensions(&format!("{}.{}", self.plugin, local_point))
    }

    /// Register a run function owned by this plugin.
    ///
    /// Only allowed while the plugin is starting or active. The registration
    /// is dropped when the plugin enters `stopping`.
    pub fn register_run_function<F>(&self, mode: RunMode, f: F) -> Result<RunHandle>
    where
        F: FnMut(&PluginContext<'_>) -> RunStatus + Send + 'static,
    {
        let _ops = self.context.serialize();
        self.context.ensure_alive()?;

        let state = self.context.plugin_state(self.plugin);
        if !state.accepts_run_functions() {
            return Err(Error::invalid_state("starting or active", state.to_string()));
        }

        Ok(self
            .context
            .scheduler()
            .lock()
            .register(self.plugin, mode, Box::new(f)))
    }
}

impl std::fmt::Debug for PluginContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin", &self.plugin)
            .finish()
    }
}

/// Snapshot of an installed plugin.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    /// Plugin descriptor.
    pub descriptor: Arc<PluginDescriptor>,
    /// Lifecycle state at the time of the snapshot.
    pub state: PluginState,
    /// Error recorded by the last failed activation.
    pub last_error: Option<String>,
    /// Plugins declaring a dependency on this one.
    pub dependents: Vec<String>,
    /// Collection the plugin was installed from.
    pub collection: Option<PathBuf>,
    /// Holders of the descriptor outside the registry, this snapshot
    /// excluded.
    pub descriptor_holders: usize,
}

impl PluginInfo {
    /// Plugin identifier.
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Plugin version.
    pub fn version(&self) -> &semver::Version {
        &self.descriptor.version
    }

    /// Check if the plugin is active.
    pub fn is_active(&self) -> bool {
        self.state == PluginState::Active
    }
}
