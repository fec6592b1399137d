//! Plugin lifecycle states, runtime hooks and state-change events.

use std::sync::Arc;
use std::time::Instant;

use crate::plugin::PluginContext;

/// Plugin lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PluginState {
    /// Plugin is not known to the context.
    Uninstalled,
    /// Descriptor known, nothing loaded.
    Installed,
    /// Dependency closure computed and satisfied. Also the stopped state.
    Resolved,
    /// Plugin runtime is being started.
    Starting,
    /// Plugin is running.
    Active,
    /// Plugin runtime is being stopped.
    Stopping,
}

impl PluginState {
    /// Check if the plugin can be uninstalled.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Installed | Self::Resolved)
    }

    /// Check if the plugin's runtime is live or transitioning.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Active | Self::Stopping)
    }

    /// Check if the plugin may register run functions.
    pub fn accepts_run_functions(&self) -> bool {
        matches!(self, Self::Starting | Self::Active)
    }

    /// Check if the plugin is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Uninstalled)
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Uninstalled => "Plugin not installed",
            Self::Installed => "Plugin installed, dependencies not resolved",
            Self::Resolved => "Plugin resolved and stopped",
            Self::Starting => "Plugin starting",
            Self::Active => "Plugin active",
            Self::Stopping => "Plugin stopping",
        }
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninstalled => "uninstalled",
            Self::Installed => "installed",
            Self::Resolved => "resolved",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
        };
        write!(f, "{}", name)
    }
}

/// Runtime half of a plugin, produced by an entry point loader.
///
/// `on_start` runs on the `starting -> active` edge and `on_stop` on the
/// `stopping -> resolved` edge, both on the thread driving the cascade.
/// Either may call back into the context through `ctx`.
pub trait PluginLifecycle: Send {
    /// Start the plugin.
    fn on_start(&mut self, ctx: &PluginContext<'_>) -> crate::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Stop the plugin.
    ///
    /// Returning [`crate::Error::Fatal`] aborts the surrounding stop cascade.
    fn on_stop(&mut self, ctx: &PluginContext<'_>) -> crate::Result<()> {
        let _ = ctx;
        Ok(())
    }
}

/// Runtime used for plugins that declare no entry point.
#[derive(Debug, Default)]
pub(crate) struct InertRuntime;

impl PluginLifecycle for InertRuntime {}

/// State change notification.
#[derive(Debug, Clone)]
pub struct PluginEvent {
    /// Plugin identifier.
    pub plugin: String,
    /// Previous state.
    pub old: PluginState,
    /// New state.
    pub new: PluginState,
    /// Time of the change.
    pub at: Instant,
}

impl PluginEvent {
    /// Create an event stamped now.
    pub fn new(plugin: impl Into<String>, old: PluginState, new: PluginState) -> Self {
        Self {
            plugin: plugin.into(),
            old,
            new,
            at: Instant::now(),
        }
    }

    /// Get the event name.
    pub fn event_name(&self) -> &'static str {
        match (self.old, self.new) {
            (PluginState::Uninstalled, _) => "installed",
            (_, PluginState::Uninstalled) => "uninstalled",
            (PluginState::Installed, PluginState::Resolved) => "resolved",
            (_, PluginState::Installed) => "unresolved",
            (_, PluginState::Starting) => "starting",
            (_, PluginState::Active) => "started",
            (_, PluginState::Stopping) => "stopping",
            (PluginState::Starting, PluginState::Resolved) => "failed",
            (_, PluginState::Resolved) => "stopped",
        }
    }
}

pub(crate) type EventHandler = Arc<dyn Fn(&PluginEvent) + Send + Sync>;

/// Hooks for lifecycle events.
pub struct LifecycleHooks {
    handlers: Vec<EventHandler>,
}

impl LifecycleHooks {
    /// Create new lifecycle hooks.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a lifecycle event handler.
    pub fn on_event<F>(&mut self, handler: F)
    where
        F: Fn(&PluginEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(handler));
    }

    /// Handlers registered so far, callable without holding the hooks.
    pub(crate) fn snapshot(&self) -> Vec<EventHandler> {
        self.handlers.clone()
    }

    /// Emit a lifecycle event.
    pub fn emit(&self, event: &PluginEvent) {
        for handler in &self.handlers {
            handler(event);
        }
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for LifecycleHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("handler_count", &self.handlers.len())
            .finish()
    }
}
