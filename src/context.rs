//! The plugin context: registry, resolver, live runtimes and scheduler of one
//! host.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};

use crate::descriptor::{DescriptorLoader, PluginDescriptor};
use crate::error::{Error, PluginFailure, Result};
use crate::lifecycle::{LifecycleHooks, PluginEvent, PluginLifecycle, PluginState};
use crate::loader::{EntryPointLoader, StaticLoader};
use crate::plugin::{PluginContext, PluginInfo};
use crate::reconfig::ReconfigFlags;
use crate::registry::{Extension, ExtensionPoint, PluginRegistry, RegistryConfig, RegistryStats};
use crate::resolver::DependencyResolver;
use crate::scheduler::{RunHandle, RunScheduler};

#[cfg(feature = "metrics-prometheus")]
use crate::metrics::{MetricsConfig, PluginMetrics};

/// Configuration for a plugin context.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ContextConfig {
    /// Registry configuration.
    pub registry: RegistryConfig,
    /// Plugin collections registered at creation.
    pub collections: Vec<PathBuf>,
    /// Startup arguments handed to plugins.
    pub args: Vec<String>,
    /// Default reconfiguration flags.
    pub flags: ReconfigFlags,
    /// Metrics configuration; metrics are off when unset.
    #[cfg(feature = "metrics-prometheus")]
    #[cfg_attr(feature = "serde", serde(skip))]
    pub metrics: Option<MetricsConfig>,
}

impl ContextConfig {
    /// Create a new context configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the registry configuration.
    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Add a plugin collection.
    pub fn with_collection(mut self, dir: impl Into<PathBuf>) -> Self {
        self.collections.push(dir.into());
        self
    }

    /// Set the startup arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the default reconfiguration flags.
    pub fn with_flags(mut self, flags: ReconfigFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Enable metrics collection.
    #[cfg(feature = "metrics-prometheus")]
    pub fn with_metrics(mut self, metrics: MetricsConfig) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Parse a configuration from TOML.
    #[cfg(feature = "serde")]
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load a configuration from a TOML file.
    #[cfg(feature = "serde")]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }
}

/// Registry and resolver, guarded together.
#[derive(Debug)]
pub(crate) struct ContextState {
    pub(crate) registry: PluginRegistry,
    pub(crate) resolver: DependencyResolver,
}

impl ContextState {
    /// Move resolved dependents of `id` back to installed. Returns the
    /// plugins that changed.
    pub(crate) fn unresolve_dependents(&mut self, id: &str) -> Vec<String> {
        let mut changed = Vec::new();
        for dependent in self.resolver.dependents(id) {
            if self.registry.state(&dependent) == PluginState::Resolved {
                self.registry.set_state(&dependent, PluginState::Installed);
                changed.push(dependent);
            }
        }
        changed
    }
}

/// A plugin context.
///
/// Every mutating operation holds a re-entrant lock for its whole duration,
/// so plugin code running inside a cascade can call back into the context on
/// the same thread while other threads wait. Registry and resolver sit
/// behind a reader/writer lock that is never held while plugin code runs.
pub struct Context {
    pub(crate) config: ContextConfig,
    ops: ReentrantMutex<()>,
    pub(crate) state: RwLock<ContextState>,
    pub(crate) runtimes: DashMap<String, Mutex<Box<dyn PluginLifecycle>>>,
    scheduler: Mutex<RunScheduler>,
    pub(crate) loader: Arc<dyn EntryPointLoader>,
    pub(crate) descriptor_loader: Option<Arc<dyn DescriptorLoader>>,
    hooks: RwLock<LifecycleHooks>,
    args: RwLock<Arc<[String]>>,
    pub(crate) args_frozen: AtomicBool,
    destroyed: AtomicBool,
    tearing_down: AtomicBool,
    #[cfg(feature = "metrics-prometheus")]
    pub(crate) metrics: Option<PluginMetrics>,
}

impl Context {
    /// Create a context whose entry points resolve through an empty
    /// [`StaticLoader`].
    pub fn new(config: ContextConfig) -> Result<Self> {
        Self::with_loader(config, Arc::new(StaticLoader::new()))
    }

    /// Create a context with the given entry point loader.
    pub fn with_loader(config: ContextConfig, loader: Arc<dyn EntryPointLoader>) -> Result<Self> {
        let mut registry = PluginRegistry::new(config.registry.clone());
        for dir in &config.collections {
            registry.register_collection(dir.clone());
        }

        #[cfg(feature = "metrics-prometheus")]
        let metrics = config
            .metrics
            .clone()
            .map(PluginMetrics::new)
            .transpose()?;

        let args: Arc<[String]> = config.args.clone().into();

        tracing::debug!(
            "Created plugin context with {} collection(s)",
            config.collections.len()
        );

        Ok(Self {
            config,
            ops: ReentrantMutex::new(()),
            state: RwLock::new(ContextState {
                registry,
                resolver: DependencyResolver::new(),
            }),
            runtimes: DashMap::new(),
            scheduler: Mutex::new(RunScheduler::new()),
            loader,
            descriptor_loader: default_descriptor_loader(),
            hooks: RwLock::new(LifecycleHooks::new()),
            args: RwLock::new(args),
            args_frozen: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            tearing_down: AtomicBool::new(false),
            #[cfg(feature = "metrics-prometheus")]
            metrics,
        })
    }

    /// Replace the loader used when scanning collections.
    pub fn with_descriptor_loader(mut self, loader: Arc<dyn DescriptorLoader>) -> Self {
        self.descriptor_loader = Some(loader);
        self
    }

    /// Get the context configuration.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Default reconfiguration flags.
    pub fn flags(&self) -> ReconfigFlags {
        self.config.flags
    }

    /// Get the metrics collector, if enabled.
    #[cfg(feature = "metrics-prometheus")]
    pub fn metrics(&self) -> Option<&PluginMetrics> {
        self.metrics.as_ref()
    }

    // Queries

    /// Get a descriptor by identifier.
    pub fn lookup(&self, id: &str) -> Option<Arc<PluginDescriptor>> {
        self.state.read().registry.lookup(id)
    }

    /// All installed descriptors, ordered by identifier.
    pub fn plugins(&self) -> Vec<Arc<PluginDescriptor>> {
        self.state.read().registry.all()
    }

    /// Current state of a plugin; `Uninstalled` when unknown.
    pub fn plugin_state(&self, id: &str) -> PluginState {
        self.state.read().registry.state(id)
    }

    /// Check if a plugin is active.
    pub fn is_active(&self, id: &str) -> bool {
        self.plugin_state(id) == PluginState::Active
    }

    /// Identifiers of active plugins, ascending.
    pub fn active_plugins(&self) -> Vec<String> {
        self.state.read().registry.by_state(PluginState::Active)
    }

    /// Snapshot of an installed plugin.
    pub fn plugin_info(&self, id: &str) -> Option<PluginInfo> {
        let state = self.state.read();
        let record = state.registry.record(id)?;
        let descriptor = record.descriptor().clone();

        Some(PluginInfo {
            // The registry and this snapshot hold one reference each.
            descriptor_holders: Arc::strong_count(&descriptor).saturating_sub(2),
            descriptor,
            state: record.state(),
            last_error: record.last_error().map(str::to_string),
            dependents: state.resolver.dependents(id),
            collection: record.collection().map(Path::to_path_buf),
        })
    }

    /// Handle scoped to plugin `id`, for host code acting on its behalf.
    pub fn plugin_context<'a>(&'a self, id: &'a str) -> PluginContext<'a> {
        PluginContext::new(self, id)
    }

    /// Plugins declaring a dependency on `id`, ascending.
    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.state.read().resolver.dependents(id)
    }

    /// Declared extension points.
    pub fn extension_points(&self) -> Vec<ExtensionPoint> {
        self.state.read().registry.extension_points()
    }

    /// Look up an extension point by global identifier.
    pub fn extension_point(&self, id: &str) -> Option<ExtensionPoint> {
        self.state.read().registry.extension_point(id)
    }

    /// Extensions contributed to a point.
    pub fn extensions(&self, point: &str) -> Vec<Extension> {
        self.state.read().registry.extensions(point)
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        self.state.read().registry.stats()
    }

    /// Registered plugin collections.
    pub fn collections(&self) -> Vec<PathBuf> {
        self.state.read().registry.collections()
    }

    // Configuration

    /// Register a plugin collection. Returns false if already registered.
    pub fn register_collection(&self, path: impl Into<PathBuf>) -> Result<bool> {
        let _ops = self.serialize();
        self.ensure_alive()?;
        Ok(self.state.write().registry.register_collection(path))
    }

    /// Remove a plugin collection; plugins installed from it stay.
    pub fn unregister_collection(&self, path: &Path) -> Result<bool> {
        let _ops = self.serialize();
        self.ensure_alive()?;
        Ok(self.state.write().registry.unregister_collection(path))
    }

    /// Replace the startup arguments. Only allowed before the first plugin
    /// activation.
    pub fn set_args<I, S>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _ops = self.serialize();
        self.ensure_alive()?;

        if self.args_frozen.load(Ordering::SeqCst) {
            return Err(Error::invalid_state(
                "no plugin activated",
                "plugins already activated",
            ));
        }

        *self.args.write() = args.into_iter().map(Into::into).collect();
        Ok(())
    }

    /// Startup arguments.
    pub fn args(&self) -> Arc<[String]> {
        self.args.read().clone()
    }

    /// Add a lifecycle event handler.
    ///
    /// Handlers run after the state change is visible, on the thread that
    /// made it, without the state or hook locks held. They may query or
    /// drive the context and register further handlers, which see events
    /// from the next one on.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&PluginEvent) + Send + Sync + 'static,
    {
        self.hooks.write().on_event(handler);
    }

    // Run functions

    /// Run every registration due in this step once, in registration order.
    ///
    /// Returns whether any registration remains pending. A nested call from
    /// inside a run function returns immediately.
    pub fn run_step(&self) -> Result<bool> {
        let _ops = self.serialize();
        self.ensure_alive()?;

        let due = self.scheduler.lock().begin_step();
        let Some(due) = due else {
            return Ok(!self.scheduler.lock().is_empty());
        };

        for seq in due {
            let dispatch = self.scheduler.lock().take(seq);
            let Some(mut dispatch) = dispatch else {
                continue;
            };

            let status = (dispatch.func)(&PluginContext::new(self, &dispatch.owner));

            #[cfg(feature = "metrics-prometheus")]
            if let Some(ref metrics) = self.metrics {
                metrics.record_run();
            }

            self.scheduler.lock().finish(dispatch, status);
        }

        Ok(self.scheduler.lock().end_step())
    }

    /// Step until no registration is pending. Returns the number of steps.
    pub fn run_until_idle(&self) -> Result<usize> {
        let _ops = self.serialize();
        self.ensure_alive()?;

        if self.scheduler.lock().is_stepping() {
            return Ok(0);
        }

        let mut steps = 0;
        while !self.scheduler.lock().is_empty() {
            steps += 1;
            if !self.run_step()? {
                break;
            }
        }
        Ok(steps)
    }

    /// Cancel a run function registration.
    pub fn cancel_run_function(&self, handle: RunHandle) -> bool {
        let _ops = self.serialize();
        self.scheduler.lock().cancel(handle)
    }

    /// Number of pending run function registrations.
    pub fn pending_run_functions(&self) -> usize {
        self.scheduler.lock().len()
    }

    // Teardown

    /// Stop and uninstall every plugin and clear the scheduler.
    ///
    /// Every teardown is attempted once; failures are reported together
    /// after all plugins were visited. Calling this again is a no-op.
    pub fn destroy(&self) -> Result<()> {
        let _ops = self.serialize();
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("Destroying plugin context");
        self.tearing_down.store(true, Ordering::SeqCst);

        let order = {
            let state = self.state.read();
            state.resolver.shutdown_order(&state.registry)
        };

        let mut failures = Vec::new();

        for id in &order {
            if self.plugin_state(id) != PluginState::Active {
                continue;
            }
            if let Err(e) = self.deactivate(id) {
                if e.is_fatal() {
                    tracing::error!("Fatal error stopping {}: {}", id, e);
                } else {
                    tracing::warn!("Failed to stop {}: {}", id, e);
                }
                failures.push(PluginFailure::new(id.clone(), e.to_string()));
            }
        }

        for id in &order {
            match self.plugin_state(id) {
                PluginState::Uninstalled => continue,
                // Mid-transition on this thread; finished by the outer frame.
                PluginState::Starting | PluginState::Stopping => {
                    tracing::debug!("Deferring uninstall of {}", id);
                    continue;
                }
                _ => {}
            }
            if let Err(e) = self.uninstall_locked(id) {
                tracing::warn!("Failed to uninstall {}: {}", id, e);
                failures.push(PluginFailure::new(id.clone(), e.to_string()));
            }
        }

        self.scheduler.lock().clear();
        self.runtimes.clear();
        self.tearing_down.store(false, Ordering::SeqCst);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::TeardownFailed(failures))
        }
    }

    /// Check if the context was destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    // Internals

    pub(crate) fn serialize(&self) -> ReentrantMutexGuard<'_, ()> {
        self.ops.lock()
    }

    pub(crate) fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            Err(Error::ContextDestroyed)
        } else {
            Ok(())
        }
    }

    /// Whether `destroy` is running its own teardown pass.
    pub(crate) fn is_tearing_down(&self) -> bool {
        self.tearing_down.load(Ordering::SeqCst)
    }

    pub(crate) fn scheduler(&self) -> &Mutex<RunScheduler> {
        &self.scheduler
    }

    /// Set a plugin's state and notify listeners. Returns the previous
    /// state, or `None` if the plugin is not installed.
    pub(crate) fn transition(&self, id: &str, new: PluginState) -> Option<PluginState> {
        let old = self.state.write().registry.set_state(id, new)?;
        if old != new {
            tracing::debug!("Plugin {}: {} -> {}", id, old, new);
            self.emit(&PluginEvent::new(id, old, new));
        }
        Some(old)
    }

    pub(crate) fn set_error(&self, id: &str, error: Option<String>) {
        self.state.write().registry.set_error(id, error);
    }

    pub(crate) fn emit(&self, event: &PluginEvent) {
        let handlers = self.hooks.read().snapshot();
        for handler in handlers {
            handler(event);
        }
    }
}

#[cfg(feature = "serde")]
fn default_descriptor_loader() -> Option<Arc<dyn DescriptorLoader>> {
    Some(Arc::new(crate::descriptor::TomlDescriptorLoader::default()))
}

#[cfg(not(feature = "serde"))]
fn default_descriptor_loader() -> Option<Arc<dyn DescriptorLoader>> {
    None
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("plugin_count", &self.state.read().registry.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::warn!("Plugin context teardown incomplete: {}", e);
        }
    }
}
