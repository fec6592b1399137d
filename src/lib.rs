//! # plugframe
//!
//! Plug-in framework runtime: installs plugin descriptors, resolves their
//! dependencies, drives plugins through an activation state machine,
//! schedules cooperative background work and reconfigures a running host
//! without restarting it.
//!
//! This crate provides:
//! - **Registry** - Installed descriptors, plugin collections and extensions
//! - **Dependency Resolution** - Cycle detection and activation/deactivation orderings
//! - **Lifecycle Management** - Start and stop cascades with per-plugin failure containment
//! - **Run Functions** - Cooperative work queue driven by the host loop
//! - **Live Reconfiguration** - Install, upgrade, uninstall and collection scans
//! - **Metrics Hooks** - Track activations and run function calls
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use plugframe::{Context, ContextConfig, DescriptorBuilder, StaticLoader};
//!
//! let loader = StaticLoader::new().with("greeter::main", || Greeter::default());
//! let ctx = Context::with_loader(ContextConfig::default(), Arc::new(loader))?;
//!
//! ctx.install_plugin(DescriptorBuilder::new("core", "1.0.0").build()?)?;
//! ctx.install_plugin(
//!     DescriptorBuilder::new("greeter", "1.0.0")
//!         .requires("core", "^1")
//!         .runtime("greeter::main")
//!         .build()?,
//! )?;
//!
//! // Starts core, then greeter.
//! ctx.start("greeter")?;
//!
//! // From the host's main loop.
//! while ctx.run_step()? {}
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): TOML/JSON descriptors and TOML configuration
//! - `watch`: Filesystem watching of plugin collections
//! - `metrics-prometheus`: Prometheus metrics integration

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod context;
mod controller;
mod descriptor;
mod error;
mod lifecycle;
mod loader;
mod plugin;
mod reconfig;
mod registry;
mod resolver;
mod scheduler;

#[cfg(feature = "watch")]
mod watcher;

#[cfg(feature = "metrics-prometheus")]
mod metrics;

pub use context::{Context, ContextConfig};
pub use descriptor::{
    Dependency, DescriptorBuilder, DescriptorLoader, ExtensionDecl, ExtensionPointDecl,
    PluginDescriptor,
};
pub use error::{Error, PluginFailure, Result};
pub use lifecycle::{LifecycleHooks, PluginEvent, PluginLifecycle, PluginState};
pub use loader::{EntryPointLoader, StaticLoader};
pub use plugin::{PluginContext, PluginInfo};
pub use reconfig::{ReconfigFlags, ReconfigReport};
pub use registry::{
    Extension, ExtensionPoint, InstallOutcome, PluginRecord, PluginRegistry, RegistryConfig,
    RegistryStats,
};
pub use resolver::{ActivationPlan, DependencyResolver};
pub use scheduler::{RunFunction, RunHandle, RunMode, RunScheduler, RunStatus};

#[cfg(feature = "serde")]
pub use descriptor::TomlDescriptorLoader;

#[cfg(feature = "watch")]
pub use watcher::{CollectionWatcher, WatchConfig};

#[cfg(feature = "metrics-prometheus")]
pub use metrics::{MetricsConfig, PluginMetrics};

/// Crate version for compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
