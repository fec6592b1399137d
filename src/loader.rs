//! Entry point loading.
//!
//! A descriptor names its runtime through an entry point reference. The
//! context hands that reference to an [`EntryPointLoader`] when the plugin is
//! activated and drops the produced runtime when it stops.

use std::sync::Arc;

use dashmap::DashMap;

use crate::descriptor::PluginDescriptor;
use crate::error::{Error, Result};
use crate::lifecycle::{InertRuntime, PluginLifecycle};

/// Resolves the runtime half of a plugin.
pub trait EntryPointLoader: Send + Sync {
    /// Produce a fresh runtime for `descriptor`.
    fn load(&self, descriptor: &PluginDescriptor) -> Result<Box<dyn PluginLifecycle>>;
}

type Factory = Arc<dyn Fn() -> Box<dyn PluginLifecycle> + Send + Sync>;

/// In-process table of named runtime factories.
///
/// Descriptors without an entry point get a runtime that does nothing.
#[derive(Default)]
pub struct StaticLoader {
    factories: DashMap<String, Factory>,
}

impl StaticLoader {
    /// Create an empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under an entry point name, replacing any previous
    /// one.
    pub fn register<F, L>(&self, entry: impl Into<String>, factory: F)
    where
        F: Fn() -> L + Send + Sync + 'static,
        L: PluginLifecycle + 'static,
    {
        let entry = entry.into();
        tracing::debug!("Registered entry point {}", entry);
        self.factories
            .insert(entry, Arc::new(move || Box::new(factory()) as Box<dyn PluginLifecycle>));
    }

    /// Builder variant of [`StaticLoader::register`].
    pub fn with<F, L>(self, entry: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> L + Send + Sync + 'static,
        L: PluginLifecycle + 'static,
    {
        self.register(entry, factory);
        self
    }

    /// Remove a factory.
    pub fn unregister(&self, entry: &str) -> bool {
        self.factories.remove(entry).is_some()
    }

    /// Check if an entry point is known.
    pub fn contains(&self, entry: &str) -> bool {
        self.factories.contains_key(entry)
    }

    /// Number of registered entry points.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if no entry point is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl EntryPointLoader for StaticLoader {
    fn load(&self, descriptor: &PluginDescriptor) -> Result<Box<dyn PluginLifecycle>> {
        let Some(entry) = descriptor.runtime.as_deref() else {
            return Ok(Box::new(InertRuntime));
        };

        // Clone the factory out so the shard lock is not held while it runs.
        let factory = self
            .factories
            .get(entry)
            .map(|f| f.value().clone())
            .ok_or_else(|| Error::EntryPointNotFound(entry.to_string()))?;

        Ok(factory())
    }
}

impl std::fmt::Debug for StaticLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticLoader")
            .field("entry_points", &self.factories.len())
            .finish()
    }
}
