//! Plugin registry: installed descriptors, instance records, collections
//! and the extension indices.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use semver::Version;

use crate::descriptor::{DescriptorLoader, PluginDescriptor};
use crate::error::{Error, Result};
use crate::lifecycle::PluginState;

/// Configuration for the plugin registry.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RegistryConfig {
    /// Maximum number of plugins allowed.
    pub max_plugins: usize,
    /// Whether installing a different version replaces a stopped plugin.
    pub allow_replace: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_plugins: 1024,
            allow_replace: false,
        }
    }
}

impl RegistryConfig {
    /// Create a new registry configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of plugins.
    pub fn with_max_plugins(mut self, max: usize) -> Self {
        self.max_plugins = max;
        self
    }

    /// Allow version replacement on install.
    pub fn with_allow_replace(mut self, allow: bool) -> Self {
        self.allow_replace = allow;
        self
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Total plugins installed.
    pub total: usize,
    /// Plugins installed but unresolved.
    pub installed: usize,
    /// Plugins resolved and stopped.
    pub resolved: usize,
    /// Plugins active.
    pub active: usize,
    /// Plugins starting or stopping.
    pub transitioning: usize,
}

/// Runtime record attached to an installed descriptor.
#[derive(Debug, Clone)]
pub struct PluginRecord {
    descriptor: Arc<PluginDescriptor>,
    state: PluginState,
    last_error: Option<String>,
    collection: Option<PathBuf>,
}

impl PluginRecord {
    /// Installed descriptor.
    pub fn descriptor(&self) -> &Arc<PluginDescriptor> {
        &self.descriptor
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PluginState {
        self.state
    }

    /// Error recorded by the last failed start.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Collection the plugin was installed from.
    pub fn collection(&self) -> Option<&Path> {
        self.collection.as_deref()
    }
}

/// Result of [`PluginRegistry::install`].
#[derive(Debug, Clone)]
pub enum InstallOutcome {
    /// Descriptor was added.
    Installed(Arc<PluginDescriptor>),
    /// Same identifier and version already installed.
    Unchanged(Arc<PluginDescriptor>),
    /// A stopped plugin with another version was replaced.
    Replaced {
        /// Descriptor that was removed.
        old: Arc<PluginDescriptor>,
        /// Descriptor now installed.
        new: Arc<PluginDescriptor>,
    },
}

impl InstallOutcome {
    /// The descriptor installed after the call.
    pub fn descriptor(&self) -> &Arc<PluginDescriptor> {
        match self {
            Self::Installed(d) | Self::Unchanged(d) => d,
            Self::Replaced { new, .. } => new,
        }
    }
}

/// Extension point indexed by its global identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionPoint {
    /// Global identifier, `<plugin>.<local id>`.
    pub id: String,
    /// Declaring plugin.
    pub plugin: String,
    /// Display name.
    pub name: Option<String>,
    /// Configuration schema reference.
    pub schema: Option<String>,
}

/// Extension contributed to an extension point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    /// Global identifier of the extension point.
    pub point: String,
    /// Contributing plugin.
    pub plugin: String,
    /// Global identifier, when the extension declared a local one.
    pub id: Option<String>,
    /// Display name.
    pub name: Option<String>,
    /// Extension configuration.
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct CollectionState {
    seen: BTreeMap<PathBuf, (String, Version)>,
}

/// Registry of installed plugins and plugin collections.
pub struct PluginRegistry {
    config: RegistryConfig,
    plugins: BTreeMap<String, PluginRecord>,
    collections: BTreeMap<PathBuf, CollectionState>,
    extension_points: BTreeMap<String, ExtensionPoint>,
    extensions: BTreeMap<String, Vec<Extension>>,
}

impl PluginRegistry {
    /// Create a new plugin registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            plugins: BTreeMap::new(),
            collections: BTreeMap::new(),
            extension_points: BTreeMap::new(),
            extensions: BTreeMap::new(),
        }
    }

    /// Create with default configuration.
    pub fn default_config() -> Self {
        Self::new(RegistryConfig::default())
    }

    /// Get the registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Install a descriptor.
    pub fn install(&mut self, descriptor: PluginDescriptor, replace: bool) -> Result<InstallOutcome> {
        descriptor.validate()?;

        let old = match self.plugins.get(&descriptor.id) {
            Some(existing) if existing.descriptor.version == descriptor.version => {
                return Ok(InstallOutcome::Unchanged(existing.descriptor.clone()));
            }
            Some(existing) => {
                if !(replace || self.config.allow_replace) {
                    return Err(Error::DuplicateId {
                        id: descriptor.id.clone(),
                        installed: existing.descriptor.version.to_string(),
                        offered: descriptor.version.to_string(),
                    });
                }
                if !existing.state.is_stopped() {
                    return Err(Error::PluginActive(descriptor.id.clone()));
                }
                Some(self.remove(&descriptor.id)?)
            }
            None => {
                if self.plugins.len() >= self.config.max_plugins {
                    return Err(Error::RegistryFull(self.config.max_plugins));
                }
                None
            }
        };

        let collection = descriptor
            .path
            .as_deref()
            .and_then(Path::parent)
            .filter(|parent| self.collections.contains_key(*parent))
            .map(Path::to_path_buf);

        let descriptor = Arc::new(descriptor);
        self.index_extensions(&descriptor);
        self.plugins.insert(
            descriptor.id.clone(),
            PluginRecord {
                descriptor: descriptor.clone(),
                state: PluginState::Installed,
                last_error: None,
                collection,
            },
        );

        tracing::debug!("Installed plugin {} {}", descriptor.id, descriptor.version);

        Ok(match old {
            Some(old) => InstallOutcome::Replaced {
                old,
                new: descriptor,
            },
            None => InstallOutcome::Installed(descriptor),
        })
    }

    /// Uninstall a stopped plugin.
    pub fn uninstall(&mut self, id: &str) -> Result<Arc<PluginDescriptor>> {
        let record = self
            .plugins
            .get(id)
            .ok_or_else(|| Error::plugin_not_found(id))?;

        if !record.state.is_stopped() {
            return Err(Error::PluginActive(id.to_string()));
        }

        let descriptor = self.remove(id)?;
        tracing::debug!("Uninstalled plugin {} {}", descriptor.id, descriptor.version);
        Ok(descriptor)
    }

    fn remove(&mut self, id: &str) -> Result<Arc<PluginDescriptor>> {
        let record = self
            .plugins
            .remove(id)
            .ok_or_else(|| Error::plugin_not_found(id))?;

        self.extension_points.retain(|_, point| point.plugin != id);
        self.extensions.retain(|_, list| {
            list.retain(|ext| ext.plugin != id);
            !list.is_empty()
        });

        Ok(record.descriptor)
    }

    fn index_extensions(&mut self, descriptor: &PluginDescriptor) {
        for point in &descriptor.extension_points {
            let id = descriptor.qualify(&point.id);
            self.extension_points.insert(
                id.clone(),
                ExtensionPoint {
                    id,
                    plugin: descriptor.id.clone(),
                    name: point.name.clone(),
                    schema: point.schema.clone(),
                },
            );
        }

        for ext in &descriptor.extensions {
            self.extensions
                .entry(ext.point.clone())
                .or_default()
                .push(Extension {
                    point: ext.point.clone(),
                    plugin: descriptor.id.clone(),
                    id: ext.id.as_deref().map(|local| descriptor.qualify(local)),
                    name: ext.name.clone(),
                    config: ext.config.clone(),
                });
        }
    }

    /// Get a descriptor by identifier.
    pub fn lookup(&self, id: &str) -> Option<Arc<PluginDescriptor>> {
        self.plugins.get(id).map(|r| r.descriptor.clone())
    }

    /// Get the instance record of a plugin.
    pub fn record(&self, id: &str) -> Option<&PluginRecord> {
        self.plugins.get(id)
    }

    /// Check if a plugin is installed.
    pub fn contains(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    /// Current state of a plugin; `Uninstalled` when unknown.
    pub fn state(&self, id: &str) -> PluginState {
        self.plugins
            .get(id)
            .map(|r| r.state)
            .unwrap_or(PluginState::Uninstalled)
    }

    /// All installed descriptors, ordered by identifier.
    pub fn all(&self) -> Vec<Arc<PluginDescriptor>> {
        self.plugins.values().map(|r| r.descriptor.clone()).collect()
    }

    /// All installed identifiers, ascending.
    pub fn ids(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    /// Identifiers of plugins in a given state.
    pub fn by_state(&self, state: PluginState) -> Vec<String> {
        self.plugins
            .iter()
            .filter(|(_, r)| r.state == state)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Get plugin count.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total: self.plugins.len(),
            ..RegistryStats::default()
        };

        for record in self.plugins.values() {
            match record.state {
                PluginState::Installed => stats.installed += 1,
                PluginState::Resolved => stats.resolved += 1,
                PluginState::Active => stats.active += 1,
                PluginState::Starting | PluginState::Stopping => stats.transitioning += 1,
                PluginState::Uninstalled => {}
            }
        }

        stats
    }

    pub(crate) fn set_state(&mut self, id: &str, state: PluginState) -> Option<PluginState> {
        let record = self.plugins.get_mut(id)?;
        let old = record.state;
        record.state = state;
        Some(old)
    }

    pub(crate) fn set_error(&mut self, id: &str, error: Option<String>) {
        if let Some(record) = self.plugins.get_mut(id) {
            record.last_error = error;
        }
    }

    /// Declared extension points, ordered by global identifier.
    pub fn extension_points(&self) -> Vec<ExtensionPoint> {
        self.extension_points.values().cloned().collect()
    }

    /// Look up an extension point.
    pub fn extension_point(&self, id: &str) -> Option<ExtensionPoint> {
        self.extension_points.get(id).cloned()
    }

    /// Extensions contributed to a point, in installation order.
    pub fn extensions(&self, point: &str) -> Vec<Extension> {
        self.extensions.get(point).cloned().unwrap_or_default()
    }

    /// Register a plugin collection. Returns false if already registered.
    pub fn register_collection(&mut self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        if self.collections.contains_key(&path) {
            return false;
        }
        tracing::debug!("Registered plugin collection {}", path.display());
        self.collections.insert(path, CollectionState::default());
        true
    }

    /// Remove a plugin collection. Installed plugins are left in place.
    pub fn unregister_collection(&mut self, path: &Path) -> bool {
        self.collections.remove(path).is_some()
    }

    /// Registered collections.
    pub fn collections(&self) -> Vec<PathBuf> {
        self.collections.keys().cloned().collect()
    }

    /// Scan a collection for descriptors not handled before.
    ///
    /// Each subdirectory holds at most one descriptor. Only descriptors that
    /// are new or changed since they were last acknowledged, and not already
    /// installed at that version, are returned; nothing is installed. A
    /// returned descriptor keeps being offered by later scans until it is
    /// passed to [`PluginRegistry::acknowledge`].
    pub fn scan(
        &mut self,
        collection: &Path,
        loader: &dyn DescriptorLoader,
    ) -> Result<Vec<PluginDescriptor>> {
        let previous = match self.collections.get(collection) {
            Some(state) => state.seen.clone(),
            None => return Err(Error::CollectionNotFound(collection.to_path_buf())),
        };

        if !collection.is_dir() {
            tracing::warn!("Plugin collection does not exist: {}", collection.display());
            return Ok(Vec::new());
        }

        let mut dirs: Vec<PathBuf> = std::fs::read_dir(collection)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();

        let mut seen = BTreeMap::new();
        let mut discovered = Vec::new();

        for dir in dirs {
            let descriptor = match loader.load(&dir) {
                Ok(Some(descriptor)) => descriptor,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Skipping plugin in {}: {}", dir.display(), e);
                    continue;
                }
            };

            let key = (descriptor.id.clone(), descriptor.version.clone());
            let changed = previous.get(&dir) != Some(&key);
            let installed = self
                .plugins
                .get(&descriptor.id)
                .map(|r| r.descriptor.version == descriptor.version)
                .unwrap_or(false);

            if changed && !installed {
                discovered.push(descriptor);
            } else {
                seen.insert(dir, key);
            }
        }

        if let Some(state) = self.collections.get_mut(collection) {
            state.seen = seen;
        }

        tracing::debug!(
            "Scanned collection {}: {} new descriptor(s)",
            collection.display(),
            discovered.len()
        );

        Ok(discovered)
    }

    /// Record that a scanned descriptor was dealt with, so later scans skip
    /// its directory until the descriptor there changes.
    pub fn acknowledge(&mut self, collection: &Path, descriptor: &PluginDescriptor) -> bool {
        let (Some(dir), Some(state)) = (
            descriptor.path.as_ref(),
            self.collections.get_mut(collection),
        ) else {
            return false;
        };
        state.seen.insert(
            dir.clone(),
            (descriptor.id.clone(), descriptor.version.clone()),
        );
        true
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("config", &self.config)
            .field("plugin_count", &self.plugins.len())
            .field("collection_count", &self.collections.len())
            .finish()
    }
}
