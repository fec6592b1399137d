//! Plugin descriptor schema and validation.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use semver::{Version, VersionReq};

use crate::error::{Error, Result};

/// Declared dependency on another plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Dependency {
    /// Identifier of the required plugin.
    pub id: String,
    /// Version requirement in semver syntax. Empty matches any version.
    #[cfg_attr(feature = "serde", serde(default, rename = "version"))]
    pub requirement: String,
    /// Whether this dependency is optional.
    #[cfg_attr(feature = "serde", serde(default))]
    pub optional: bool,
}

impl Dependency {
    /// Create a new required dependency.
    pub fn required(id: impl Into<String>, requirement: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            requirement: requirement.into(),
            optional: false,
        }
    }

    /// Create a new optional dependency.
    pub fn optional(id: impl Into<String>, requirement: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            requirement: requirement.into(),
            optional: true,
        }
    }

    /// Parse the version requirement.
    pub fn version_req(&self) -> Result<VersionReq> {
        let req = self.requirement.trim();
        if req.is_empty() {
            return Ok(VersionReq::STAR);
        }
        VersionReq::parse(req).map_err(|e| {
            Error::invalid_descriptor(format!(
                "dependency {}: bad version requirement {:?}: {}",
                self.id, self.requirement, e
            ))
        })
    }

    /// Check whether a concrete version satisfies this dependency.
    pub fn matches(&self, version: &Version) -> bool {
        self.version_req()
            .map(|req| req.matches(version))
            .unwrap_or(false)
    }

    /// Human-readable requirement, `*` when unconstrained.
    pub fn requirement_display(&self) -> &str {
        if self.requirement.trim().is_empty() {
            "*"
        } else {
            &self.requirement
        }
    }
}

/// Extension point declared by a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExtensionPointDecl {
    /// Identifier local to the declaring plugin.
    pub id: String,
    /// Display name.
    #[cfg_attr(feature = "serde", serde(default))]
    pub name: Option<String>,
    /// Reference to a schema describing extension configuration.
    #[cfg_attr(feature = "serde", serde(default))]
    pub schema: Option<String>,
}

impl ExtensionPointDecl {
    /// Create a new extension point declaration.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            schema: None,
        }
    }
}

/// Extension contributed by a plugin to some extension point.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExtensionDecl {
    /// Global identifier of the target extension point.
    pub point: String,
    /// Identifier local to the contributing plugin.
    #[cfg_attr(feature = "serde", serde(default))]
    pub id: Option<String>,
    /// Display name.
    #[cfg_attr(feature = "serde", serde(default))]
    pub name: Option<String>,
    /// Configuration passed to the extension point's consumer.
    #[cfg_attr(feature = "serde", serde(default))]
    pub config: BTreeMap<String, String>,
}

impl ExtensionDecl {
    /// Create a new extension for the given point.
    pub fn new(point: impl Into<String>) -> Self {
        Self {
            point: point.into(),
            id: None,
            name: None,
            config: BTreeMap::new(),
        }
    }

    /// Set the local identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Add a configuration entry.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// Immutable plugin metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PluginDescriptor {
    /// Plugin identifier (unique within a context).
    pub id: String,

    /// Plugin version.
    pub version: Version,

    /// Human-readable name.
    #[cfg_attr(feature = "serde", serde(default))]
    pub name: Option<String>,

    /// Plugin provider.
    #[cfg_attr(feature = "serde", serde(default))]
    pub provider: Option<String>,

    /// Declared dependencies.
    #[cfg_attr(feature = "serde", serde(default))]
    pub dependencies: Vec<Dependency>,

    /// Declared extension points.
    #[cfg_attr(feature = "serde", serde(default, rename = "extension-points"))]
    pub extension_points: Vec<ExtensionPointDecl>,

    /// Declared extensions.
    #[cfg_attr(feature = "serde", serde(default))]
    pub extensions: Vec<ExtensionDecl>,

    /// Runtime entry point reference, resolved by an entry point loader.
    #[cfg_attr(feature = "serde", serde(default))]
    pub runtime: Option<String>,

    /// Directory the descriptor was loaded from.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub path: Option<PathBuf>,
}

impl PluginDescriptor {
    /// Create a new descriptor with required fields.
    pub fn new(id: impl Into<String>, version: Version) -> Self {
        Self {
            id: id.into(),
            version,
            name: None,
            provider: None,
            dependencies: Vec::new(),
            extension_points: Vec::new(),
            extensions: Vec::new(),
            runtime: None,
            path: None,
        }
    }

    /// Load descriptor from a TOML file.
    #[cfg(feature = "serde")]
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse descriptor from TOML string.
    #[cfg(feature = "serde")]
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::DescriptorParse(e.to_string()))
    }

    /// Parse descriptor from JSON string.
    #[cfg(feature = "serde")]
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::DescriptorParse(e.to_string()))
    }

    /// Serialize to TOML string.
    #[cfg(feature = "serde")]
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::DescriptorParse(e.to_string()))
    }

    /// Validate the descriptor.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::invalid_descriptor("missing identifier"));
        }
        if self.id.chars().any(char::is_whitespace) {
            return Err(Error::invalid_descriptor(format!(
                "identifier {:?} contains whitespace",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if dep.id.trim().is_empty() {
                return Err(Error::invalid_descriptor(format!(
                    "{}: dependency without identifier",
                    self.id
                )));
            }
            if dep.id == self.id {
                return Err(Error::invalid_descriptor(format!(
                    "{}: plugin depends on itself",
                    self.id
                )));
            }
            if !seen.insert(dep.id.as_str()) {
                return Err(Error::invalid_descriptor(format!(
                    "{}: dependency {} declared twice",
                    self.id, dep.id
                )));
            }
            dep.version_req()?;
        }

        let mut points = HashSet::new();
        for point in &self.extension_points {
            if point.id.trim().is_empty() {
                return Err(Error::invalid_descriptor(format!(
                    "{}: extension point without identifier",
                    self.id
                )));
            }
            if !points.insert(point.id.as_str()) {
                return Err(Error::invalid_descriptor(format!(
                    "{}: extension point {} declared twice",
                    self.id, point.id
                )));
            }
        }

        let mut extensions = HashSet::new();
        for ext in &self.extensions {
            if ext.point.trim().is_empty() {
                return Err(Error::invalid_descriptor(format!(
                    "{}: extension without target point",
                    self.id
                )));
            }
            if let Some(ref id) = ext.id {
                if !extensions.insert(id.as_str()) {
                    return Err(Error::invalid_descriptor(format!(
                        "{}: extension {} declared twice",
                        self.id, id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Find the declared dependency on a plugin.
    pub fn dependency(&self, id: &str) -> Option<&Dependency> {
        self.dependencies.iter().find(|d| d.id == id)
    }

    /// Check whether this plugin declares an optional dependency on `id`.
    pub fn optionally_depends_on(&self, id: &str) -> bool {
        self.dependency(id).map(|d| d.optional).unwrap_or(false)
    }

    /// Global identifier of a locally declared extension point.
    pub fn qualify(&self, local_id: &str) -> String {
        format!("{}.{}", self.id, local_id)
    }

    /// Display label, falling back to the identifier.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Builder for creating descriptors.
pub struct DescriptorBuilder {
    id: String,
    version: String,
    name: Option<String>,
    provider: Option<String>,
    dependencies: Vec<Dependency>,
    extension_points: Vec<ExtensionPointDecl>,
    extensions: Vec<ExtensionDecl>,
    runtime: Option<String>,
    path: Option<PathBuf>,
}

impl DescriptorBuilder {
    /// Create a new descriptor builder.
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            name: None,
            provider: None,
            dependencies: Vec::new(),
            extension_points: Vec::new(),
            extensions: Vec::new(),
            runtime: None,
            path: None,
        }
    }

    /// Set the display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the provider.
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Add a required dependency.
    pub fn requires(self, id: impl Into<String>, requirement: impl Into<String>) -> Self {
        self.dependency(Dependency::required(id, requirement))
    }

    /// Add an optional dependency.
    pub fn optionally_requires(self, id: impl Into<String>, requirement: impl Into<String>) -> Self {
        self.dependency(Dependency::optional(id, requirement))
    }

    /// Add a dependency.
    pub fn dependency(mut self, dep: Dependency) -> Self {
        self.dependencies.push(dep);
        self
    }

    /// Declare an extension point.
    pub fn extension_point(mut self, point: ExtensionPointDecl) -> Self {
        self.extension_points.push(point);
        self
    }

    /// Contribute an extension.
    pub fn extension(mut self, ext: ExtensionDecl) -> Self {
        self.extensions.push(ext);
        self
    }

    /// Set the runtime entry point reference.
    pub fn runtime(mut self, entry: impl Into<String>) -> Self {
        self.runtime = Some(entry.into());
        self
    }

    /// Set the directory the descriptor belongs to.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Build and validate the descriptor.
    pub fn build(self) -> Result<PluginDescriptor> {
        let version = Version::parse(self.version.trim()).map_err(|e| {
            Error::invalid_descriptor(format!(
                "{}: bad version {:?}: {}",
                self.id, self.version, e
            ))
        })?;

        let descriptor = PluginDescriptor {
            id: self.id,
            version,
            name: self.name,
            provider: self.provider,
            dependencies: self.dependencies,
            extension_points: self.extension_points,
            extensions: self.extensions,
            runtime: self.runtime,
            path: self.path,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Source of parsed descriptors for collection scans.
pub trait DescriptorLoader: Send + Sync {
    /// Load the descriptor stored in `dir`, if it holds one.
    fn load(&self, dir: &Path) -> Result<Option<PluginDescriptor>>;
}

/// Loads `plugin.toml` files from collection subdirectories.
#[cfg(feature = "serde")]
#[derive(Debug, Clone)]
pub struct TomlDescriptorLoader {
    file_name: String,
}

#[cfg(feature = "serde")]
impl TomlDescriptorLoader {
    /// Create a loader reading a custom file name.
    pub fn with_file_name(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }
}

#[cfg(feature = "serde")]
impl Default for TomlDescriptorLoader {
    fn default() -> Self {
        Self::with_file_name("plugin.toml")
    }
}

#[cfg(feature = "serde")]
impl DescriptorLoader for TomlDescriptorLoader {
    fn load(&self, dir: &Path) -> Result<Option<PluginDescriptor>> {
        let file = dir.join(&self.file_name);
        if !file.is_file() {
            return Ok(None);
        }

        let mut descriptor = PluginDescriptor::from_file(&file)?;
        descriptor.path = Some(dir.to_path_buf());
        descriptor.validate()?;
        Ok(Some(descriptor))
    }
}
