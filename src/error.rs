//! Error types for plugin framework operations.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// A failure recorded for one plugin while a cascade kept going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginFailure {
    /// Plugin identifier.
    pub plugin: String,
    /// Rendered error message.
    pub message: String,
}

impl PluginFailure {
    /// Create a failure record.
    pub fn new(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for PluginFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.plugin, self.message)
    }
}

fn join_failures(failures: &[PluginFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur during plugin framework operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Descriptor is missing required data or is malformed.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// Identifier already installed with a different version.
    #[error("plugin {id} already installed at version {installed}, refusing {offered}")]
    DuplicateId {
        /// Plugin identifier.
        id: String,
        /// Installed version.
        installed: String,
        /// Version offered for installation.
        offered: String,
    },

    /// The requires-graph contains a cycle.
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency {
        /// Identifiers along the cycle, first one repeated at the end.
        cycle: Vec<String>,
    },

    /// A required dependency has no installed match.
    #[error("plugin {plugin} requires {dependency} {requirement}, which is not installed")]
    UnsatisfiedDependency {
        /// Plugin declaring the dependency.
        plugin: String,
        /// Dependency identifier.
        dependency: String,
        /// Version requirement.
        requirement: String,
    },

    /// A dependency failed to start during the cascade.
    #[error("plugin {plugin} not started: dependency {dependency} failed")]
    DependencyStartFailed {
        /// Plugin that could not start.
        plugin: String,
        /// Dependency that failed.
        dependency: String,
        /// Failure of the dependency.
        #[source]
        source: Arc<Error>,
    },

    /// Plugin's own start routine failed.
    #[error("plugin {plugin} activation failed: {reason}")]
    ActivationFailed {
        /// Plugin identifier.
        plugin: String,
        /// Failure reason.
        reason: String,
    },

    /// Operation requires the plugin to be stopped.
    #[error("plugin is active: {0}")]
    PluginActive(String),

    /// Plugin has active dependents and cascading was disabled.
    #[error("plugin {plugin} is in use by {}", .dependents.join(", "))]
    InUseByDependents {
        /// Plugin identifier.
        plugin: String,
        /// Active dependents.
        dependents: Vec<String>,
    },

    /// Unrecoverable runtime failure; the graph state is undefined.
    #[error("fatal runtime error: {0}")]
    Fatal(String),

    /// Plugin not found.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Plugin collection not registered.
    #[error("plugin collection not registered: {}", .0.display())]
    CollectionNotFound(PathBuf),

    /// Registry reached its capacity.
    #[error("registry full: max {0} plugins")]
    RegistryFull(usize),

    /// Plugin or context in invalid state for operation.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// One or more plugins failed to stop cleanly.
    #[error("teardown failed: {}", join_failures(.0))]
    TeardownFailed(Vec<PluginFailure>),

    /// Context was destroyed.
    #[error("context was destroyed")]
    ContextDestroyed,

    /// Runtime entry point could not be resolved.
    #[error("entry point not found: {0}")]
    EntryPointNotFound(String),

    /// Error raised by plugin code.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Descriptor parse error.
    #[cfg(feature = "serde")]
    #[error("descriptor parse error: {0}")]
    DescriptorParse(String),

    /// Configuration parse error.
    #[cfg(feature = "serde")]
    #[error("config error: {0}")]
    Config(String),

    /// Watch error.
    #[cfg(feature = "watch")]
    #[error("watch error: {0}")]
    Watch(String),

    /// Metrics registration error.
    #[cfg(feature = "metrics-prometheus")]
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl Error {
    /// Create a plugin not found error.
    pub fn plugin_not_found(id: impl Into<String>) -> Self {
        Self::PluginNotFound(id.into())
    }

    /// Create an invalid descriptor error.
    pub fn invalid_descriptor(msg: impl Into<String>) -> Self {
        Self::InvalidDescriptor(msg.into())
    }

    /// Create an unsatisfied dependency error.
    pub fn unsatisfied(
        plugin: impl Into<String>,
        dependency: impl Into<String>,
        requirement: impl Into<String>,
    ) -> Self {
        Self::UnsatisfiedDependency {
            plugin: plugin.into(),
            dependency: dependency.into(),
            requirement: requirement.into(),
        }
    }

    /// Create an activation failed error.
    pub fn activation_failed(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ActivationFailed {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Create an error from plugin code.
    pub fn plugin(msg: impl Into<String>) -> Self {
        Self::Plugin(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Returns true if the process should not continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Returns true for errors detected before any state was touched.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::CyclicDependency { .. } | Self::InvalidDescriptor(_))
    }

    /// Returns true if this error is recoverable.
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal() && !matches!(self, Self::ContextDestroyed)
    }
}
