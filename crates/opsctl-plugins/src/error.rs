//! Typed errors and result aliases for the plugin runtime.

use error_stack::Report;
use opsctl_kernel::PluginError;
use opsctl_kernel::config::ConfigError;
use thiserror::Error;

use crate::hot_reload::{LoadError, RegistryError, ResolveError, SnapshotError, ValidationStage};

/// Error-stack–backed result alias for runtime operations.
///
/// Equivalent to `Result<T, error_stack::Report<RuntimeError>>`.
pub type RuntimeResult<T> = ::std::result::Result<T, Report<RuntimeError>>;

/// Extension trait to convert `Result<T, E>` into [`RuntimeResult<T>`].
pub trait IntoRuntimeReport<T> {
    /// Wrap the error in an `error_stack::Report`.
    fn into_report(self) -> RuntimeResult<T>;
}

impl<T, E> IntoRuntimeReport<T> for ::std::result::Result<T, E>
where
    E: Into<RuntimeError>,
{
    #[inline]
    fn into_report(self) -> RuntimeResult<T> {
        self.map_err(|e| Report::new(e.into()))
    }
}

/// Errors surfaced by the plugin runtime.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// A candidate failed a validation stage.
    #[error("{plugin} failed {stage} validation: {message}")]
    Validation {
        plugin: String,
        stage: ValidationStage,
        message: String,
    },

    /// No live instance exists for the plugin.
    #[error("Plugin {0} has no live instance")]
    NotLoaded(String),

    /// The plugin exists but cannot serve calls in its current state.
    #[error("Plugin {name} is {state}")]
    Unavailable { name: String, state: String },

    /// Unload refused while other plugins still depend on this one.
    #[error("Plugin {name} is required by: {}", dependents.join(", "))]
    HasDependents {
        name: String,
        dependents: Vec<String>,
    },

    /// The instance failed to come up (initialize or health check).
    #[error("Plugin {name} failed to start: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_report_keeps_the_context() {
        let result: Result<(), RegistryError> = Err(RegistryError::NotFound("cache".to_string()));
        let report = result.into_report().unwrap_err();

        assert!(matches!(
            report.current_context(),
            RuntimeError::Registry(RegistryError::NotFound(name)) if name == "cache"
        ));
        assert_eq!(report.current_context().to_string(), "Plugin cache not found");
    }

    #[test]
    fn test_display() {
        let err = RuntimeError::HasDependents {
            name: "database".to_string(),
            dependents: vec!["billing".to_string(), "reports".to_string()],
        };
        assert_eq!(err.to_string(), "Plugin database is required by: billing, reports");

        let err = RuntimeError::Validation {
            plugin: "reports".to_string(),
            stage: ValidationStage::Syntax,
            message: "expected value".to_string(),
        };
        assert_eq!(err.to_string(), "reports failed syntax validation: expected value");
    }
}
