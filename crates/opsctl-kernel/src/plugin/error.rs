//! Typed errors for the plugin contract.

use thiserror::Error;

/// Errors a plugin instance reports back to the runtime.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    /// `initialize` failed.
    #[error("Plugin initialization failed: {0}")]
    InitFailed(String),

    /// `cleanup` failed. The runtime logs this and carries on.
    #[error("Plugin cleanup failed: {0}")]
    CleanupFailed(String),

    /// The instance rejected attributes or a persistent-state blob handed to it.
    #[error("Incompatible state: {0}")]
    IncompatibleState(String),

    /// The health check itself failed (as opposed to reporting unhealthy).
    #[error("Health check failed: {0}")]
    HealthCheck(String),

    /// A command invocation failed.
    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    /// The plugin does not implement the requested operation.
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// Plugin configuration is invalid or missing.
    #[error("Plugin configuration error: {0}")]
    ConfigError(String),

    /// An I/O error surfaced during a plugin operation.
    #[error("Plugin I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A (de)serialization error surfaced during a plugin operation.
    #[error("Plugin serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    /// Catch-all for errors that don't fit the above categories.
    #[error("{0}")]
    Other(String),
}
