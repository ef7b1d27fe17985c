//! opsctl plugin runtime
//!
//! Loads, reloads and unloads operations-CLI plugins while the process
//! keeps running:
//! - Watches plugin source locations and turns changes into reload requests
//! - Reloads a changed plugin and everything depending on it, in dependency order
//! - Validates every candidate before the running instance is touched
//! - Carries attributes, persistent state and open connections across the swap
//! - Rolls back to the previous instance when anything fails
//!
//! ```no_run
//! use std::sync::Arc;
//! use opsctl_plugins::hot_reload::{ManifestLoader, ReloadCoordinator};
//! use opsctl_plugins::settings::RuntimeSettings;
//!
//! # async fn run() -> opsctl_plugins::RuntimeResult<()> {
//! let settings = RuntimeSettings::from_file("opsctl.toml")?;
//! let loader = Arc::new(ManifestLoader::new());
//! let coordinator = Arc::new(ReloadCoordinator::new(loader, settings.hot_reload_config()));
//!
//! let (_watcher, _consumer) = coordinator
//!     .watch(&settings.plugin_dirs, settings.watch_config())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod hot_reload;
pub mod settings;

pub use error::{IntoRuntimeReport, RuntimeError, RuntimeResult};
pub use opsctl_kernel::{
    Capability, CommandSpec, ConnectionHandle, OpsPlugin, PluginContext, PluginError,
    PluginManifest, PluginResult, Resource,
};

#[doc(hidden)]
pub use serde_json;
