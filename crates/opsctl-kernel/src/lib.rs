//! opsctl kernel
//!
//! The contract shared by the hot-reload runtime and every plugin the
//! operations CLI loads: the [`OpsPlugin`] trait, plugin manifests and
//! capabilities, transferable connection handles, and the configuration
//! and event types of the hot-reload pipeline.

// plugin module
pub mod plugin;
pub use plugin::*;

// config module
#[cfg(feature = "config")]
pub mod config;
