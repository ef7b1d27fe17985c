//! Hot-reload runtime
//!
//! Replaces plugin code units in a running process:
//! - File watching with per-plugin debounce
//! - Dependency-ordered reload units
//! - Staged validation of candidates before anything is touched
//! - State snapshots and connection transfer across the swap
//! - Rollback to the previous instance on any failure

mod coordinator;
mod loader;
mod outcome;
mod registry;
mod resolver;
mod state;
mod transfer;
mod validator;
mod watcher;

pub use coordinator::ReloadCoordinator;
pub use loader::{
    Candidate, LibraryLoader, LoadError, LoaderSet, ManifestLoader, PluginFactory, PluginLibrary,
    PluginLoader, content_hash,
};
pub use outcome::{OutcomeKind, PluginStatus, ReloadOutcome, UnitReport};
pub use registry::{
    PluginDescriptor, PluginRegistry, PluginState, PluginVersion, RegistryError, RegistryStats,
    VersionReq,
};
pub use resolver::{DependencyGraph, ResolveError};
pub use state::{SnapshotError, Snapshotter, StateSnapshot};
pub use transfer::{AttachReport, ConnectionTransferManager, ConnectionTransferWarning};
pub use validator::{StageOutcome, ValidationContext, ValidationResult, ValidationStage, Validator};
pub use watcher::{ChangeRouter, Debouncer, PluginWatcher, ReloadRequest, WatchConfig};

// Re-export kernel hot reload definitions
pub use opsctl_kernel::{
    HotReloadConfig, ReloadEvent, ReloadListener, ReloadPhase, ReloadStrategy, ReloadTrigger,
};
