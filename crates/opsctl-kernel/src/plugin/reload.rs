//! Hot-reload configuration, phases and events.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How file changes turn into reload requests.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReloadStrategy {
    /// Every accepted change event is queued immediately
    Immediate,
    /// Change events for one plugin inside the window collapse into one request
    Debounced(Duration),
    /// File changes are ignored; only operator-triggered reloads run
    Manual,
}

impl ReloadStrategy {
    /// Cooldown window applied per plugin, if any.
    pub fn cooldown(&self) -> Option<Duration> {
        match self {
            ReloadStrategy::Immediate => Some(Duration::ZERO),
            ReloadStrategy::Debounced(window) => Some(*window),
            ReloadStrategy::Manual => None,
        }
    }

    pub fn watches_files(&self) -> bool {
        !matches!(self, ReloadStrategy::Manual)
    }
}

impl Default for ReloadStrategy {
    fn default() -> Self {
        Self::Debounced(Duration::from_secs(2))
    }
}

/// Hot-reload configuration
#[derive(Debug, Clone)]
pub struct HotReloadConfig {
    /// Reload strategy
    pub strategy: ReloadStrategy,
    /// Restore attributes and persistent state onto the new instance
    pub preserve_state: bool,
    /// Upper bound for a plugin health check
    pub health_check_timeout: Duration,
    /// Capacity of the reload request queue
    pub queue_capacity: usize,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            strategy: ReloadStrategy::default(),
            preserve_state: true,
            health_check_timeout: Duration::from_secs(5),
            queue_capacity: 64,
        }
    }
}

impl HotReloadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: ReloadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Shorthand for `with_strategy(ReloadStrategy::Debounced(window))`.
    pub fn with_cooldown(mut self, window: Duration) -> Self {
        self.strategy = ReloadStrategy::Debounced(window);
        self
    }

    pub fn with_preserve_state(mut self, preserve: bool) -> Self {
        self.preserve_state = preserve;
        self
    }

    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

/// Why a reload was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReloadTrigger {
    /// A watched source location changed
    FileChange,
    /// An operator asked for it
    Manual,
    /// A dependency of the plugin was reloaded in the same unit
    DependencyCascade,
}

impl std::fmt::Display for ReloadTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReloadTrigger::FileChange => write!(f, "file change"),
            ReloadTrigger::Manual => write!(f, "manual"),
            ReloadTrigger::DependencyCascade => write!(f, "dependency cascade"),
        }
    }
}

/// Phase of one plugin's reload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReloadPhase {
    Pending,
    Validating,
    Snapshotting,
    Swapping,
    Restoring,
    HealthChecking,
    Committed,
    RolledBack,
}

impl ReloadPhase {
    /// Whether the attempt has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReloadPhase::Committed | ReloadPhase::RolledBack)
    }

    /// Whether the attempt may still be abandoned without side effects.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, ReloadPhase::Pending | ReloadPhase::Validating)
    }
}

impl std::fmt::Display for ReloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Event broadcast by the reload coordinator
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ReloadEvent {
    /// A reload request entered the queue
    RequestQueued {
        plugin: String,
        trigger: ReloadTrigger,
    },
    /// A plugin's reload attempt entered a new phase
    PhaseChanged { plugin: String, phase: ReloadPhase },
    /// A plugin was loaded for the first time
    PluginLoaded { plugin: String, version: String },
    /// A reload committed
    Committed {
        plugin: String,
        from_version: String,
        to_version: String,
    },
    /// A reload was rolled back; the previous version keeps running
    RolledBack { plugin: String, reason: String },
    /// The previous version could not be reinstated; operator action required
    RollbackFailed { plugin: String, reason: String },
    /// A plugin in the unit was not attempted
    Skipped { plugin: String, reason: String },
    /// A connection could not be adopted by the new instance and was closed
    ConnectionTransferWarning {
        plugin: String,
        connection_id: String,
        reason: String,
    },
    /// A plugin was unloaded by the operator
    PluginUnloaded { plugin: String },
}

/// Host callbacks for user-facing reporting.
pub trait ReloadListener: Send + Sync {
    fn on_plugin_committed(&self, name: &str, version: &str);

    fn on_plugin_rolled_back(&self, name: &str, reason: &str);
}
