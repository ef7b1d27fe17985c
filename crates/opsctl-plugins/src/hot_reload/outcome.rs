//! Structured records of reload attempts

use std::time::Duration;

use chrono::{DateTime, Utc};
use opsctl_kernel::{Capability, ReloadPhase, ReloadTrigger};
use serde::{Deserialize, Serialize};

use super::registry::{PluginDescriptor, PluginState};
use super::transfer::ConnectionTransferWarning;
use super::validator::ValidationStage;

/// How one plugin's attempt ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OutcomeKind {
    /// The new version is live
    Committed,
    /// The candidate failed validation; the running version was not touched
    ValidationError { stage: ValidationStage },
    /// Swap, restore or health check failed; the previous version runs again
    RolledBack,
    /// The previous version could not be reinstated; the plugin is `Failed`
    RollbackFailed,
    /// The unit contains a dependency cycle; nothing was touched
    CyclicDependency,
    /// Skipped because a dependency in the unit did not commit
    NotAttempted,
    /// Cancelled by the operator before the swap began
    Cancelled,
}

impl OutcomeKind {
    pub fn is_committed(&self) -> bool {
        matches!(self, OutcomeKind::Committed)
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeKind::Committed => write!(f, "committed"),
            OutcomeKind::ValidationError { stage } => write!(f, "validation error ({})", stage),
            OutcomeKind::RolledBack => write!(f, "rolled back"),
            OutcomeKind::RollbackFailed => write!(f, "rollback failed"),
            OutcomeKind::CyclicDependency => write!(f, "cyclic dependency"),
            OutcomeKind::NotAttempted => write!(f, "not attempted"),
            OutcomeKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Record of one plugin's reload attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadOutcome {
    pub plugin: String,
    pub from_version: String,
    /// Version of the candidate, when one was parsed
    pub to_version: Option<String>,
    pub outcome: OutcomeKind,
    pub reason: Option<String>,
    pub trigger: ReloadTrigger,
    pub warnings: Vec<ConnectionTransferWarning>,
    pub duration: Duration,
    pub finished_at: DateTime<Utc>,
}

impl ReloadOutcome {
    pub fn new(plugin: &str, from_version: &str, trigger: ReloadTrigger, outcome: OutcomeKind) -> Self {
        Self {
            plugin: plugin.to_string(),
            from_version: from_version.to_string(),
            to_version: None,
            outcome,
            reason: None,
            trigger,
            warnings: Vec::new(),
            duration: Duration::ZERO,
            finished_at: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_to_version(mut self, version: &str) -> Self {
        self.to_version = Some(version.to_string());
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<ConnectionTransferWarning>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_committed(&self) -> bool {
        self.outcome.is_committed()
    }
}

/// Outcomes of one reload unit, in unit order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    /// Plugin whose change started the unit
    pub trigger_plugin: String,
    pub trigger: ReloadTrigger,
    pub outcomes: Vec<ReloadOutcome>,
}

impl UnitReport {
    pub fn new(trigger_plugin: &str, trigger: ReloadTrigger) -> Self {
        Self {
            trigger_plugin: trigger_plugin.to_string(),
            trigger,
            outcomes: Vec::new(),
        }
    }

    /// Plugin names in the order they were handled
    pub fn order(&self) -> Vec<&str> {
        self.outcomes.iter().map(|o| o.plugin.as_str()).collect()
    }

    pub fn outcome(&self, plugin: &str) -> Option<&ReloadOutcome> {
        self.outcomes.iter().find(|o| o.plugin == plugin)
    }

    pub fn all_committed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(ReloadOutcome::is_committed)
    }
}

/// Operator view of one plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginStatus {
    pub name: String,
    pub version: String,
    pub state: PluginState,
    /// Phase of an attempt in progress
    pub phase: Option<ReloadPhase>,
    pub reload_count: u32,
    pub last_loaded_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dependencies: Vec<String>,
    pub capabilities: Vec<Capability>,
    pub last_outcome: Option<ReloadOutcome>,
}

impl PluginStatus {
    pub fn new(
        descriptor: &PluginDescriptor,
        phase: Option<ReloadPhase>,
        last_outcome: Option<ReloadOutcome>,
    ) -> Self {
        Self {
            name: descriptor.name.clone(),
            version: descriptor.version.to_string(),
            state: descriptor.state(),
            phase,
            reload_count: descriptor.reload_count,
            last_loaded_at: descriptor.last_loaded_at,
            last_error: descriptor.last_error.clone(),
            dependencies: descriptor.dependencies.iter().cloned().collect(),
            capabilities: descriptor.capabilities.iter().copied().collect(),
            last_outcome,
        }
    }
}
