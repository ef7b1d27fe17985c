//! Plugin state snapshots
//!
//! Captures an instance's attributes and persistent state before it is
//! swapped out, and writes them onto the replacement (or back onto the old
//! instance on rollback).

use chrono::{DateTime, Utc};
use opsctl_kernel::OpsPlugin;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Snapshot errors
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SnapshotError {
    #[error("No pending snapshot for {0}")]
    Missing(String),

    #[error("{plugin} rejected restored attributes: {reason}")]
    AttributeRestore { plugin: String, reason: String },

    #[error("{plugin} rejected persistent state: {reason}")]
    Incompatible { plugin: String, reason: String },

    #[error("Snapshot persistence failed: {0}")]
    Persistence(String),
}

/// State captured from one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub plugin_name: String,
    /// Version of the instance the snapshot was taken from
    pub plugin_version: String,
    pub captured_at: DateTime<Utc>,
    pub attribute_values: HashMap<String, serde_json::Value>,
    /// Opaque plugin-supplied blob
    pub persistent_state: Option<Vec<u8>>,
    /// Connections held when the snapshot was taken
    pub connection_handle_ids: Vec<String>,
}

impl StateSnapshot {
    pub fn new(plugin_name: &str, plugin_version: &str) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            plugin_version: plugin_version.to_string(),
            captured_at: Utc::now(),
            attribute_values: HashMap::new(),
            persistent_state: None,
            connection_handle_ids: Vec::new(),
        }
    }

    /// Read every observable piece of state from a live instance.
    pub fn of(instance: &dyn OpsPlugin) -> Self {
        let mut connection_handle_ids = instance.connection_ids();
        connection_handle_ids.sort();

        Self {
            attribute_values: instance.attributes(),
            persistent_state: instance.export_state(),
            connection_handle_ids,
            ..Self::new(instance.name(), instance.version())
        }
    }

    pub fn with_attribute<T: Serialize>(mut self, key: &str, value: &T) -> Self {
        if let Ok(json_value) = serde_json::to_value(value) {
            self.attribute_values.insert(key.to_string(), json_value);
        }
        self
    }

    pub fn with_persistent_state(mut self, blob: Vec<u8>) -> Self {
        self.persistent_state = Some(blob);
        self
    }

    pub fn attribute<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.attribute_values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Takes, holds and restores snapshots.
///
/// One snapshot per plugin is pending while its reload attempt runs;
/// `finalize` moves it to a bounded history once the attempt commits or
/// rolls back.
pub struct Snapshotter {
    pending: Arc<RwLock<HashMap<String, StateSnapshot>>>,
    history: Arc<RwLock<HashMap<String, Vec<StateSnapshot>>>>,
    max_history: usize,
    persist_dir: Option<PathBuf>,
}

impl Snapshotter {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(HashMap::new())),
            max_history: 10,
            persist_dir: None,
        }
    }

    /// Set maximum history entries per plugin
    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = max;
        self
    }

    /// Write finalized snapshots as JSON into `dir`.
    pub fn with_persistence<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.persist_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Capture `instance` and hold the snapshot as pending.
    pub async fn capture(&self, instance: &dyn OpsPlugin) -> StateSnapshot {
        let snapshot = StateSnapshot::of(instance);
        info!(
            plugin = %snapshot.plugin_name,
            version = %snapshot.plugin_version,
            attributes = snapshot.attribute_values.len(),
            connections = snapshot.connection_handle_ids.len(),
            "Captured state snapshot"
        );

        let mut pending = self.pending.write().await;
        if pending
            .insert(snapshot.plugin_name.clone(), snapshot.clone())
            .is_some()
        {
            warn!(plugin = %snapshot.plugin_name, "Replaced an unfinalized snapshot");
        }
        snapshot
    }

    /// Write a snapshot onto `instance`.
    ///
    /// Returns whether the persistent-state blob was taken. A plugin with no
    /// persistent-state accessor silently ignores the blob; a plugin that
    /// rejects it fails the restore.
    pub fn restore(
        &self,
        instance: &mut dyn OpsPlugin,
        snapshot: &StateSnapshot,
    ) -> Result<bool, SnapshotError> {
        let plugin = instance.name().to_string();

        instance
            .apply_attributes(&snapshot.attribute_values)
            .map_err(|e| SnapshotError::AttributeRestore {
                plugin: plugin.clone(),
                reason: e.to_string(),
            })?;

        let Some(blob) = snapshot.persistent_state.as_deref() else {
            return Ok(false);
        };

        let accepted = instance
            .import_state(blob)
            .map_err(|e| SnapshotError::Incompatible {
                plugin: plugin.clone(),
                reason: e.to_string(),
            })?;
        if !accepted {
            debug!(plugin = %plugin, "Instance declares no persistent state; blob dropped");
        }
        Ok(accepted)
    }

    pub async fn pending(&self, plugin: &str) -> Option<StateSnapshot> {
        self.pending.read().await.get(plugin).cloned()
    }

    pub async fn has_pending(&self, plugin: &str) -> bool {
        self.pending.read().await.contains_key(plugin)
    }

    /// End the pending snapshot's attempt and move it to history.
    pub async fn finalize(&self, plugin: &str) -> Result<StateSnapshot, SnapshotError> {
        let snapshot = self
            .pending
            .write()
            .await
            .remove(plugin)
            .ok_or_else(|| SnapshotError::Missing(plugin.to_string()))?;

        {
            let mut history = self.history.write().await;
            let entry = history.entry(plugin.to_string()).or_default();
            entry.push(snapshot.clone());
            if entry.len() > self.max_history {
                let to_remove = entry.len() - self.max_history;
                entry.drain(0..to_remove);
            }
        }

        if self.persist_dir.is_some() {
            if let Err(e) = self.persist(&snapshot).await {
                warn!(plugin = %plugin, "Failed to persist snapshot: {}", e);
            }
        }

        debug!(plugin = %plugin, "Snapshot finalized");
        Ok(snapshot)
    }

    /// Finalized snapshots, oldest first
    pub async fn history(&self, plugin: &str) -> Vec<StateSnapshot> {
        self.history
            .read()
            .await
            .get(plugin)
            .cloned()
            .unwrap_or_default()
    }

    /// Pending snapshot, else latest finalized, else the persisted one.
    pub async fn latest(&self, plugin: &str) -> Option<StateSnapshot> {
        if let Some(snapshot) = self.pending(plugin).await {
            return Some(snapshot);
        }
        if let Some(snapshot) = self.history(plugin).await.pop() {
            return Some(snapshot);
        }
        self.load_persisted(plugin).await.ok()
    }

    /// Forget everything about a plugin (on unload).
    pub async fn clear(&self, plugin: &str) {
        debug!(plugin = %plugin, "Clearing snapshots");
        self.pending.write().await.remove(plugin);
        self.history.write().await.remove(plugin);
    }

    async fn persist(&self, snapshot: &StateSnapshot) -> Result<(), SnapshotError> {
        let dir = self
            .persist_dir
            .as_ref()
            .ok_or_else(|| SnapshotError::Persistence("persistence directory not set".to_string()))?;

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SnapshotError::Persistence(e.to_string()))?;

        let file_path = dir.join(format!("{}.json", snapshot.plugin_name));
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| SnapshotError::Persistence(e.to_string()))?;
        tokio::fs::write(&file_path, json)
            .await
            .map_err(|e| SnapshotError::Persistence(e.to_string()))?;

        debug!("Persisted snapshot to {:?}", file_path);
        Ok(())
    }

    async fn load_persisted(&self, plugin: &str) -> Result<StateSnapshot, SnapshotError> {
        let dir = self
            .persist_dir
            .as_ref()
            .ok_or_else(|| SnapshotError::Persistence("persistence directory not set".to_string()))?;

        let json = tokio::fs::read_to_string(dir.join(format!("{}.json", plugin)))
            .await
            .map_err(|e| SnapshotError::Persistence(e.to_string()))?;
        serde_json::from_str(&json).map_err(|e| SnapshotError::Persistence(e.to_string()))
    }
}

impl Default for Snapshotter {
    fn default() -> Self {
        Self::new()
    }
}
