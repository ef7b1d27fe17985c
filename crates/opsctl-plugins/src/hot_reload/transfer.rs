//! Connection transfer
//!
//! Moves long-lived resource handles from the instance being replaced to
//! its successor without closing them. Handles are tracked per plugin for
//! the length of one reload attempt so a rollback can hand every one of
//! them back to the previous instance.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use opsctl_kernel::{ConnectionHandle, OpsPlugin};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A handle that could not be carried over and was closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTransferWarning {
    pub plugin: String,
    pub connection_id: String,
    pub reason: String,
}

/// Result of handing detached connections to a new instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachReport {
    /// Adopted by the new instance
    pub adopted: Vec<String>,
    /// Refused by the new instance; closed on commit, returned on rollback
    pub parked: Vec<String>,
    /// Requested ids that were not in flight
    pub missing: Vec<String>,
}

#[derive(Default)]
struct Transfer {
    /// Detached from the old instance, not yet attached
    in_flight: BTreeMap<String, ConnectionHandle>,
    /// Refused by the new instance
    parked: BTreeMap<String, ConnectionHandle>,
    /// Ids now owned by the new instance
    adopted: BTreeSet<String>,
}

/// Connection transfer manager
#[derive(Default)]
pub struct ConnectionTransferManager {
    transfers: Mutex<HashMap<String, Transfer>>,
}

impl ConnectionTransferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every handle away from `instance` without closing any.
    pub fn detach_all(&self, plugin: &str, instance: &mut dyn OpsPlugin) -> Vec<String> {
        let handles = instance.detach_connections();
        let mut transfers = self.transfers.lock();
        let transfer = transfers.entry(plugin.to_string()).or_default();

        let mut ids = Vec::with_capacity(handles.len());
        for handle in handles {
            ids.push(handle.id().to_string());
            if let Some(previous) = transfer.in_flight.insert(handle.id().to_string(), handle) {
                warn!(plugin = %plugin, connection = %previous.id(), "Duplicate connection id detached");
            }
        }

        debug!(plugin = %plugin, connections = ?ids, "Detached connections");
        ids
    }

    /// Hand the in-flight handles named by `ids` to `instance`.
    pub fn attach(&self, plugin: &str, instance: &mut dyn OpsPlugin, ids: &[String]) -> AttachReport {
        let mut report = AttachReport::default();
        let mut transfers = self.transfers.lock();
        let transfer = transfers.entry(plugin.to_string()).or_default();

        for id in ids {
            let Some(handle) = transfer.in_flight.remove(id) else {
                report.missing.push(id.clone());
                continue;
            };

            match instance.adopt_connection(handle) {
                Ok(()) => {
                    transfer.adopted.insert(id.clone());
                    report.adopted.push(id.clone());
                }
                Err(handle) => {
                    debug!(plugin = %plugin, connection = %id, "New instance refused connection");
                    transfer.parked.insert(id.clone(), handle);
                    report.parked.push(id.clone());
                }
            }
        }

        info!(
            plugin = %plugin,
            adopted = report.adopted.len(),
            parked = report.parked.len(),
            "Connections attached"
        );
        report
    }

    /// Number of handles currently tracked for `plugin`.
    pub fn tracked(&self, plugin: &str) -> usize {
        self.transfers
            .lock()
            .get(plugin)
            .map(|t| t.in_flight.len() + t.parked.len() + t.adopted.len())
            .unwrap_or(0)
    }

    /// The attempt committed: close every handle the new instance refused.
    pub fn finalize_commit(&self, plugin: &str) -> Vec<ConnectionTransferWarning> {
        let Some(transfer) = self.transfers.lock().remove(plugin) else {
            return Vec::new();
        };

        transfer
            .parked
            .into_values()
            .chain(transfer.in_flight.into_values())
            .map(|handle| {
                handle.close();
                let warning = ConnectionTransferWarning {
                    plugin: plugin.to_string(),
                    connection_id: handle.id().to_string(),
                    reason: "new instance could not adopt the connection".to_string(),
                };
                warn!(plugin = %plugin, connection = %handle.id(), "Closed unadoptable connection");
                warning
            })
            .collect()
    }

    /// The attempt is rolling back: take the transferred handles away from
    /// the discarded instance. Handles it opened on its own are closed.
    pub fn recall(&self, plugin: &str, discarded: &mut dyn OpsPlugin) {
        let mut transfers = self.transfers.lock();
        let transfer = transfers.entry(plugin.to_string()).or_default();
        let adopted = std::mem::take(&mut transfer.adopted);

        for handle in discarded.detach_connections() {
            if adopted.contains(handle.id()) {
                transfer.in_flight.insert(handle.id().to_string(), handle);
            } else {
                debug!(plugin = %plugin, connection = %handle.id(), "Closing connection opened by discarded instance");
                handle.close();
            }
        }
    }

    /// The attempt rolled back: return every tracked handle to `old`.
    pub fn reclaim(&self, plugin: &str, old: &mut dyn OpsPlugin) -> Vec<ConnectionTransferWarning> {
        let transfer = self.transfers.lock().remove(plugin).unwrap_or_default();
        if !transfer.adopted.is_empty() {
            warn!(plugin = %plugin, connections = ?transfer.adopted, "Adopted connections were not recalled");
        }

        let mut returning = transfer.in_flight;
        returning.extend(transfer.parked);

        let mut warnings = Vec::new();
        for (id, handle) in returning {
            if let Err(handle) = old.adopt_connection(handle) {
                handle.close();
                warn!(plugin = %plugin, connection = %id, "Previous instance refused its own connection");
                warnings.push(ConnectionTransferWarning {
                    plugin: plugin.to_string(),
                    connection_id: id,
                    reason: "previous instance could not take the connection back".to_string(),
                });
            }
        }

        warnings
    }

    /// Close every connection `instance` holds, plus anything still tracked.
    pub fn close_all(&self, plugin: &str, instance: &mut dyn OpsPlugin) -> usize {
        let tracked = self.transfers.lock().remove(plugin).unwrap_or_default();
        let mut closed = 0;

        for handle in instance
            .detach_connections()
            .into_iter()
            .chain(tracked.in_flight.into_values())
            .chain(tracked.parked.into_values())
        {
            handle.close();
            closed += 1;
        }

        info!(plugin = %plugin, closed, "Closed plugin connections");
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsctl_kernel::{PluginContext, PluginManifest, PluginResult, Resource};
    use std::any::Any;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Socket(AtomicBool);

    impl Resource for Socket {
        fn kind(&self) -> &str {
            "tcp"
        }

        fn close(&self) {
            self.0.store(false, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn handle(id: &str) -> ConnectionHandle {
        ConnectionHandle::new(id, Arc::new(Socket(AtomicBool::new(true))))
    }

    struct Pool {
        manifest: PluginManifest,
        connections: BTreeMap<String, ConnectionHandle>,
        accepts: bool,
    }

    impl Pool {
        fn new(accepts: bool) -> Self {
            Self {
                manifest: PluginManifest::new("cache", "1.0.0"),
                connections: BTreeMap::new(),
                accepts,
            }
        }

        fn with(mut self, handle: ConnectionHandle) -> Self {
            self.connections.insert(handle.id().to_string(), handle);
            self
        }
    }

    #[async_trait::async_trait]
    impl OpsPlugin for Pool {
        fn manifest(&self) -> &PluginManifest {
            &self.manifest
        }

        async fn initialize(&mut self, _ctx: &PluginContext) -> PluginResult<()> {
            Ok(())
        }

        fn connection(&self, id: &str) -> Option<ConnectionHandle> {
            self.connections.get(id).cloned()
        }

        fn connection_ids(&self) -> Vec<String> {
            self.connections.keys().cloned().collect()
        }

        fn detach_connections(&mut self) -> Vec<ConnectionHandle> {
            std::mem::take(&mut self.connections).into_values().collect()
        }

        fn adopt_connection(&mut self, handle: ConnectionHandle) -> Result<(), ConnectionHandle> {
            if !self.accepts {
                return Err(handle);
            }
            self.connections.insert(handle.id().to_string(), handle);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_transfer_keeps_the_same_resource() {
        let manager = ConnectionTransferManager::new();
        let original = handle("conn-1");
        let mut old = Pool::new(true).with(original.clone());
        let mut new = Pool::new(true);

        let ids = manager.detach_all("cache", &mut old);
        assert_eq!(ids, vec!["conn-1"]);
        assert!(old.connection("conn-1").is_none());

        let report = manager.attach("cache", &mut new, &ids);
        assert_eq!(report.adopted, vec!["conn-1"]);

        let moved = new.connection("conn-1").unwrap();
        assert!(moved.same_resource(&original));
        assert!(moved.is_open());
        assert!(manager.finalize_commit("cache").is_empty());
        assert_eq!(manager.tracked("cache"), 0);
    }

    #[test]
    fn test_refused_handles_close_on_commit() {
        let manager = ConnectionTransferManager::new();
        let original = handle("conn-1");
        let mut old = Pool::new(true).with(original.clone());
        let mut new = Pool::new(false);

        let ids = manager.detach_all("cache", &mut old);
        let report = manager.attach("cache", &mut new, &ids);
        assert_eq!(report.parked, vec!["conn-1"]);
        // Still open until the attempt is decided.
        assert!(original.is_open());

        let warnings = manager.finalize_commit("cache");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].connection_id, "conn-1");
        assert!(!original.is_open());
    }

    #[test]
    fn test_reclaim_returns_everything_to_the_old_instance() {
        let manager = ConnectionTransferManager::new();
        let adopted = handle("conn-1");
        let refused = handle("conn-2");
        let mut old = Pool::new(true).with(adopted.clone()).with(refused.clone());

        // The new instance takes conn-1 only and opens a connection of its own.
        let mut new = Pool::new(true).with(handle("conn-9"));

        let ids = manager.detach_all("cache", &mut old);
        let _ = manager.attach("cache", &mut new, &ids[..1]);
        let fresh = new.connection("conn-9").unwrap();

        manager.recall("cache", &mut new);
        let warnings = manager.reclaim("cache", &mut old);
        assert!(warnings.is_empty());

        assert!(old.connection("conn-1").unwrap().same_resource(&adopted));
        assert!(old.connection("conn-2").unwrap().same_resource(&refused));
        assert!(adopted.is_open() && refused.is_open());
        assert!(!fresh.is_open());
        assert!(new.connection_ids().is_empty());
    }

    #[test]
    fn test_close_all() {
        let manager = ConnectionTransferManager::new();
        let a = handle("conn-1");
        let b = handle("conn-2");
        let mut pool = Pool::new(true).with(a.clone()).with(b.clone());

        assert_eq!(manager.close_all("cache", &mut pool), 2);
        assert!(!a.is_open() && !b.is_open());
    }
}
