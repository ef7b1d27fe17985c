//! Common fixtures shared across the `opsctl-plugins` integration tests.
//!
//! This module is **not** a standalone test binary. It is declared with
//! `mod common;` inside each integration test file that needs it.
//!
//! [`Fixture`] owns a temporary plugin directory, a [`ManifestLoader`] with
//! the `service` factory registered, and a [`ReloadCoordinator`] over it.
//! Manifests are written with [`Fixture::write`]; the [`ServicePlugin`]
//! built from them reads its behaviour from manifest settings:
//!
//! | Setting | Effect |
//! |---------|--------|
//! | `healthy = false` | health check reports unhealthy |
//! | `fail_init = true` | `initialize` fails |
//! | `stateful = true` | exports/imports its journal as persistent state |
//! | `open = ["id"]` | opens its own connections during `initialize` |
//! | `refuse_connections = true` | refuses every transferred connection |
//! | `slow_health_ms = 150` | health check takes that long to answer |

#![allow(dead_code)]

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use opsctl_plugins::hot_reload::{
    HotReloadConfig, ManifestLoader, ReloadCoordinator, ReloadEvent, ReloadListener,
    ReloadPhase, ReloadStrategy,
};
use opsctl_plugins::{
    Capability, CommandSpec, ConnectionHandle, OpsPlugin, PluginContext, PluginError,
    PluginManifest, PluginResult, Resource,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::broadcast;

// ─────────────────────────────────────────────────────────────────────────────
// Connections
// ─────────────────────────────────────────────────────────────────────────────

/// An in-memory stand-in for a pooled client connection.
pub struct FakeSocket {
    open: AtomicBool,
}

impl FakeSocket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
        })
    }
}

impl Resource for FakeSocket {
    fn kind(&self) -> &str {
        "fake-socket"
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test plugin
// ─────────────────────────────────────────────────────────────────────────────

/// Process-wide switches a test flips between reloads.
#[derive(Default)]
pub struct Switches {
    /// Every instance rejects imported persistent state
    pub reject_state: AtomicBool,
}

pub struct ServicePlugin {
    manifest: PluginManifest,
    switches: Arc<Switches>,
    counter: i64,
    journal: Vec<String>,
    connections: BTreeMap<String, ConnectionHandle>,
    healthy: bool,
    slow_health: Duration,
    stateful: bool,
    refuse_connections: bool,
}

impl ServicePlugin {
    fn new(manifest: &PluginManifest, switches: Arc<Switches>) -> Self {
        Self {
            manifest: manifest.clone(),
            switches,
            counter: 0,
            journal: Vec::new(),
            connections: BTreeMap::new(),
            healthy: true,
            slow_health: Duration::ZERO,
            stateful: false,
            refuse_connections: false,
        }
    }

    /// Open a connection owned by this instance.
    pub fn open(&mut self, id: &str) -> ConnectionHandle {
        let handle = ConnectionHandle::new(id, FakeSocket::new());
        self.connections.insert(id.to_string(), handle.clone());
        handle
    }
}

#[async_trait::async_trait]
impl OpsPlugin for ServicePlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    async fn initialize(&mut self, ctx: &PluginContext) -> PluginResult<()> {
        if ctx.setting::<bool>("fail_init").unwrap_or(false) {
            return Err(PluginError::InitFailed(format!("{} refused to start", ctx.plugin)));
        }
        self.healthy = ctx.setting::<bool>("healthy").unwrap_or(true);
        self.slow_health = Duration::from_millis(ctx.setting::<u64>("slow_health_ms").unwrap_or(0));
        self.stateful = ctx.setting::<bool>("stateful").unwrap_or(false);
        self.refuse_connections = ctx.setting::<bool>("refuse_connections").unwrap_or(false);
        for id in ctx.setting::<Vec<String>>("open").unwrap_or_default() {
            self.open(&id);
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> PluginResult<()> {
        for handle in self.connections.values() {
            handle.close();
        }
        self.connections.clear();
        Ok(())
    }

    async fn health_check(&self) -> PluginResult<bool> {
        if !self.slow_health.is_zero() {
            tokio::time::sleep(self.slow_health).await;
        }
        Ok(self.healthy)
    }

    fn attributes(&self) -> HashMap<String, serde_json::Value> {
        HashMap::from([("counter".to_string(), serde_json::json!(self.counter))])
    }

    fn apply_attributes(
        &mut self,
        attributes: &HashMap<String, serde_json::Value>,
    ) -> PluginResult<()> {
        if let Some(counter) = attributes.get("counter") {
            self.counter = counter
                .as_i64()
                .ok_or_else(|| PluginError::IncompatibleState("counter".to_string()))?;
        }
        Ok(())
    }

    fn export_state(&self) -> Option<Vec<u8>> {
        if !self.stateful {
            return None;
        }
        serde_json::to_vec(&self.journal).ok()
    }

    fn import_state(&mut self, blob: &[u8]) -> PluginResult<bool> {
        if self.switches.reject_state.load(Ordering::SeqCst) {
            return Err(PluginError::IncompatibleState("journal schema changed".to_string()));
        }
        if !self.stateful {
            return Ok(false);
        }
        self.journal = serde_json::from_slice(blob)?;
        Ok(true)
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
        if self.refuse_connections {
            return Err(handle);
        }
        self.connections.insert(handle.id().to_string(), handle);
        Ok(())
    }

    fn commands(&self) -> Vec<CommandSpec> {
        if !self.manifest.has_capability(Capability::CommandProvider) {
            return Vec::new();
        }
        vec![CommandSpec::new("status", "Show plugin status")]
    }

    async fn execute(&mut self, command: &str, args: &[String]) -> PluginResult<String> {
        match command {
            "status" => Ok(format!("{} {}", self.manifest.name, self.manifest.version)),
            "journal" => Ok(self.journal.join(",")),
            "bump" => {
                self.counter += 1;
                self.journal.extend(args.iter().cloned());
                Ok(self.counter.to_string())
            }
            other => Err(PluginError::Unsupported(other.to_string())),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manifests
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for a `*.plugin.toml` manifest using the `service` factory.
#[derive(Debug, Clone)]
pub struct Manifest {
    name: String,
    version: String,
    dependencies: Vec<String>,
    capabilities: Vec<String>,
    requires: Vec<(String, String)>,
    settings: Vec<(String, String)>,
}

impl Manifest {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            dependencies: Vec::new(),
            capabilities: vec!["service-provider".to_string()],
            requires: Vec::new(),
            settings: Vec::new(),
        }
    }

    pub fn depends_on(mut self, dep: &str) -> Self {
        self.dependencies.push(dep.to_string());
        self
    }

    pub fn capability(mut self, cap: &str) -> Self {
        self.capabilities.push(cap.to_string());
        self
    }

    pub fn without_capabilities(mut self) -> Self {
        self.capabilities.clear();
        self
    }

    pub fn requires(mut self, dep: &str, req: &str) -> Self {
        self.requires.push((dep.to_string(), req.to_string()));
        self
    }

    /// Add a setting; `value` is a TOML literal.
    pub fn setting(mut self, key: &str, value: &str) -> Self {
        self.settings.push((key.to_string(), value.to_string()));
        self
    }

    pub fn render(&self) -> String {
        let quoted = |items: &[String]| {
            items
                .iter()
                .map(|i| format!("{:?}", i))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut out = format!(
            "name = {:?}\nversion = {:?}\nfactory = \"service\"\ndependencies = [{}]\ncapabilities = [{}]\n",
            self.name,
            self.version,
            quoted(&self.dependencies),
            quoted(&self.capabilities),
        );
        out.push_str("\n[requires]\n");
        for (dep, req) in &self.requires {
            out.push_str(&format!("{} = {:?}\n", dep, req));
        }
        out.push_str("\n[settings]\n");
        for (key, value) in &self.settings {
            out.push_str(&format!("{} = {}\n", key, value));
        }
        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fixture
// ─────────────────────────────────────────────────────────────────────────────

pub struct Fixture {
    pub dir: TempDir,
    pub switches: Arc<Switches>,
    pub coordinator: Arc<ReloadCoordinator>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(
            HotReloadConfig::new()
                .with_strategy(ReloadStrategy::Manual)
                .with_health_check_timeout(Duration::from_millis(200)),
        )
    }

    pub fn with_config(config: HotReloadConfig) -> Self {
        init_tracing();
        let switches = Arc::new(Switches::default());
        let loader = ManifestLoader::new();
        {
            let switches = switches.clone();
            loader.register_factory("service", move |manifest| {
                Ok(Box::new(ServicePlugin::new(manifest, switches.clone())))
            });
        }

        Self {
            dir: tempfile::tempdir().unwrap(),
            switches,
            coordinator: Arc::new(ReloadCoordinator::new(Arc::new(loader), config)),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(format!("{}.plugin.toml", name))
    }

    /// Write a manifest and return its location.
    pub fn write(&self, manifest: &Manifest) -> PathBuf {
        let path = self.path(&manifest.name);
        std::fs::write(&path, manifest.render()).unwrap();
        path
    }

    /// Overwrite a plugin's code unit with arbitrary text.
    pub fn write_raw(&self, name: &str, text: &str) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    /// Write and load a manifest; panics if the load fails.
    pub async fn install(&self, manifest: Manifest) -> PathBuf {
        let path = self.write(&manifest);
        self.coordinator
            .load(&path)
            .await
            .unwrap_or_else(|e| panic!("loading {:?} failed: {:?}", path, e));
        path
    }

    pub async fn version_of(&self, name: &str) -> String {
        self.coordinator
            .with_plugin(name, |p| p.version().to_string())
            .await
            .unwrap()
    }

    pub async fn counter_of(&self, name: &str) -> i64 {
        self.coordinator
            .with_plugin(name, |p| p.attributes()["counter"].as_i64().unwrap())
            .await
            .unwrap()
    }

    pub async fn journal_of(&self, name: &str) -> String {
        self.coordinator
            .execute(name, "journal", &[])
            .await
            .unwrap()
    }

    pub async fn bump(&self, name: &str, entry: &str) {
        self.coordinator
            .execute(name, "bump", &[entry.to_string()])
            .await
            .unwrap();
    }
}

/// Install a test subscriber once; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Phase changes in `events`, in order.
pub fn phases(events: &[ReloadEvent]) -> Vec<(String, ReloadPhase)> {
    events
        .iter()
        .filter_map(|e| match e {
            ReloadEvent::PhaseChanged { plugin, phase } => Some((plugin.clone(), *phase)),
            _ => None,
        })
        .collect()
}

/// Drain every event currently buffered on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<ReloadEvent>) -> Vec<ReloadEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Listener recording every callback.
#[derive(Default)]
pub struct RecordingListener {
    pub committed: Mutex<Vec<(String, String)>>,
    pub rolled_back: Mutex<Vec<(String, String)>>,
}

impl ReloadListener for RecordingListener {
    fn on_plugin_committed(&self, name: &str, version: &str) {
        self.committed
            .lock()
            .push((name.to_string(), version.to_string()));
    }

    fn on_plugin_rolled_back(&self, name: &str, reason: &str) {
        self.rolled_back
            .lock()
            .push((name.to_string(), reason.to_string()));
    }
}

/// Shorthand used by the path-based tests.
pub fn touch(path: &Path) {
    let text = std::fs::read_to_string(path).unwrap();
    std::fs::write(path, text).unwrap();
}
