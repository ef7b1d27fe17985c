//! File change detection
//!
//! Watches plugin directories, maps each changed path to the plugin that
//! owns it and collapses bursts of events per plugin into a single
//! [`ReloadRequest`] on the bounded reload queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind, RemoveKind},
};
use opsctl_kernel::{ReloadStrategy, ReloadTrigger};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::registry::PluginRegistry;

/// A request to reload one plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadRequest {
    pub plugin_name: String,
    pub trigger: ReloadTrigger,
    pub enqueued_at: DateTime<Utc>,
}

impl ReloadRequest {
    pub fn new(plugin_name: &str, trigger: ReloadTrigger) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            trigger,
            enqueued_at: Utc::now(),
        }
    }

    pub fn file_change(plugin_name: &str) -> Self {
        Self::new(plugin_name, ReloadTrigger::FileChange)
    }

    pub fn manual(plugin_name: &str) -> Self {
        Self::new(plugin_name, ReloadTrigger::Manual)
    }
}

/// Resolve `path` to its canonical spelling so paths seen by the watcher
/// and locations recorded at load time compare equal. A path that no longer
/// exists is resolved through its parent; a path that cannot be resolved at
/// all is returned as given.
pub(crate) fn canonical(path: &Path) -> PathBuf {
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return resolved;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(file)) => std::fs::canonicalize(parent)
            .map(|dir| dir.join(file))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// Watch configuration
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// File extensions to watch
    pub extensions: Vec<String>,
    /// Whether to watch subdirectories
    pub recursive: bool,
    /// Ignore patterns (`*suffix`, `prefix*` or an exact file name)
    pub ignore_patterns: Vec<String>,
    /// How often expired cooldown windows are flushed
    pub tick: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            extensions: vec![
                "toml".to_string(),
                "so".to_string(),
                "dylib".to_string(),
                "dll".to_string(),
            ],
            recursive: true,
            ignore_patterns: vec!["*.tmp".to_string(), "*.swp".to_string(), "*~".to_string()],
            tick: Duration::from_millis(100),
        }
    }
}

impl WatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add file extension to watch
    pub fn with_extension(mut self, ext: &str) -> Self {
        self.extensions.push(ext.to_string());
        self
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Add ignore pattern
    pub fn with_ignore(mut self, pattern: &str) -> Self {
        self.ignore_patterns.push(pattern.to_string());
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Check if a path should be watched
    pub fn should_watch(&self, path: &Path) -> bool {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !self.extensions.is_empty() && !self.extensions.iter().any(|e| e == ext) {
            return false;
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        !self.ignore_patterns.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                file_name.ends_with(suffix)
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                file_name.starts_with(prefix)
            } else {
                file_name == pattern
            }
        })
    }
}

/// Per-plugin cooldown window.
///
/// The first event for a plugin opens a window; later events inside it are
/// absorbed. When the window ends the plugin is due exactly once.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    deadlines: HashMap<String, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadlines: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record an event. Returns `true` if it opened a new window.
    pub fn observe(&mut self, plugin: &str, now: Instant) -> bool {
        if self.deadlines.contains_key(plugin) {
            debug!(plugin = %plugin, "Change absorbed by cooldown window");
            return false;
        }
        self.deadlines.insert(plugin.to_string(), now + self.window);
        true
    }

    /// Plugins whose window has ended, sorted by name.
    pub fn due(&mut self, now: Instant) -> Vec<String> {
        let mut due: Vec<String> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(name, _)| name.clone())
            .collect();
        due.sort();
        for name in &due {
            self.deadlines.remove(name);
        }
        due
    }

    pub fn pending(&self) -> usize {
        self.deadlines.len()
    }
}

/// Turns raw path changes into reload requests.
pub struct ChangeRouter {
    config: WatchConfig,
    strategy: ReloadStrategy,
    registry: Arc<PluginRegistry>,
    debouncer: Debouncer,
    tx: mpsc::Sender<ReloadRequest>,
}

impl ChangeRouter {
    pub fn new(
        config: WatchConfig,
        strategy: ReloadStrategy,
        registry: Arc<PluginRegistry>,
        tx: mpsc::Sender<ReloadRequest>,
    ) -> Self {
        let window = strategy.cooldown().unwrap_or_default();
        Self {
            config,
            strategy,
            registry,
            debouncer: Debouncer::new(window),
            tx,
        }
    }

    /// Handle changed paths observed at `now`.
    ///
    /// Returns `false` once the reload queue is closed.
    pub async fn on_paths(&mut self, paths: &[PathBuf], now: Instant) -> bool {
        if !self.strategy.watches_files() {
            return true;
        }

        for path in paths {
            if !self.config.should_watch(path) {
                continue;
            }
            let owner = self
                .registry
                .owner_of(path)
                .or_else(|| self.registry.owner_of(&canonical(path)));
            let Some(plugin) = owner else {
                debug!("No plugin owns {:?}", path);
                continue;
            };

            debug!(plugin = %plugin, "Source change at {:?}", path);
            if self.debouncer.observe(&plugin, now) && self.debouncer.window().is_zero() {
                self.debouncer.due(now);
                if !self.send(&plugin).await {
                    return false;
                }
            }
        }
        true
    }

    /// Emit requests for every expired window.
    pub async fn flush(&mut self, now: Instant) -> bool {
        for plugin in self.debouncer.due(now) {
            if !self.send(&plugin).await {
                return false;
            }
        }
        true
    }

    async fn send(&self, plugin: &str) -> bool {
        info!(plugin = %plugin, "Queueing reload after file change");
        if self.tx.send(ReloadRequest::file_change(plugin)).await.is_err() {
            error!("Reload queue closed");
            return false;
        }
        true
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File)
            | EventKind::Create(CreateKind::Any)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Remove(RemoveKind::File)
            | EventKind::Remove(RemoveKind::Any)
    )
}

/// Plugin file watcher
pub struct PluginWatcher {
    watch_paths: Arc<RwLock<Vec<PathBuf>>>,
    config: WatchConfig,
    strategy: ReloadStrategy,
    registry: Arc<PluginRegistry>,
    request_tx: mpsc::Sender<ReloadRequest>,
    watcher: Option<RecommendedWatcher>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl PluginWatcher {
    pub fn new(
        config: WatchConfig,
        strategy: ReloadStrategy,
        registry: Arc<PluginRegistry>,
        request_tx: mpsc::Sender<ReloadRequest>,
    ) -> Self {
        Self {
            watch_paths: Arc::new(RwLock::new(Vec::new())),
            config,
            strategy,
            registry,
            request_tx,
            watcher: None,
            shutdown_tx: None,
        }
    }

    fn mode(&self) -> RecursiveMode {
        if self.config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        }
    }

    /// Add a directory to watch
    pub async fn watch<P: AsRef<Path>>(&mut self, path: P) -> Result<(), notify::Error> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            warn!("Watch path does not exist: {:?}", path);
            return Ok(());
        }

        info!("Adding watch path: {:?}", path);
        {
            let mut paths = self.watch_paths.write().await;
            if !paths.contains(&path) {
                paths.push(path.clone());
            }
        }

        let mode = self.mode();
        if let Some(ref mut watcher) = self.watcher {
            watcher.watch(&path, mode)?;
        }

        Ok(())
    }

    /// Remove a directory from watching
    pub async fn unwatch<P: AsRef<Path>>(&mut self, path: P) -> Result<(), notify::Error> {
        let path = path.as_ref().to_path_buf();

        info!("Removing watch path: {:?}", path);
        self.watch_paths.write().await.retain(|p| p != &path);

        if let Some(ref mut watcher) = self.watcher {
            watcher.unwatch(&path)?;
        }

        Ok(())
    }

    /// Start watching for changes
    pub async fn start(&mut self) -> Result<(), notify::Error> {
        if !self.strategy.watches_files() {
            info!("Manual reload strategy; file changes are ignored");
            return Ok(());
        }

        info!("Starting plugin watcher");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let (tx, mut rx) = mpsc::channel(1024);
        let watcher_config = Config::default().with_poll_interval(Duration::from_millis(100));
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let _ = tx.blocking_send(event);
                }
                Err(e) => warn!("Watch error: {}", e),
            },
            watcher_config,
        )?;

        let mode = self.mode();
        for path in self.watch_paths.read().await.iter() {
            watcher.watch(path, mode)?;
        }
        self.watcher = Some(watcher);

        let mut router = ChangeRouter::new(
            self.config.clone(),
            self.strategy.clone(),
            self.registry.clone(),
            self.request_tx.clone(),
        );
        let mut ticker = tokio::time::interval(self.config.tick);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = rx.recv() => {
                        if !is_change(&event.kind) {
                            continue;
                        }
                        if !router.on_paths(&event.paths, Instant::now()).await {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        if !router.flush(Instant::now()).await {
                            return;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Plugin watcher shutting down");
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop watching
    pub async fn stop(&mut self) {
        info!("Stopping plugin watcher");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        self.watcher = None;
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    pub async fn watched_paths(&self) -> Vec<PathBuf> {
        self.watch_paths.read().await.clone()
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Files in the watched directories that look like plugin code units.
    pub async fn scan_existing(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let paths = self.watch_paths.read().await;

        for watch_path in paths.iter() {
            if let Ok(entries) = std::fs::read_dir(watch_path) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_file() && self.config.should_watch(&path) {
                        found.push(path);
                    }
                }
            }
        }

        found.sort();
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hot_reload::registry::{PluginDescriptor, PluginVersion};

    fn registry_with(name: &str, location: &Path) -> Arc<PluginRegistry> {
        let registry = Arc::new(PluginRegistry::new());
        registry
            .register(
                PluginDescriptor::new(name, PluginVersion::new(1, 0, 0))
                    .with_source_location(location),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_should_watch() {
        let config = WatchConfig::default();

        assert!(config.should_watch(Path::new("/plugins/gateway.plugin.toml")));
        assert!(config.should_watch(Path::new("/plugins/libcharts.so")));
        assert!(!config.should_watch(Path::new("/plugins/notes.txt")));
        assert!(!config.should_watch(Path::new("/plugins/libcharts.so.tmp")));
        assert!(!config.should_watch(Path::new("/plugins/gateway.plugin.toml~")));

        let config = WatchConfig::new().with_ignore(".#*");
        assert!(!config.should_watch(Path::new("/plugins/.#gateway.toml")));
    }

    #[test]
    fn test_debouncer_collapses_a_burst() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(500));

        assert!(debouncer.observe("gateway", start));
        for i in 1..10 {
            assert!(!debouncer.observe("gateway", start + Duration::from_millis(i * 20)));
        }
        assert!(debouncer.observe("charts", start + Duration::from_millis(100)));

        assert!(debouncer.due(start + Duration::from_millis(499)).is_empty());
        assert_eq!(debouncer.due(start + Duration::from_millis(500)), vec!["gateway"]);
        assert_eq!(debouncer.due(start + Duration::from_millis(600)), vec!["charts"]);
        assert_eq!(debouncer.pending(), 0);

        // A later change opens a fresh window.
        assert!(debouncer.observe("gateway", start + Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_router_emits_one_request_per_window() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("gateway.plugin.toml");
        let registry = registry_with("gateway", &manifest);
        let (tx, mut rx) = mpsc::channel(8);
        let mut router = ChangeRouter::new(
            WatchConfig::default(),
            ReloadStrategy::Debounced(Duration::from_secs(1)),
            registry,
            tx,
        );

        let start = Instant::now();
        for i in 0..5 {
            let at = start + Duration::from_millis(i * 100);
            assert!(router.on_paths(std::slice::from_ref(&manifest), at).await);
        }
        // Unowned and ignored paths never produce requests.
        router
            .on_paths(&[dir.path().join("other.plugin.toml"), dir.path().join("x.swp")], start)
            .await;
        assert!(rx.try_recv().is_err());

        router.flush(start + Duration::from_secs(1)).await;
        let request = rx.try_recv().unwrap();
        assert_eq!(request.plugin_name, "gateway");
        assert_eq!(request.trigger, ReloadTrigger::FileChange);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_router_strategies() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("gateway.plugin.toml");
        let (tx, mut rx) = mpsc::channel(8);

        let mut immediate = ChangeRouter::new(
            WatchConfig::default(),
            ReloadStrategy::Immediate,
            registry_with("gateway", &manifest),
            tx.clone(),
        );
        immediate.on_paths(std::slice::from_ref(&manifest), Instant::now()).await;
        immediate.on_paths(std::slice::from_ref(&manifest), Instant::now()).await;
        assert_eq!(rx.try_recv().unwrap().plugin_name, "gateway");
        assert_eq!(rx.try_recv().unwrap().plugin_name, "gateway");

        let mut manual = ChangeRouter::new(
            WatchConfig::default(),
            ReloadStrategy::Manual,
            registry_with("gateway", &manifest),
            tx,
        );
        manual.on_paths(std::slice::from_ref(&manifest), Instant::now()).await;
        manual.flush(Instant::now() + Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_router_matches_other_spellings_of_a_location() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        let manifest = dir.path().join("gateway.plugin.toml");
        std::fs::write(&manifest, "").unwrap();

        let registry = registry_with("gateway", &canonical(&manifest));
        let (tx, mut rx) = mpsc::channel(8);
        let mut router = ChangeRouter::new(
            WatchConfig::default(),
            ReloadStrategy::Immediate,
            registry,
            tx,
        );

        let detour = dir.path().join("nested").join("..").join("gateway.plugin.toml");
        router.on_paths(&[detour], Instant::now()).await;
        assert_eq!(rx.try_recv().unwrap().plugin_name, "gateway");

        // Removed files resolve through their directory.
        std::fs::remove_file(&manifest).unwrap();
        assert_eq!(canonical(&manifest), canonical(dir.path()).join("gateway.plugin.toml"));
    }

    #[tokio::test]
    async fn test_router_stops_when_queue_closes() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("gateway.plugin.toml");
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let mut router = ChangeRouter::new(
            WatchConfig::default(),
            ReloadStrategy::Immediate,
            registry_with("gateway", &manifest),
            tx,
        );
        assert!(!router.on_paths(&[manifest], Instant::now()).await);
    }

    #[tokio::test]
    async fn test_scan_existing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gateway.plugin.toml"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();

        let (tx, _rx) = mpsc::channel(1);
        let mut watcher = PluginWatcher::new(
            WatchConfig::default(),
            ReloadStrategy::default(),
            Arc::new(PluginRegistry::new()),
            tx,
        );
        watcher.watch(dir.path()).await.unwrap();
        watcher.watch(dir.path().join("missing")).await.unwrap();

        assert_eq!(watcher.watched_paths().await.len(), 1);
        assert_eq!(
            watcher.scan_existing().await,
            vec![dir.path().join("gateway.plugin.toml")]
        );
        assert!(!watcher.is_running());
    }
}
