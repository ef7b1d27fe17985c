//! Reload coordinator
//!
//! Sequences every load, reload and unload. One reload unit runs at a time;
//! inside a unit each plugin goes through
//!
//! ```text
//! Pending -> Validating -> Snapshotting -> Swapping -> Restoring -> HealthChecking
//!         -> Committed | RolledBack
//! ```
//!
//! and a plugin is only attempted after every dependency in the unit
//! committed. The previous instance is kept aside until the new one is
//! healthy; calls to a plugin that arrive during its swap wait on the
//! plugin's instance slot until commit or rollback.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use error_stack::Report;
use opsctl_kernel::{
    Capability, CommandSpec, ConnectionHandle, HotReloadConfig, OpsPlugin, PluginContext,
    PluginManifest, ReloadEvent, ReloadListener, ReloadPhase, ReloadTrigger,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::loader::{Candidate, PluginLoader};
use super::outcome::{OutcomeKind, PluginStatus, ReloadOutcome, UnitReport};
use super::registry::{PluginDescriptor, PluginRegistry, PluginState, RegistryError};
use super::resolver::{DependencyGraph, ResolveError};
use super::state::{Snapshotter, StateSnapshot};
use super::transfer::ConnectionTransferManager;
use super::validator::{ValidationContext, ValidationResult, ValidationStage, Validator};
use super::watcher::{PluginWatcher, ReloadRequest, WatchConfig, canonical};
use crate::error::{IntoRuntimeReport, RuntimeError, RuntimeResult};
use crate::settings::RuntimeSettings;

type Slot = Arc<AsyncMutex<Box<dyn OpsPlugin>>>;

#[derive(Debug, Clone, Copy)]
struct Attempt {
    phase: ReloadPhase,
    cancel_requested: bool,
}

/// Reload coordinator
pub struct ReloadCoordinator {
    registry: Arc<PluginRegistry>,
    graph: RwLock<DependencyGraph>,
    loader: Arc<dyn PluginLoader>,
    validator: Validator,
    snapshotter: Snapshotter,
    transfers: ConnectionTransferManager,
    /// Live instances; each slot is locked for the length of a swap
    instances: RwLock<HashMap<String, Slot>>,
    /// Serializes reload units, loads and unloads
    unit_lock: AsyncMutex<()>,
    queue: Mutex<VecDeque<ReloadRequest>>,
    queue_notify: Notify,
    attempts: Mutex<HashMap<String, Attempt>>,
    last_outcomes: RwLock<HashMap<String, ReloadOutcome>>,
    event_tx: broadcast::Sender<ReloadEvent>,
    listeners: RwLock<Vec<Arc<dyn ReloadListener>>>,
    config: HotReloadConfig,
    context: PluginContext,
    plugin_settings: HashMap<String, HashMap<String, serde_json::Value>>,
}

impl ReloadCoordinator {
    pub fn new(loader: Arc<dyn PluginLoader>, config: HotReloadConfig) -> Self {
        let (event_tx, _) = broadcast::channel(1024);

        Self {
            registry: Arc::new(PluginRegistry::new()),
            graph: RwLock::new(DependencyGraph::new()),
            validator: Validator::new(loader.clone()),
            loader,
            snapshotter: Snapshotter::new(),
            transfers: ConnectionTransferManager::new(),
            instances: RwLock::new(HashMap::new()),
            unit_lock: AsyncMutex::new(()),
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            attempts: Mutex::new(HashMap::new()),
            last_outcomes: RwLock::new(HashMap::new()),
            event_tx,
            listeners: RwLock::new(Vec::new()),
            config,
            context: PluginContext::new("opsctl"),
            plugin_settings: HashMap::new(),
        }
    }

    /// Coordinator configured from a runtime settings document: reload
    /// policy, snapshot persistence and per-plugin host settings.
    pub fn from_settings(loader: Arc<dyn PluginLoader>, settings: &RuntimeSettings) -> Self {
        let mut coordinator = Self::new(loader, settings.hot_reload_config());
        if let Some(dir) = &settings.hot_reload.snapshot_dir {
            coordinator = coordinator.with_snapshotter(Snapshotter::new().with_persistence(dir));
        }
        for (plugin, values) in &settings.plugins {
            coordinator = coordinator.with_plugin_settings(plugin, values.clone());
        }
        coordinator
    }

    pub fn with_snapshotter(mut self, snapshotter: Snapshotter) -> Self {
        self.snapshotter = snapshotter;
        self
    }

    /// Host context every plugin context is derived from.
    pub fn with_context(mut self, context: PluginContext) -> Self {
        self.context = context;
        self
    }

    /// Host settings for one plugin, overlaid on its manifest settings.
    pub fn with_plugin_settings(
        mut self,
        plugin: &str,
        settings: HashMap<String, serde_json::Value>,
    ) -> Self {
        self.plugin_settings.insert(plugin.to_string(), settings);
        self
    }

    pub fn registry(&self) -> Arc<PluginRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &HotReloadConfig {
        &self.config
    }

    pub fn snapshotter(&self) -> &Snapshotter {
        &self.snapshotter
    }

    /// Subscribe to reload events
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.event_tx.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn ReloadListener>) {
        self.listeners.write().push(listener);
    }

    // ------------------------------------------------------------------
    // Loading and unloading
    // ------------------------------------------------------------------

    /// Validate, register, construct, initialize and activate the plugin
    /// at `location`. Loading a `Failed` plugin replaces its instance.
    pub async fn load(&self, location: impl AsRef<Path>) -> RuntimeResult<PluginStatus> {
        let _unit = self.unit_lock.lock().await;
        self.load_locked(location.as_ref(), None).await
    }

    /// Load several code units, dependencies first.
    pub async fn load_all<P: AsRef<Path>>(
        &self,
        locations: &[P],
    ) -> Vec<(PathBuf, RuntimeResult<PluginStatus>)> {
        let mut results = Vec::new();
        let mut by_name: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut graph = DependencyGraph::new();

        for location in locations {
            let location = location.as_ref().to_path_buf();
            match self.loader.prepare(&location).await {
                Ok(candidate) => {
                    graph.set_dependencies(
                        &candidate.manifest.name,
                        candidate.manifest.dependencies.iter().cloned(),
                    );
                    by_name.insert(candidate.manifest.name, location);
                }
                Err(e) => {
                    let err = RuntimeError::Validation {
                        plugin: location.display().to_string(),
                        stage: ValidationStage::Syntax,
                        message: e.to_string(),
                    };
                    results.push((location, Err(Report::new(err))));
                }
            }
        }

        let order = match graph.load_order() {
            Ok(order) => order,
            Err(e) => {
                error!("Refusing to load plugin set: {}", e);
                for (_, location) in by_name {
                    results.push((location, Err(Report::new(RuntimeError::from(e.clone())))));
                }
                return results;
            }
        };

        for name in order {
            if let Some(location) = by_name.remove(&name) {
                let loaded = self.load(&location).await;
                results.push((location, loaded));
            }
        }
        results
    }

    /// `expected` names the plugin a recovery must reinstate; the candidate
    /// is rejected at the interface-shape stage when it carries another name.
    async fn load_locked(
        &self,
        location: &Path,
        expected: Option<&str>,
    ) -> RuntimeResult<PluginStatus> {
        let location = canonical(location);
        info!("Loading plugin from {:?}", location);

        let registry = self.registry.clone();
        let (result, candidate) = self
            .validator
            .validate_with(&location, move |manifest| {
                let name = expected.unwrap_or(manifest.name.as_str());
                let ctx = ValidationContext::for_load(&registry, name);
                match registry.get(name) {
                    Ok(existing) if existing.state() == PluginState::Failed => ValidationContext {
                        expected_name: Some(existing.name.clone()),
                        prior_capabilities: existing.capabilities.clone(),
                        ..ctx
                    },
                    _ => ValidationContext {
                        expected_name: expected.map(str::to_string),
                        ..ctx
                    },
                }
            })
            .await;

        let Some(candidate) = candidate else {
            return Err(Report::new(validation_error(
                &location.display().to_string(),
                &result,
            )));
        };

        let manifest = candidate.manifest.clone();
        let name = manifest.name.clone();

        let mut graph = self.graph.read().clone();
        graph.set_dependencies(&name, manifest.dependencies.iter().cloned());
        graph.compute_reload_order(&name).into_report()?;

        let from = match self.registry.get(&name).map(|d| d.state()) {
            Err(_) => {
                let descriptor = PluginDescriptor::from_manifest(&manifest)
                    .into_report()?
                    .with_source_location(&location);
                self.registry.register(descriptor).into_report()?;
                PluginState::Unloaded
            }
            Ok(state @ (PluginState::Unloaded | PluginState::Failed)) => state,
            Ok(_) => return Err(RegistryError::DuplicateName(name)).into_report(),
        };

        self.registry
            .transition_with(&name, from, PluginState::Loading, |d| {
                d.source_locations.insert(location.clone());
                Ok(())
            })
            .into_report()?;

        let previous = self.instances.write().remove(&name);
        if let Some(slot) = previous {
            let mut instance = slot.lock().await;
            self.retire(&name, &mut **instance).await;
        }

        let mut instance = match self.construct(&candidate).await {
            Ok(instance) => instance,
            Err(reason) => return Err(self.fail_load(&name, reason)),
        };
        if let Err(reason) = self.check_health(&*instance).await {
            self.retire(&name, &mut *instance).await;
            return Err(self.fail_load(&name, reason));
        }

        self.instances
            .write()
            .insert(name.clone(), Arc::new(AsyncMutex::new(instance)));
        self.graph
            .write()
            .set_dependencies(&name, manifest.dependencies.iter().cloned());

        let descriptor = self
            .registry
            .transition_with(&name, PluginState::Loading, PluginState::Active, |d| {
                d.apply_manifest(&manifest)?;
                if from == PluginState::Failed {
                    d.reload_count += 1;
                }
                d.file_hash = Some(candidate.hash.clone());
                d.last_loaded_at = Some(Utc::now());
                d.last_error = None;
                Ok(())
            })
            .into_report()?;

        info!(plugin = %name, version = %descriptor.version, "Plugin loaded");
        self.emit(ReloadEvent::PluginLoaded {
            plugin: name.clone(),
            version: descriptor.version.to_string(),
        });
        Ok(self.status_of(&descriptor))
    }

    fn fail_load(&self, name: &str, reason: String) -> Report<RuntimeError> {
        error!(plugin = %name, "Plugin failed to start: {}", reason);
        if let Err(e) =
            self.registry
                .transition_with(name, PluginState::Loading, PluginState::Failed, |d| {
                    d.last_error = Some(reason.clone());
                    Ok(())
                })
        {
            error!(plugin = %name, "Could not mark plugin failed: {}", e);
        }
        Report::new(RuntimeError::StartFailed {
            name: name.to_string(),
            reason,
        })
    }

    /// Clean up and unregister a plugin, closing its connections.
    ///
    /// Refused while an active plugin still depends on it.
    pub async fn unload(&self, name: &str) -> RuntimeResult<()> {
        let _unit = self.unit_lock.lock().await;
        self.unload_locked(name).await
    }

    /// Unload every plugin, dependents first.
    pub async fn unload_all(&self) -> RuntimeResult<()> {
        let _unit = self.unit_lock.lock().await;

        let order = self.graph.read().load_order();
        let mut names = order.unwrap_or_else(|_| self.registry.names());
        names.reverse();

        for name in names {
            if self.registry.contains(&name) {
                self.unload_locked(&name).await?;
            }
        }
        Ok(())
    }

    async fn unload_locked(&self, name: &str) -> RuntimeResult<()> {
        let descriptor = self.registry.get(name).into_report()?;

        let dependents: Vec<String> = self
            .graph
            .read()
            .dependents_of(name)
            .into_iter()
            .filter(|d| self.registry.state(d) == Ok(PluginState::Active))
            .collect();
        if !dependents.is_empty() {
            return Err(Report::new(RuntimeError::HasDependents {
                name: name.to_string(),
                dependents,
            }));
        }

        self.registry
            .transition(name, descriptor.state(), PluginState::Unloaded)
            .into_report()?;

        let slot = self.instances.write().remove(name);
        if let Some(slot) = slot {
            let mut instance = slot.lock().await;
            self.retire(name, &mut **instance).await;
        }
        self.loader.release(name);

        self.registry.unregister(name).into_report()?;
        self.graph.write().remove(name);
        self.snapshotter.clear(name).await;
        self.last_outcomes.write().remove(name);

        info!(plugin = %name, "Plugin unloaded");
        self.emit(ReloadEvent::PluginUnloaded {
            plugin: name.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reload units
    // ------------------------------------------------------------------

    /// Reload `name` and its dependents now. A `Failed` plugin is loaded
    /// fresh from its source location.
    pub async fn reload(&self, name: &str) -> RuntimeResult<UnitReport> {
        self.process(ReloadRequest::manual(name)).await
    }

    /// Run one reload unit.
    pub async fn process(&self, request: ReloadRequest) -> RuntimeResult<UnitReport> {
        let _unit = self.unit_lock.lock().await;

        let name = request.plugin_name.clone();
        let descriptor = self.registry.get(&name).into_report()?;
        let mut report = UnitReport::new(&name, request.trigger);

        if descriptor.state() == PluginState::Failed {
            let outcome = self.recover(&descriptor, request.trigger).await;
            self.record(&outcome);
            report.outcomes.push(outcome);
            return Ok(report);
        }

        let resolved = self.graph.read().compute_reload_order(&name);
        let order = match resolved {
            Ok(order) => order,
            Err(ResolveError::CyclicDependency { cycle }) => {
                let reason = format!("cyclic dependency among {}", cycle.join(", "));
                error!(plugin = %name, "Reload unit aborted: {}", reason);
                self.emit(ReloadEvent::Skipped {
                    plugin: name.clone(),
                    reason: reason.clone(),
                });
                let outcome = ReloadOutcome::new(
                    &name,
                    &descriptor.version.to_string(),
                    request.trigger,
                    OutcomeKind::CyclicDependency,
                )
                .with_reason(reason);
                self.record(&outcome);
                report.outcomes.push(outcome);
                return Ok(report);
            }
            Err(e) => return Err(Report::new(RuntimeError::from(e))),
        };

        info!(plugin = %name, trigger = %request.trigger, order = ?order, "Reload unit started");
        for plugin in &order {
            self.enter(plugin, ReloadPhase::Pending);
        }

        let mut failed: BTreeSet<String> = BTreeSet::new();
        for (index, plugin) in order.iter().enumerate() {
            let trigger = if index == 0 {
                request.trigger
            } else {
                ReloadTrigger::DependencyCascade
            };

            let blocked: Vec<String> = self
                .graph
                .read()
                .dependencies_of(plugin)
                .intersection(&failed)
                .cloned()
                .collect();

            let outcome = if blocked.is_empty() {
                self.reload_one(plugin, trigger, &order).await
            } else {
                self.not_attempted(
                    plugin,
                    trigger,
                    format!("dependency did not commit: {}", blocked.join(", ")),
                )
            };

            if !outcome.is_committed() {
                failed.insert(plugin.clone());
            }
            self.record(&outcome);
            report.outcomes.push(outcome);
        }

        info!(
            plugin = %name,
            committed = report.outcomes.iter().filter(|o| o.is_committed()).count(),
            total = report.outcomes.len(),
            "Reload unit finished"
        );
        Ok(report)
    }

    async fn reload_one(&self, name: &str, trigger: ReloadTrigger, unit: &[String]) -> ReloadOutcome {
        let started = Instant::now();
        let descriptor = match self.registry.get(name) {
            Ok(descriptor) => descriptor,
            Err(e) => return self.not_attempted(name, trigger, e.to_string()),
        };
        let from_version = descriptor.version.to_string();

        if !self.enter(name, ReloadPhase::Validating) {
            return self.cancelled(name, &from_version, trigger);
        }
        // Compare-and-swap; a concurrent attempt on this plugin fails here.
        if let Err(e) =
            self.registry
                .transition(name, PluginState::Active, PluginState::Reloading)
        {
            return self.not_attempted(name, trigger, e.to_string());
        }

        let Some(location) = descriptor.primary_location().map(Path::to_path_buf) else {
            let outcome = self.reject(
                name,
                &from_version,
                trigger,
                ValidationStage::Syntax,
                "no source location".to_string(),
            );
            return outcome.with_duration(started.elapsed());
        };

        let ctx = ValidationContext::for_reload(&self.registry, &descriptor, unit);
        let (result, candidate) = self.validator.validate(&location, &ctx).await;

        let Some(candidate) = candidate else {
            let (stage, message) = result
                .failure()
                .map(|f| (f.stage, f.message.clone()))
                .unwrap_or((ValidationStage::Syntax, "validation failed".to_string()));
            let outcome = self.reject(name, &from_version, trigger, stage, message);
            return outcome.with_duration(started.elapsed());
        };

        let deps: BTreeSet<String> = candidate.manifest.dependencies.iter().cloned().collect();
        let cycles = self.graph.read().would_cycle(name, &deps);
        if cycles {
            let outcome = self.refuse_cycle(name, &from_version, trigger, &deps);
            return outcome
                .with_to_version(&candidate.manifest.version)
                .with_duration(started.elapsed());
        }

        if !self.enter(name, ReloadPhase::Snapshotting) {
            if let Err(e) =
                self.registry
                    .transition(name, PluginState::Reloading, PluginState::Active)
            {
                error!(plugin = %name, "Could not reactivate cancelled plugin: {}", e);
            }
            return self.cancelled(name, &from_version, trigger);
        }

        let to_version = candidate.manifest.version.clone();
        let slot = self.slot(name);
        let outcome = match slot {
            Some(slot) => {
                self.swap(name, &slot, &candidate, trigger, &from_version)
                    .await
            }
            None => {
                let reason = "no live instance to replace".to_string();
                self.fail_attempt(name, &from_version, trigger, reason)
            }
        };

        outcome
            .with_to_version(&to_version)
            .with_duration(started.elapsed())
    }

    /// Snapshotting through commit or rollback. Holds the instance slot.
    async fn swap(
        &self,
        name: &str,
        slot: &Slot,
        candidate: &Candidate,
        trigger: ReloadTrigger,
        from_version: &str,
    ) -> ReloadOutcome {
        let mut current = slot.lock().await;
        let snapshot = self.snapshotter.capture(&**current).await;

        self.enter(name, ReloadPhase::Swapping);
        let mut next = match self.construct(candidate).await {
            Ok(next) => next,
            Err(reason) => {
                return self
                    .roll_back(name, &mut **current, None, &snapshot, trigger, from_version, reason)
                    .await;
            }
        };

        self.enter(name, ReloadPhase::Restoring);
        let restored = if self.config.preserve_state {
            self.snapshotter.restore(&mut *next, &snapshot).map(|_| ())
        } else {
            Ok(())
        };
        if let Err(e) = restored {
            return self
                .roll_back(
                    name,
                    &mut **current,
                    Some(next),
                    &snapshot,
                    trigger,
                    from_version,
                    e.to_string(),
                )
                .await;
        }
        let ids = self.transfers.detach_all(name, &mut **current);
        self.transfers.attach(name, &mut *next, &ids);

        self.enter(name, ReloadPhase::HealthChecking);
        if let Err(reason) = self.check_health(&*next).await {
            return self
                .roll_back(name, &mut **current, Some(next), &snapshot, trigger, from_version, reason)
                .await;
        }

        if let Err(e) = self.snapshotter.finalize(name).await {
            warn!(plugin = %name, "Snapshot finalize failed: {}", e);
        }
        let manifest = &candidate.manifest;
        let committed = self.registry.transition_with(
            name,
            PluginState::Reloading,
            PluginState::Active,
            |d| {
                d.apply_manifest(manifest)?;
                d.reload_count += 1;
                d.file_hash = Some(candidate.hash.clone());
                d.last_loaded_at = Some(Utc::now());
                d.last_error = None;
                Ok(())
            },
        );
        if let Err(e) = committed {
            return self
                .roll_back(
                    name,
                    &mut **current,
                    Some(next),
                    &snapshot,
                    trigger,
                    from_version,
                    e.to_string(),
                )
                .await;
        }

        let mut previous = std::mem::replace(&mut *current, next);
        drop(current);

        self.graph
            .write()
            .set_dependencies(name, manifest.dependencies.iter().cloned());
        let warnings = self.transfers.finalize_commit(name);
        self.emit_warnings(&warnings);

        if let Err(e) = previous.cleanup().await {
            warn!(plugin = %name, "Cleanup of previous instance failed: {}", e);
        }
        drop(previous);

        self.finish(name, ReloadPhase::Committed);
        info!(plugin = %name, from = %from_version, to = %manifest.version, "Reload committed");
        self.emit(ReloadEvent::Committed {
            plugin: name.to_string(),
            from_version: from_version.to_string(),
            to_version: manifest.version.clone(),
        });
        for listener in self.listeners() {
            listener.on_plugin_committed(name, &manifest.version);
        }

        ReloadOutcome::new(name, from_version, trigger, OutcomeKind::Committed).with_warnings(warnings)
    }

    /// Reinstate the previous instance after a failed swap.
    #[allow(clippy::too_many_arguments)]
    async fn roll_back(
        &self,
        name: &str,
        previous: &mut dyn OpsPlugin,
        discarded: Option<Box<dyn OpsPlugin>>,
        snapshot: &StateSnapshot,
        trigger: ReloadTrigger,
        from_version: &str,
        reason: String,
    ) -> ReloadOutcome {
        error!(plugin = %name, "Reload failed, rolling back: {}", reason);

        if let Some(mut discarded) = discarded {
            self.transfers.recall(name, &mut *discarded);
            if let Err(e) = discarded.cleanup().await {
                warn!(plugin = %name, "Cleanup of discarded instance failed: {}", e);
            }
        }
        let warnings = self.transfers.reclaim(name, previous);
        self.emit_warnings(&warnings);

        let reinstated = if self.config.preserve_state {
            self.snapshotter.restore(previous, snapshot).map(|_| ())
        } else {
            Ok(())
        };
        if let Err(e) = self.snapshotter.finalize(name).await {
            debug!(plugin = %name, "Snapshot finalize: {}", e);
        }

        let (to_state, kind, reason) = match reinstated {
            Ok(()) => (PluginState::Active, OutcomeKind::RolledBack, reason),
            Err(e) => (
                PluginState::Failed,
                OutcomeKind::RollbackFailed,
                format!("{}; previous version could not be reinstated: {}", reason, e),
            ),
        };

        if let Err(e) = self
            .registry
            .transition_with(name, PluginState::Reloading, to_state, |d| {
                d.last_error = Some(reason.clone());
                Ok(())
            })
        {
            error!(plugin = %name, "Could not record rollback: {}", e);
        }

        self.finish(name, ReloadPhase::RolledBack);
        if kind == OutcomeKind::RollbackFailed {
            error!(plugin = %name, "Rollback failed; plugin needs an operator reload");
            self.emit(ReloadEvent::RollbackFailed {
                plugin: name.to_string(),
                reason: reason.clone(),
            });
        } else {
            self.emit(ReloadEvent::RolledBack {
                plugin: name.to_string(),
                reason: reason.clone(),
            });
        }
        for listener in self.listeners() {
            listener.on_plugin_rolled_back(name, &reason);
        }

        ReloadOutcome::new(name, from_version, trigger, kind)
            .with_reason(reason)
            .with_warnings(warnings)
    }

    /// A candidate failed validation; the running instance was never touched.
    fn reject(
        &self,
        name: &str,
        from_version: &str,
        trigger: ReloadTrigger,
        stage: ValidationStage,
        message: String,
    ) -> ReloadOutcome {
        let reason = format!("{} validation failed: {}", stage, message);
        warn!(plugin = %name, stage = %stage, "Candidate rejected: {}", message);

        if let Err(e) = self
            .registry
            .transition_with(name, PluginState::Reloading, PluginState::Active, |d| {
                d.last_error = Some(reason.clone());
                Ok(())
            })
        {
            error!(plugin = %name, "Could not reactivate plugin: {}", e);
        }

        self.finish(name, ReloadPhase::RolledBack);
        self.emit(ReloadEvent::RolledBack {
            plugin: name.to_string(),
            reason: reason.clone(),
        });
        for listener in self.listeners() {
            listener.on_plugin_rolled_back(name, &reason);
        }

        ReloadOutcome::new(name, from_version, trigger, OutcomeKind::ValidationError { stage })
            .with_reason(reason)
    }

    /// The candidate's dependencies would close a cycle; keep the running instance.
    fn refuse_cycle(
        &self,
        name: &str,
        from_version: &str,
        trigger: ReloadTrigger,
        deps: &BTreeSet<String>,
    ) -> ReloadOutcome {
        let reason = format!(
            "new dependencies [{}] would form a cycle",
            deps.iter().cloned().collect::<Vec<_>>().join(", ")
        );
        error!(plugin = %name, "Candidate rejected: {}", reason);

        if let Err(e) = self
            .registry
            .transition_with(name, PluginState::Reloading, PluginState::Active, |d| {
                d.last_error = Some(reason.clone());
                Ok(())
            })
        {
            error!(plugin = %name, "Could not reactivate plugin: {}", e);
        }

        self.finish(name, ReloadPhase::RolledBack);
        self.emit(ReloadEvent::RolledBack {
            plugin: name.to_string(),
            reason: reason.clone(),
        });
        for listener in self.listeners() {
            listener.on_plugin_rolled_back(name, &reason);
        }

        ReloadOutcome::new(name, from_version, trigger, OutcomeKind::CyclicDependency)
            .with_reason(reason)
    }

    fn fail_attempt(
        &self,
        name: &str,
        from_version: &str,
        trigger: ReloadTrigger,
        reason: String,
    ) -> ReloadOutcome {
        error!(plugin = %name, "{}", reason);
        if let Err(e) = self
            .registry
            .transition_with(name, PluginState::Reloading, PluginState::Failed, |d| {
                d.last_error = Some(reason.clone());
                Ok(())
            })
        {
            error!(plugin = %name, "Could not mark plugin failed: {}", e);
        }
        self.finish(name, ReloadPhase::RolledBack);
        self.emit(ReloadEvent::RollbackFailed {
            plugin: name.to_string(),
            reason: reason.clone(),
        });
        ReloadOutcome::new(name, from_version, trigger, OutcomeKind::RollbackFailed).with_reason(reason)
    }

    /// Load a `Failed` plugin fresh from its source location.
    async fn recover(&self, descriptor: &PluginDescriptor, trigger: ReloadTrigger) -> ReloadOutcome {
        let started = Instant::now();
        let name = descriptor.name.as_str();
        let from_version = descriptor.version.to_string();
        info!(plugin = %name, "Recovering failed plugin");

        let Some(location) = descriptor.primary_location().map(Path::to_path_buf) else {
            return ReloadOutcome::new(name, &from_version, trigger, OutcomeKind::RollbackFailed)
                .with_reason("no source location");
        };

        let outcome = match self.load_locked(&location, Some(name)).await {
            Ok(status) if status.name != name || status.state != PluginState::Active => {
                let reason = format!("recovered {} is {}", status.name, status.state);
                error!(plugin = %name, "{}", reason);
                ReloadOutcome::new(name, &from_version, trigger, OutcomeKind::RollbackFailed)
                    .with_reason(reason)
            }
            Ok(status) => {
                self.emit(ReloadEvent::Committed {
                    plugin: name.to_string(),
                    from_version: from_version.clone(),
                    to_version: status.version.clone(),
                });
                for listener in self.listeners() {
                    listener.on_plugin_committed(name, &status.version);
                }
                ReloadOutcome::new(name, &from_version, trigger, OutcomeKind::Committed)
                    .with_to_version(&status.version)
            }
            Err(report) => {
                let kind = match report.current_context() {
                    RuntimeError::Validation { stage, .. } => {
                        OutcomeKind::ValidationError { stage: *stage }
                    }
                    _ => OutcomeKind::RollbackFailed,
                };
                ReloadOutcome::new(name, &from_version, trigger, kind)
                    .with_reason(report.current_context().to_string())
            }
        };
        outcome.with_duration(started.elapsed())
    }

    fn not_attempted(&self, name: &str, trigger: ReloadTrigger, reason: String) -> ReloadOutcome {
        warn!(plugin = %name, "Reload not attempted: {}", reason);
        self.attempts.lock().remove(name);
        self.emit(ReloadEvent::Skipped {
            plugin: name.to_string(),
            reason: reason.clone(),
        });

        let from_version = self
            .registry
            .get(name)
            .map(|d| d.version.to_string())
            .unwrap_or_default();
        ReloadOutcome::new(name, &from_version, trigger, OutcomeKind::NotAttempted).with_reason(reason)
    }

    fn cancelled(&self, name: &str, from_version: &str, trigger: ReloadTrigger) -> ReloadOutcome {
        info!(plugin = %name, "Reload cancelled");
        self.attempts.lock().remove(name);
        self.emit(ReloadEvent::Skipped {
            plugin: name.to_string(),
            reason: "cancelled by operator".to_string(),
        });
        ReloadOutcome::new(name, from_version, trigger, OutcomeKind::Cancelled)
            .with_reason("cancelled by operator")
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    /// Queue a reload request. A request for a plugin that is already
    /// queued is dropped.
    pub fn enqueue(&self, request: ReloadRequest) {
        let plugin = request.plugin_name.clone();
        let trigger = request.trigger;
        {
            let mut queue = self.queue.lock();
            if queue.iter().any(|r| r.plugin_name == plugin) {
                debug!(plugin = %plugin, "Reload already queued");
                return;
            }
            queue.push_back(request);
        }

        self.emit(ReloadEvent::RequestQueued { plugin, trigger });
        self.queue_notify.notify_one();
    }

    /// Plugins waiting in the queue, in order
    pub fn queued(&self) -> Vec<String> {
        self.queue
            .lock()
            .iter()
            .map(|r| r.plugin_name.clone())
            .collect()
    }

    /// Cancel a queued request or an attempt still in `Pending` or
    /// `Validating`. Returns whether anything was cancelled.
    pub fn cancel(&self, name: &str) -> bool {
        let removed = {
            let mut queue = self.queue.lock();
            let before = queue.len();
            queue.retain(|r| r.plugin_name != name);
            before != queue.len()
        };
        if removed {
            info!(plugin = %name, "Queued reload cancelled");
            self.emit(ReloadEvent::Skipped {
                plugin: name.to_string(),
                reason: "cancelled by operator".to_string(),
            });
            return true;
        }

        let mut attempts = self.attempts.lock();
        match attempts.get_mut(name) {
            Some(attempt) if attempt.phase.is_cancellable() => {
                attempt.cancel_requested = true;
                true
            }
            _ => false,
        }
    }

    /// Consume reload requests until `rx` closes and the queue drains.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<ReloadRequest>) {
        info!("Reload coordinator started");

        let closed = Arc::new(AtomicBool::new(false));
        let forwarder = {
            let this = self.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(request) = rx.recv().await {
                    this.enqueue(request);
                }
                closed.store(true, Ordering::SeqCst);
                this.queue_notify.notify_one();
            })
        };

        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some(request) => {
                    let plugin = request.plugin_name.clone();
                    match self.process(request).await {
                        Ok(report) => debug!(plugin = %plugin, order = ?report.order(), "Processed reload request"),
                        Err(e) => warn!(plugin = %plugin, "Reload request dropped: {:?}", e),
                    }
                }
                None if closed.load(Ordering::SeqCst) => break,
                None => self.queue_notify.notified().await,
            }
        }

        let _ = forwarder.await;
        info!("Reload coordinator stopped");
    }

    /// Run the request consumer on the tokio runtime.
    pub fn spawn(self: &Arc<Self>, rx: mpsc::Receiver<ReloadRequest>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(rx))
    }

    /// Wire a file watcher over `dirs` to a freshly spawned consumer.
    pub async fn watch<P: AsRef<Path>>(
        self: &Arc<Self>,
        dirs: &[P],
        watch_config: WatchConfig,
    ) -> RuntimeResult<(PluginWatcher, JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let mut watcher = PluginWatcher::new(
            watch_config,
            self.config.strategy.clone(),
            self.registry.clone(),
            tx,
        );
        for dir in dirs {
            watcher.watch(dir).await.into_report()?;
        }
        watcher.start().await.into_report()?;

        Ok((watcher, self.spawn(rx)))
    }

    // ------------------------------------------------------------------
    // Calling plugins
    // ------------------------------------------------------------------

    /// Run `f` against the live instance of `name`.
    ///
    /// During a swap this waits for commit or rollback.
    pub async fn with_plugin<F, R>(&self, name: &str, f: F) -> RuntimeResult<R>
    where
        F: FnOnce(&mut dyn OpsPlugin) -> R,
    {
        let slot = self
            .slot(name)
            .ok_or_else(|| Report::new(RuntimeError::NotLoaded(name.to_string())))?;
        let mut instance = slot.lock().await;
        self.ensure_available(name)?;
        Ok(f(&mut **instance))
    }

    /// Run a command contributed by a command provider.
    pub async fn execute(&self, name: &str, command: &str, args: &[String]) -> RuntimeResult<String> {
        let slot = self
            .slot(name)
            .ok_or_else(|| Report::new(RuntimeError::NotLoaded(name.to_string())))?;
        let mut instance = slot.lock().await;
        self.ensure_available(name)?;
        instance.execute(command, args).await.into_report()
    }

    /// Look up a connection held by the live instance.
    pub async fn connection(&self, plugin: &str, id: &str) -> RuntimeResult<Option<ConnectionHandle>> {
        self.with_plugin(plugin, |instance| instance.connection(id))
            .await
    }

    /// Commands of every active command provider, by plugin name.
    pub async fn commands(&self) -> Vec<(String, CommandSpec)> {
        let mut commands = Vec::new();
        for descriptor in self.registry.find_by_capability(Capability::CommandProvider) {
            if descriptor.state() != PluginState::Active {
                continue;
            }
            let Some(slot) = self.slot(&descriptor.name) else {
                continue;
            };
            let instance = slot.lock().await;
            commands.extend(
                instance
                    .commands()
                    .into_iter()
                    .map(|c| (descriptor.name.clone(), c)),
            );
        }
        commands
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn status(&self, name: &str) -> RuntimeResult<PluginStatus> {
        let descriptor = self.registry.get(name).into_report()?;
        Ok(self.status_of(&descriptor))
    }

    pub fn status_all(&self) -> Vec<PluginStatus> {
        self.registry
            .list()
            .iter()
            .map(|d| self.status_of(d))
            .collect()
    }

    /// Most recent outcome recorded for `name`.
    pub fn last_outcome(&self, name: &str) -> Option<ReloadOutcome> {
        self.last_outcomes.read().get(name).cloned()
    }

    fn status_of(&self, descriptor: &PluginDescriptor) -> PluginStatus {
        let phase = self.attempts.lock().get(&descriptor.name).map(|a| a.phase);
        PluginStatus::new(descriptor, phase, self.last_outcome(&descriptor.name))
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn slot(&self, name: &str) -> Option<Slot> {
        self.instances.read().get(name).cloned()
    }

    fn ensure_available(&self, name: &str) -> RuntimeResult<()> {
        match self.registry.state(name).into_report()? {
            PluginState::Active | PluginState::Reloading => Ok(()),
            state => Err(Report::new(RuntimeError::Unavailable {
                name: name.to_string(),
                state: state.to_string(),
            })),
        }
    }

    fn plugin_context(&self, manifest: &PluginManifest) -> PluginContext {
        let mut settings = manifest.settings.clone();
        if let Some(overrides) = self.plugin_settings.get(&manifest.name) {
            settings.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self.context.for_plugin(&manifest.name).with_settings(settings)
    }

    /// Build and initialize a fresh instance from a validated candidate.
    async fn construct(&self, candidate: &Candidate) -> Result<Box<dyn OpsPlugin>, String> {
        let mut instance = self
            .loader
            .instantiate(candidate)
            .await
            .map_err(|e| e.to_string())?;

        let ctx = self.plugin_context(&candidate.manifest);
        instance
            .initialize(&ctx)
            .await
            .map_err(|e| format!("initialize failed: {}", e))?;

        debug!(plugin = %candidate.manifest.name, version = %candidate.manifest.version, "Instance constructed");
        Ok(instance)
    }

    async fn check_health(&self, instance: &dyn OpsPlugin) -> Result<(), String> {
        let timeout = self.config.health_check_timeout;
        match tokio::time::timeout(timeout, instance.health_check()).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err("health check reported unhealthy".to_string()),
            Ok(Err(e)) => Err(format!("health check failed: {}", e)),
            Err(_) => Err(format!("health check timed out after {:?}", timeout)),
        }
    }

    /// Close an instance's connections and run its cleanup hook.
    async fn retire(&self, name: &str, instance: &mut dyn OpsPlugin) {
        self.transfers.close_all(name, instance);
        if let Err(e) = instance.cleanup().await {
            warn!(plugin = %name, "Plugin cleanup failed: {}", e);
        }
    }

    /// Move an attempt to `phase`. Returns `false` when the attempt was
    /// cancelled while it could still be.
    fn enter(&self, name: &str, phase: ReloadPhase) -> bool {
        {
            let mut attempts = self.attempts.lock();
            let attempt = attempts.entry(name.to_string()).or_insert(Attempt {
                phase: ReloadPhase::Pending,
                cancel_requested: false,
            });
            if attempt.cancel_requested && attempt.phase.is_cancellable() {
                return false;
            }
            attempt.phase = phase;
        }

        debug!(plugin = %name, phase = %phase, "Reload phase");
        self.emit(ReloadEvent::PhaseChanged {
            plugin: name.to_string(),
            phase,
        });
        true
    }

    fn finish(&self, name: &str, phase: ReloadPhase) {
        self.attempts.lock().remove(name);
        self.emit(ReloadEvent::PhaseChanged {
            plugin: name.to_string(),
            phase,
        });
    }

    fn record(&self, outcome: &ReloadOutcome) {
        self.last_outcomes
            .write()
            .insert(outcome.plugin.clone(), outcome.clone());
    }

    fn emit(&self, event: ReloadEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_warnings(&self, warnings: &[super::transfer::ConnectionTransferWarning]) {
        for warning in warnings {
            self.emit(ReloadEvent::ConnectionTransferWarning {
                plugin: warning.plugin.clone(),
                connection_id: warning.connection_id.clone(),
                reason: warning.reason.clone(),
            });
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn ReloadListener>> {
        self.listeners.read().clone()
    }
}

fn validation_error(plugin: &str, result: &ValidationResult) -> RuntimeError {
    match result.failure() {
        Some(failure) => RuntimeError::Validation {
            plugin: plugin.to_string(),
            stage: failure.stage,
            message: failure.message.clone(),
        },
        None => RuntimeError::Validation {
            plugin: plugin.to_string(),
            stage: ValidationStage::Syntax,
            message: "validation failed".to_string(),
        },
    }
}
