use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod connection;
pub mod error;
pub mod reload;

pub use connection::{ConnectionHandle, Resource};
pub use error::PluginError;
pub use reload::{
    HotReloadConfig, ReloadEvent, ReloadListener, ReloadPhase, ReloadStrategy, ReloadTrigger,
};

/// Plugin operation result type using the typed [`PluginError`].
pub type PluginResult<T> = Result<T, PluginError>;

// ============================================================================
// Capabilities
// ============================================================================

/// Capability set a plugin advertises to the host.
///
/// A reloaded version must keep every capability the running version
/// advertises; it may add new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Contributes subcommands to the CLI dispatcher.
    CommandProvider,
    /// Extends the static configuration schema.
    ConfigExtender,
    /// Provides a long-running service (clients, watchers, pools).
    ServiceProvider,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::CommandProvider => "command-provider",
            Capability::ConfigExtender => "config-extender",
            Capability::ServiceProvider => "service-provider",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "command-provider" => Ok(Capability::CommandProvider),
            "config-extender" => Ok(Capability::ConfigExtender),
            "service-provider" => Ok(Capability::ServiceProvider),
            other => Err(PluginError::ConfigError(format!("unknown capability '{}'", other))),
        }
    }
}

// ============================================================================
// Manifest
// ============================================================================

/// Fixed description of a plugin code unit.
///
/// Loaders produce one of these for every candidate; the runtime never
/// inspects a code unit any other way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Stable plugin name (registry key)
    pub name: String,
    /// Version string, `major.minor[.patch][-pre][+build]`
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Names of plugins this one depends on
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Version constraints on dependencies, keyed by dependency name
    #[serde(default)]
    pub requires: BTreeMap<String, String>,
    /// Factory used by in-process loaders; defaults to `name`
    #[serde(default)]
    pub factory: Option<String>,
    /// Free-form settings handed to `initialize`
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
}

impl PluginManifest {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            description: String::new(),
            dependencies: Vec::new(),
            capabilities: Vec::new(),
            requires: BTreeMap::new(),
            factory: None,
            settings: HashMap::new(),
        }
    }

    pub fn with_description(mut self, desc: &str) -> Self {
        self.description = desc.to_string();
        self
    }

    pub fn with_dependency(mut self, dep: &str) -> Self {
        self.dependencies.push(dep.to_string());
        self
    }

    pub fn with_capability(mut self, cap: Capability) -> Self {
        if !self.capabilities.contains(&cap) {
            self.capabilities.push(cap);
        }
        self
    }

    /// Record a version constraint on a dependency (e.g. `"^1.2"`).
    pub fn with_requirement(mut self, dep: &str, req: &str) -> Self {
        self.requires.insert(dep.to_string(), req.to_string());
        self
    }

    pub fn with_factory(mut self, factory: &str) -> Self {
        self.factory = Some(factory.to_string());
        self
    }

    pub fn with_setting<T: Serialize>(mut self, key: &str, value: T) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.settings.insert(key.to_string(), v);
        }
        self
    }

    /// Factory key for in-process loaders.
    pub fn factory_key(&self) -> &str {
        self.factory.as_deref().unwrap_or(&self.name)
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }
}

/// A subcommand contributed by a [`Capability::CommandProvider`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Subcommand name as exposed by the dispatcher
    pub name: String,
    /// One-line help text
    pub about: String,
}

impl CommandSpec {
    pub fn new(name: &str, about: &str) -> Self {
        Self {
            name: name.to_string(),
            about: about.to_string(),
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Context handed to [`OpsPlugin::initialize`].
#[derive(Default)]
pub struct PluginContext {
    /// Name of the plugin being initialized
    pub plugin: String,
    /// Settings from the manifest, overlaid by host configuration
    pub settings: HashMap<String, serde_json::Value>,
    /// State shared between all plugins in the host
    shared_state: Arc<RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>>,
}

impl PluginContext {
    pub fn new(plugin: &str) -> Self {
        Self {
            plugin: plugin.to_string(),
            settings: HashMap::new(),
            shared_state: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_settings(mut self, settings: HashMap<String, serde_json::Value>) -> Self {
        self.settings = settings;
        self
    }

    /// Derive a context for another plugin that shares this host state.
    pub fn for_plugin(&self, plugin: &str) -> Self {
        Self {
            plugin: plugin.to_string(),
            settings: HashMap::new(),
            shared_state: self.shared_state.clone(),
        }
    }

    pub fn setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.settings
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Get shared state
    pub async fn get_state<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        let state = self.shared_state.read().await;
        state.get(key).and_then(|v| v.downcast_ref::<T>().cloned())
    }

    /// Set shared state
    pub async fn set_state<T: Clone + Send + Sync + 'static>(&self, key: &str, value: T) {
        let mut state = self.shared_state.write().await;
        state.insert(key.to_string(), Box::new(value));
    }
}

impl Clone for PluginContext {
    fn clone(&self) -> Self {
        Self {
            plugin: self.plugin.clone(),
            settings: self.settings.clone(),
            shared_state: self.shared_state.clone(),
        }
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin", &self.plugin)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Plugin trait
// ============================================================================

/// A loadable plugin instance.
///
/// Everything except `manifest`, `initialize` and `as_any` has a default, so
/// a plugin only implements the hooks it actually supports.
#[async_trait::async_trait]
pub trait OpsPlugin: Send + Sync {
    /// Manifest this instance was built from.
    fn manifest(&self) -> &PluginManifest;

    fn name(&self) -> &str {
        &self.manifest().name
    }

    fn version(&self) -> &str {
        &self.manifest().version
    }

    /// Lifecycle hook run once after construction.
    async fn initialize(&mut self, ctx: &PluginContext) -> PluginResult<()>;

    /// Lifecycle hook run when the instance is discarded.
    async fn cleanup(&mut self) -> PluginResult<()> {
        Ok(())
    }

    /// Health check run after a reload. Instances without one are healthy.
    async fn health_check(&self) -> PluginResult<bool> {
        Ok(true)
    }

    /// Externally-visible attributes, captured before a reload.
    fn attributes(&self) -> HashMap<String, serde_json::Value> {
        HashMap::new()
    }

    /// Write previously captured attributes onto this instance.
    fn apply_attributes(
        &mut self,
        _attributes: &HashMap<String, serde_json::Value>,
    ) -> PluginResult<()> {
        Ok(())
    }

    /// Opaque persistent state, if the plugin declares any.
    fn export_state(&self) -> Option<Vec<u8>> {
        None
    }

    /// Reinterpret a blob exported by a previous instance.
    ///
    /// Returns `Ok(false)` when the plugin has no persistent-state accessor
    /// and `Err` when the blob is incompatible.
    fn import_state(&mut self, _blob: &[u8]) -> PluginResult<bool> {
        Ok(false)
    }

    /// Look up an open connection by id.
    fn connection(&self, _id: &str) -> Option<ConnectionHandle> {
        None
    }

    /// Ids of the connections currently held.
    fn connection_ids(&self) -> Vec<String> {
        Vec::new()
    }

    /// Give up ownership of every held connection without closing it.
    fn detach_connections(&mut self) -> Vec<ConnectionHandle> {
        Vec::new()
    }

    /// Take ownership of a connection held by a previous instance.
    ///
    /// Instances without an adoption mechanism hand the handle back.
    fn adopt_connection(&mut self, handle: ConnectionHandle) -> Result<(), ConnectionHandle> {
        Err(handle)
    }

    /// Subcommands exposed when the plugin is a [`Capability::CommandProvider`].
    fn commands(&self) -> Vec<CommandSpec> {
        Vec::new()
    }

    /// Run one of the commands returned by [`OpsPlugin::commands`].
    async fn execute(&mut self, command: &str, _args: &[String]) -> PluginResult<String> {
        Err(PluginError::Unsupported(format!(
            "{} does not provide command '{}'",
            self.name(),
            command
        )))
    }

    /// Convert to Any (for downcasting)
    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests;
