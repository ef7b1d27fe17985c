//! Plugin loaders
//!
//! A loader is the "code unit replace" primitive: it parses the code unit at
//! a source location into a [`Candidate`] and builds fresh instances from
//! it, without touching any instance that is already running.
//!
//! - [`ManifestLoader`] reads `*.plugin.toml` manifests and builds instances
//!   from factories registered in-process.
//! - [`LibraryLoader`] opens shared libraries exporting the `export_plugin!`
//!   symbols. Each candidate is opened from a private shadow copy so a
//!   rebuilt library yields new code while the old copy stays mapped for
//!   the running instance.
//! - [`LoaderSet`] dispatches between several loaders.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};
use opsctl_kernel::{
    CommandSpec, ConnectionHandle, OpsPlugin, PluginContext, PluginManifest, PluginResult,
};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Plugin load error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LoadError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed code unit {path:?}: {message}")]
    Syntax { path: PathBuf, message: String },

    #[error("Failed to load library: {0}")]
    Library(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Plugin API version mismatch: expected {expected}, got {actual}")]
    ApiVersionMismatch { expected: u32, actual: u32 },

    #[error("No factory registered for {0}")]
    UnknownFactory(String),

    #[error("Plugin creation failed: {0}")]
    CreationFailed(String),

    #[error("No loader handles {0:?}")]
    Unsupported(PathBuf),
}

/// A parsed, not yet instantiated code unit.
#[derive(Clone)]
pub struct Candidate {
    pub manifest: PluginManifest,
    /// Location the candidate was read from
    pub location: PathBuf,
    /// SHA-256 of the code unit
    pub hash: String,
    kind: &'static str,
    unit: Option<Arc<dyn Any + Send + Sync>>,
}

impl Candidate {
    pub fn new(manifest: PluginManifest, location: PathBuf, hash: String, kind: &'static str) -> Self {
        Self {
            manifest,
            location,
            hash,
            kind,
            unit: None,
        }
    }

    /// Attach loader-private state (an opened library, a compiled module).
    pub fn with_unit(mut self, unit: Arc<dyn Any + Send + Sync>) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn unit<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.unit.clone().and_then(|u| u.downcast::<T>().ok())
    }

    /// Kind of the loader that produced this candidate.
    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("name", &self.manifest.name)
            .field("version", &self.manifest.version)
            .field("location", &self.location)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Turns source locations into plugin instances.
#[async_trait::async_trait]
pub trait PluginLoader: Send + Sync {
    /// Short name recorded on every candidate this loader prepares.
    fn kind(&self) -> &'static str;

    /// Whether files at `path` are code units for this loader.
    fn handles(&self, path: &Path) -> bool;

    /// Read and parse the code unit at `location`.
    async fn prepare(&self, location: &Path) -> Result<Candidate, LoadError>;

    /// Construct a fresh, uninitialized instance.
    async fn instantiate(&self, candidate: &Candidate) -> Result<Box<dyn OpsPlugin>, LoadError>;

    /// Drop code the loader keeps for `plugin`. Called after the plugin was
    /// unloaded and its connections closed.
    fn release(&self, _plugin: &str) {}
}

/// SHA-256 of a byte slice, lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

async fn read_unit(path: &Path) -> Result<Vec<u8>, LoadError> {
    tokio::fs::read(path).await.map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ============================================================================
// Manifest loader
// ============================================================================

/// Builds an instance for a manifest.
pub type PluginFactory =
    Arc<dyn Fn(&PluginManifest) -> PluginResult<Box<dyn OpsPlugin>> + Send + Sync>;

/// Loader for `*.plugin.toml` manifests backed by in-process factories.
///
/// Integrations compiled into the host register a factory under a key;
/// the manifest names the key (defaulting to the plugin name) and carries
/// version, dependencies, capabilities and settings.
pub struct ManifestLoader {
    factories: RwLock<HashMap<String, PluginFactory>>,
    suffix: String,
}

impl ManifestLoader {
    pub const KIND: &'static str = "manifest";
    pub const DEFAULT_SUFFIX: &'static str = ".plugin.toml";

    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            suffix: Self::DEFAULT_SUFFIX.to_string(),
        }
    }

    /// Change the manifest file suffix.
    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.suffix = suffix.to_string();
        self
    }

    /// Register (or replace) a factory.
    pub fn register_factory<F>(&self, key: &str, factory: F)
    where
        F: Fn(&PluginManifest) -> PluginResult<Box<dyn OpsPlugin>> + Send + Sync + 'static,
    {
        debug!("Registering plugin factory: {}", key);
        self.factories
            .write()
            .insert(key.to_string(), Arc::new(factory));
    }

    pub fn has_factory(&self, key: &str) -> bool {
        self.factories.read().contains_key(key)
    }

    /// Parse manifest text.
    pub fn parse_manifest(path: &Path, text: &str) -> Result<PluginManifest, LoadError> {
        toml::from_str(text).map_err(|e| LoadError::Syntax {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

impl Default for ManifestLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PluginLoader for ManifestLoader {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn handles(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(&self.suffix))
    }

    async fn prepare(&self, location: &Path) -> Result<Candidate, LoadError> {
        let bytes = read_unit(location).await?;
        let text = String::from_utf8(bytes).map_err(|e| LoadError::Syntax {
            path: location.to_path_buf(),
            message: e.to_string(),
        })?;

        let manifest = Self::parse_manifest(location, &text)?;
        if !self.has_factory(manifest.factory_key()) {
            return Err(LoadError::UnknownFactory(manifest.factory_key().to_string()));
        }

        Ok(Candidate::new(
            manifest,
            location.to_path_buf(),
            content_hash(text.as_bytes()),
            Self::KIND,
        ))
    }

    async fn instantiate(&self, candidate: &Candidate) -> Result<Box<dyn OpsPlugin>, LoadError> {
        let key = candidate.manifest.factory_key();
        let factory = self
            .factories
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| LoadError::UnknownFactory(key.to_string()))?;

        factory(&candidate.manifest).map_err(|e| LoadError::CreationFailed(e.to_string()))
    }
}

// ============================================================================
// Shared-library loader
// ============================================================================

/// A shared library opened from its shadow copy.
pub struct PluginLibrary {
    /// Path the library was built to
    source: PathBuf,
    /// Private copy that was actually opened
    shadow: PathBuf,
    library: Library,
}

impl PluginLibrary {
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn shadow(&self) -> &Path {
        &self.shadow
    }

    /// Create a new plugin instance from this library
    ///
    /// # Safety
    /// Calls an `extern "C"` constructor exported by the library. The library
    /// must have been built by `export_plugin!` against the same
    /// `opsctl-kernel` and compiler as the host.
    unsafe fn create_instance(&self) -> Result<Box<dyn OpsPlugin>, LoadError> {
        unsafe {
            let create_fn: Symbol<unsafe extern "C" fn() -> *mut dyn OpsPlugin> = self
                .library
                .get(b"_opsctl_plugin_create")
                .map_err(|e| LoadError::SymbolNotFound(format!("_opsctl_plugin_create: {}", e)))?;

            let raw_plugin = create_fn();
            if raw_plugin.is_null() {
                return Err(LoadError::CreationFailed(
                    "Plugin constructor returned null".to_string(),
                ));
            }

            Ok(Box::from_raw(raw_plugin))
        }
    }
}

impl Drop for PluginLibrary {
    fn drop(&mut self) {
        debug!("Unloading plugin library: {:?}", self.source);
        let _ = std::fs::remove_file(&self.shadow);
    }
}

/// Instance built from a [`PluginLibrary`]; keeps the library mapped for as
/// long as the instance lives.
struct LibraryPlugin {
    // Declared before `library` so the instance drops first.
    plugin: Box<dyn OpsPlugin>,
    library: Arc<PluginLibrary>,
}

#[async_trait::async_trait]
impl OpsPlugin for LibraryPlugin {
    fn manifest(&self) -> &PluginManifest {
        self.plugin.manifest()
    }

    async fn initialize(&mut self, ctx: &PluginContext) -> PluginResult<()> {
        debug!("Initializing plugin from {:?}", self.library.shadow());
        self.plugin.initialize(ctx).await
    }

    async fn cleanup(&mut self) -> PluginResult<()> {
        self.plugin.cleanup().await
    }

    async fn health_check(&self) -> PluginResult<bool> {
        self.plugin.health_check().await
    }

    fn attributes(&self) -> HashMap<String, serde_json::Value> {
        self.plugin.attributes()
    }

    fn apply_attributes(&mut self, attributes: &HashMap<String, serde_json::Value>) -> PluginResult<()> {
        self.plugin.apply_attributes(attributes)
    }

    fn export_state(&self) -> Option<Vec<u8>> {
        self.plugin.export_state()
    }

    fn import_state(&mut self, blob: &[u8]) -> PluginResult<bool> {
        self.plugin.import_state(blob)
    }

    fn connection(&self, id: &str) -> Option<ConnectionHandle> {
        self.plugin.connection(id)
    }

    fn connection_ids(&self) -> Vec<String> {
        self.plugin.connection_ids()
    }

    fn detach_connections(&mut self) -> Vec<ConnectionHandle> {
        self.plugin.detach_connections()
    }

    fn adopt_connection(&mut self, handle: ConnectionHandle) -> Result<(), ConnectionHandle> {
        self.plugin.adopt_connection(handle)
    }

    fn commands(&self) -> Vec<CommandSpec> {
        self.plugin.commands()
    }

    async fn execute(&mut self, command: &str, args: &[String]) -> PluginResult<String> {
        self.plugin.execute(command, args).await
    }

    fn as_any(&self) -> &dyn Any {
        self.plugin.as_any()
    }
}

/// Loader for shared libraries built with `export_plugin!`.
///
/// Every library an instance was built from stays open until the plugin is
/// released: connection handles moved to a newer instance still point into
/// the code of the generation that opened them.
pub struct LibraryLoader {
    generations: RwLock<HashMap<String, Vec<Arc<PluginLibrary>>>>,
    shadow_dir: tempfile::TempDir,
    api_version: u32,
}

impl LibraryLoader {
    /// Current plugin ABI version
    pub const API_VERSION: u32 = 1;
    pub const KIND: &'static str = "library";

    pub fn new() -> Result<Self, LoadError> {
        let shadow_dir = tempfile::Builder::new()
            .prefix("opsctl-plugins-")
            .tempdir()
            .map_err(|source| LoadError::Io {
                path: std::env::temp_dir(),
                source,
            })?;

        Ok(Self {
            generations: RwLock::new(HashMap::new()),
            shadow_dir,
            api_version: Self::API_VERSION,
        })
    }

    /// Number of library generations kept open for `plugin`.
    pub fn generations(&self, plugin: &str) -> usize {
        self.generations.read().get(plugin).map_or(0, Vec::len)
    }

    fn shadow_path(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("plugin");
        let ext = source.extension().and_then(|e| e.to_str()).unwrap_or("");
        self.shadow_dir
            .path()
            .join(format!("{}-{}.{}", stem, uuid::Uuid::now_v7(), ext))
    }

    fn open(&self, source: &Path, bytes: &[u8]) -> Result<PluginLibrary, LoadError> {
        let shadow = self.shadow_path(source);
        std::fs::write(&shadow, bytes).map_err(|source_err| LoadError::Io {
            path: shadow.clone(),
            source: source_err,
        })?;

        // SAFETY: loading a library runs its initializers; plugin libraries
        // are trusted code placed in the plugin directories by the operator.
        let library = match unsafe { Library::new(&shadow) } {
            Ok(library) => library,
            Err(e) => {
                let _ = std::fs::remove_file(&shadow);
                return Err(LoadError::Library(e.to_string()));
            }
        };

        Ok(PluginLibrary {
            source: source.to_path_buf(),
            shadow,
            library,
        })
    }

    fn read_manifest(&self, lib: &PluginLibrary) -> Result<PluginManifest, LoadError> {
        // SAFETY: symbol signatures are fixed by `export_plugin!`.
        let api_version = unsafe {
            lib.library
                .get::<unsafe extern "C" fn() -> u32>(b"_opsctl_plugin_api_version")
                .map(|f| f())
                .map_err(|e| LoadError::SymbolNotFound(format!("_opsctl_plugin_api_version: {}", e)))?
        };
        if api_version != self.api_version {
            return Err(LoadError::ApiVersionMismatch {
                expected: self.api_version,
                actual: api_version,
            });
        }

        // SAFETY: as above; the returned pointer is a NUL-terminated string
        // owned by the library for its whole lifetime.
        let json = unsafe {
            let manifest_fn: Symbol<unsafe extern "C" fn() -> *const c_char> = lib
                .library
                .get(b"_opsctl_plugin_manifest")
                .map_err(|e| LoadError::SymbolNotFound(format!("_opsctl_plugin_manifest: {}", e)))?;
            let raw = manifest_fn();
            if raw.is_null() {
                return Err(LoadError::Syntax {
                    path: lib.source.clone(),
                    message: "manifest symbol returned null".to_string(),
                });
            }
            CStr::from_ptr(raw).to_string_lossy().into_owned()
        };

        serde_json::from_str(&json).map_err(|e| LoadError::Syntax {
            path: lib.source.clone(),
            message: e.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl PluginLoader for LibraryLoader {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn handles(&self, path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("so") | Some("dylib") | Some("dll")
        )
    }

    async fn prepare(&self, location: &Path) -> Result<Candidate, LoadError> {
        let bytes = read_unit(location).await?;
        let hash = content_hash(&bytes);

        info!("Opening plugin library: {:?}", location);
        let library = self.open(location, &bytes)?;
        let manifest = self.read_manifest(&library)?;

        Ok(
            Candidate::new(manifest, location.to_path_buf(), hash, Self::KIND)
                .with_unit(Arc::new(library)),
        )
    }

    async fn instantiate(&self, candidate: &Candidate) -> Result<Box<dyn OpsPlugin>, LoadError> {
        let library = candidate.unit::<PluginLibrary>().ok_or_else(|| {
            LoadError::CreationFailed(format!("{:?} was not prepared by this loader", candidate.location))
        })?;

        // SAFETY: see `PluginLibrary::create_instance`.
        let plugin = unsafe { library.create_instance()? };

        {
            let mut generations = self.generations.write();
            let kept = generations
                .entry(candidate.manifest.name.clone())
                .or_default();
            if !kept.iter().any(|l| Arc::ptr_eq(l, &library)) {
                debug!(
                    "Keeping library generation {} of {}",
                    kept.len() + 1,
                    candidate.manifest.name
                );
                kept.push(library.clone());
            }
        }

        Ok(Box::new(LibraryPlugin { plugin, library }))
    }

    fn release(&self, plugin: &str) {
        let released = self.generations.write().remove(plugin);
        if let Some(released) = released {
            info!("Releasing {} library generation(s) of {}", released.len(), plugin);
        }
    }
}

/// Export a plugin type from a `cdylib` for [`LibraryLoader`].
///
/// ```rust,ignore
/// opsctl_plugins::export_plugin!(GatewayPlugin::new());
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($constructor:expr) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn _opsctl_plugin_api_version() -> u32 {
            $crate::hot_reload::LibraryLoader::API_VERSION
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _opsctl_plugin_manifest() -> *const ::std::os::raw::c_char {
            static MANIFEST: ::std::sync::OnceLock<::std::ffi::CString> =
                ::std::sync::OnceLock::new();
            MANIFEST
                .get_or_init(|| {
                    let plugin: ::std::boxed::Box<dyn $crate::OpsPlugin> =
                        ::std::boxed::Box::new($constructor);
                    let json = $crate::serde_json::to_string(plugin.manifest()).unwrap_or_default();
                    ::std::ffi::CString::new(json).unwrap_or_default()
                })
                .as_ptr()
        }

        #[unsafe(no_mangle)]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn _opsctl_plugin_create() -> *mut dyn $crate::OpsPlugin {
            let plugin: ::std::boxed::Box<dyn $crate::OpsPlugin> =
                ::std::boxed::Box::new($constructor);
            ::std::boxed::Box::into_raw(plugin)
        }
    };
}

// ============================================================================
// Loader set
// ============================================================================

/// Dispatches to the first loader that handles a path.
#[derive(Default)]
pub struct LoaderSet {
    loaders: Vec<Arc<dyn PluginLoader>>,
}

impl LoaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loader(mut self, loader: Arc<dyn PluginLoader>) -> Self {
        self.loaders.push(loader);
        self
    }
}

#[async_trait::async_trait]
impl PluginLoader for LoaderSet {
    fn kind(&self) -> &'static str {
        "set"
    }

    fn handles(&self, path: &Path) -> bool {
        self.loaders.iter().any(|l| l.handles(path))
    }

    async fn prepare(&self, location: &Path) -> Result<Candidate, LoadError> {
        let loader = self
            .loaders
            .iter()
            .find(|l| l.handles(location))
            .ok_or_else(|| LoadError::Unsupported(location.to_path_buf()))?;
        loader.prepare(location).await
    }

    async fn instantiate(&self, candidate: &Candidate) -> Result<Box<dyn OpsPlugin>, LoadError> {
        let loader = self
            .loaders
            .iter()
            .find(|l| l.kind() == candidate.kind())
            .ok_or_else(|| LoadError::Unsupported(candidate.location.clone()))?;
        loader.instantiate(candidate).await
    }

    fn release(&self, plugin: &str) {
        for loader in &self.loaders {
            loader.release(plugin);
        }
    }
}
