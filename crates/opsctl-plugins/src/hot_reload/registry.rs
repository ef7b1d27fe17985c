//! Plugin registry
//!
//! Authoritative map of loaded plugins, their versions and lifecycle state.
//! State only changes through guarded compare-and-swap transitions.

use chrono::{DateTime, Utc};
use opsctl_kernel::{Capability, PluginManifest};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("Plugin {0} already registered")]
    DuplicateName(String),

    #[error("Plugin {0} not found")]
    NotFound(String),

    #[error("Invalid transition for {name}: expected {expected}, found {actual} (target {target})")]
    InvalidTransition {
        name: String,
        expected: PluginState,
        actual: PluginState,
        target: PluginState,
    },

    #[error("Invalid version: {0}")]
    InvalidVersion(String),
}

// ============================================================================
// Versions
// ============================================================================

/// Plugin version information
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PluginVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Pre-release tag (e.g., "alpha", "rc.1")
    pub prerelease: Option<String>,
    /// Build metadata
    pub build: Option<String>,
}

impl PluginVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
            build: None,
        }
    }

    /// Parse from string (e.g., "1.2.3-alpha+build123"). `1.2` means `1.2.0`.
    pub fn parse(version: &str) -> Result<Self, String> {
        let version = version.trim().trim_start_matches('v');

        let (version_pre, build) = match version.split_once('+') {
            Some((head, build)) => (head, Some(build.to_string())),
            None => (version, None),
        };

        let (version_core, prerelease) = match version_pre.split_once('-') {
            Some((core, pre)) => (core, Some(pre.to_string())),
            None => (version_pre, None),
        };

        let parts: Vec<&str> = version_core.split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(format!("Invalid version format: {}", version));
        }

        let number = |part: &str, what: &str| {
            part.parse::<u32>()
                .map_err(|_| format!("Invalid {} version: {}", what, part))
        };

        Ok(Self {
            major: number(parts[0], "major")?,
            minor: number(parts[1], "minor")?,
            patch: if parts.len() > 2 {
                number(parts[2], "patch")?
            } else {
                0
            },
            prerelease,
            build,
        })
    }

    /// Same major version
    pub fn is_compatible(&self, other: &PluginVersion) -> bool {
        self.major == other.major
    }

    pub fn is_newer_than(&self, other: &PluginVersion) -> bool {
        self.precedence(other) == Ordering::Greater
    }

    /// Semantic-version precedence. Build metadata is ignored and a
    /// pre-release sorts before the release it precedes.
    pub fn precedence(&self, other: &PluginVersion) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl std::fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(ref pre) = self.prerelease {
            write!(f, "-{}", pre)?;
        }
        if let Some(ref build) = self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

impl Default for PluginVersion {
    fn default() -> Self {
        Self::new(0, 0, 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Exact,
    Greater,
    GreaterEq,
    Less,
    LessEq,
    Caret,
    Tilde,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Comparator {
    op: Op,
    version: PluginVersion,
}

impl Comparator {
    fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let (op, rest) = [
            (">=", Op::GreaterEq),
            ("<=", Op::LessEq),
            (">", Op::Greater),
            ("<", Op::Less),
            ("=", Op::Exact),
            ("^", Op::Caret),
            ("~", Op::Tilde),
        ]
        .iter()
        .find_map(|(prefix, op)| raw.strip_prefix(prefix).map(|rest| (*op, rest)))
        .unwrap_or((Op::Caret, raw));

        let rest = rest.trim();
        // A bare major ("^1") reads as "^1.0".
        let version = if rest.contains('.') {
            PluginVersion::parse(rest)?
        } else {
            PluginVersion::parse(&format!("{}.0", rest))?
        };

        Ok(Self { op, version })
    }

    fn matches(&self, v: &PluginVersion) -> bool {
        let req = &self.version;
        let ord = v.precedence(req);
        match self.op {
            Op::Exact => ord == Ordering::Equal,
            Op::Greater => ord == Ordering::Greater,
            Op::GreaterEq => ord != Ordering::Less,
            Op::Less => ord == Ordering::Less,
            Op::LessEq => ord != Ordering::Greater,
            Op::Tilde => {
                ord != Ordering::Less && v.major == req.major && v.minor == req.minor
            }
            Op::Caret => {
                if ord == Ordering::Less {
                    return false;
                }
                if req.major > 0 {
                    v.major == req.major
                } else if req.minor > 0 {
                    v.major == 0 && v.minor == req.minor
                } else {
                    v.major == 0 && v.minor == 0 && v.patch == req.patch
                }
            }
        }
    }
}

/// Version constraint a plugin records against one of its dependencies.
///
/// Comma-separated comparators, all of which must hold: `*`, `=1.2.3`,
/// `>1.0`, `>=1.0`, `<2.0`, `<=2.0`, `^1.2` (the default operator), `~1.2`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionReq {
    raw: String,
    comparators: Vec<Comparator>,
}

impl VersionReq {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Ok(Self::any());
        }

        let comparators = trimmed
            .split(',')
            .map(Comparator::parse)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("Invalid version requirement '{}': {}", raw, e))?;

        Ok(Self {
            raw: trimmed.to_string(),
            comparators,
        })
    }

    /// Requirement satisfied by every version.
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            comparators: Vec::new(),
        }
    }

    pub fn matches(&self, version: &PluginVersion) -> bool {
        self.comparators.iter().all(|c| c.matches(version))
    }
}

impl std::fmt::Display for VersionReq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for VersionReq {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VersionReq> for String {
    fn from(req: VersionReq) -> Self {
        req.raw
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// Lifecycle state of a registered plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PluginState {
    #[default]
    Unloaded,
    Loading,
    Active,
    Reloading,
    /// The previous version could not be reinstated; needs an operator reload
    Failed,
}

impl PluginState {
    /// Edges of the lifecycle graph.
    pub fn can_transition_to(&self, target: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, target),
            (Unloaded, Loading)
                | (Loading, Active)
                | (Loading, Failed)
                | (Active, Reloading)
                | (Active, Unloaded)
                | (Reloading, Active)
                | (Reloading, Failed)
                | (Failed, Loading)
                | (Failed, Unloaded)
        )
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Plugin information stored in the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: PluginVersion,
    pub description: String,
    /// Paths owned by this plugin (files or directories)
    pub source_locations: BTreeSet<PathBuf>,
    pub dependencies: BTreeSet<String>,
    pub capabilities: BTreeSet<Capability>,
    /// Constraints this plugin records against its dependencies
    pub requires: BTreeMap<String, VersionReq>,
    state: PluginState,
    pub reload_count: u32,
    pub last_loaded_at: Option<DateTime<Utc>>,
    /// Reason of the last failed attempt
    pub last_error: Option<String>,
    /// SHA-256 of the code unit last loaded
    pub file_hash: Option<String>,
}

impl PluginDescriptor {
    pub fn new(name: &str, version: PluginVersion) -> Self {
        Self {
            name: name.to_string(),
            version,
            description: String::new(),
            source_locations: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            capabilities: BTreeSet::new(),
            requires: BTreeMap::new(),
            state: PluginState::Unloaded,
            reload_count: 0,
            last_loaded_at: None,
            last_error: None,
            file_hash: None,
        }
    }

    /// Build a descriptor from a parsed manifest.
    pub fn from_manifest(manifest: &PluginManifest) -> Result<Self, RegistryError> {
        let version =
            PluginVersion::parse(&manifest.version).map_err(RegistryError::InvalidVersion)?;
        let mut descriptor = Self::new(&manifest.name, version);
        descriptor.apply_manifest(manifest)?;
        Ok(descriptor)
    }

    /// Refresh version, dependencies, capabilities and constraints from a manifest.
    pub fn apply_manifest(&mut self, manifest: &PluginManifest) -> Result<(), RegistryError> {
        self.version =
            PluginVersion::parse(&manifest.version).map_err(RegistryError::InvalidVersion)?;
        self.description = manifest.description.clone();
        self.dependencies = manifest.dependencies.iter().cloned().collect();
        self.capabilities = manifest.capabilities.iter().copied().collect();
        self.requires = manifest
            .requires
            .iter()
            .map(|(dep, raw)| {
                VersionReq::parse(raw)
                    .map(|req| (dep.clone(), req))
                    .map_err(RegistryError::InvalidVersion)
            })
            .collect::<Result<_, _>>()?;
        Ok(())
    }

    pub fn with_source_location<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.source_locations.insert(path.as_ref().to_path_buf());
        self
    }

    pub fn with_dependency(mut self, dep: &str) -> Self {
        self.dependencies.insert(dep.to_string());
        self
    }

    pub fn with_capability(mut self, cap: Capability) -> Self {
        self.capabilities.insert(cap);
        self
    }

    pub fn with_requirement(mut self, dep: &str, req: VersionReq) -> Self {
        self.requires.insert(dep.to_string(), req);
        self
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Whether `path` is one of this plugin's locations or lies beneath one.
    pub fn owns(&self, path: &Path) -> bool {
        self.source_locations
            .iter()
            .any(|loc| path == loc || path.starts_with(loc))
    }

    /// First source location; loaders read the candidate from here.
    pub fn primary_location(&self) -> Option<&Path> {
        self.source_locations.iter().next().map(PathBuf::as_path)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Plugin registry
///
/// Safe for reads from any thread. Writes are serialized by the reload
/// coordinator; the compare-and-swap in [`PluginRegistry::transition`]
/// rejects a second concurrent reload of the same plugin.
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, PluginDescriptor>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
        }
    }

    /// Register a plugin
    pub fn register(&self, descriptor: PluginDescriptor) -> Result<(), RegistryError> {
        let mut plugins = self.plugins.write();

        if plugins.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateName(descriptor.name));
        }

        info!(
            plugin = %descriptor.name,
            version = %descriptor.version,
            "Registering plugin"
        );
        plugins.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Remove a plugin. Rejected while a load or reload is in flight.
    pub fn unregister(&self, name: &str) -> Result<PluginDescriptor, RegistryError> {
        let mut plugins = self.plugins.write();

        let state = plugins
            .get(name)
            .map(|d| d.state)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        if matches!(state, PluginState::Loading | PluginState::Reloading) {
            return Err(RegistryError::InvalidTransition {
                name: name.to_string(),
                expected: PluginState::Active,
                actual: state,
                target: PluginState::Unloaded,
            });
        }

        info!(plugin = %name, "Unregistering plugin");
        plugins
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<PluginDescriptor, RegistryError> {
        self.plugins
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.read().contains_key(name)
    }

    pub fn state(&self, name: &str) -> Result<PluginState, RegistryError> {
        self.plugins
            .read()
            .get(name)
            .map(|d| d.state)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Guarded compare-and-swap of a plugin's state.
    pub fn transition(
        &self,
        name: &str,
        from: PluginState,
        to: PluginState,
    ) -> Result<PluginDescriptor, RegistryError> {
        self.transition_with(name, from, to, |_| Ok(()))
    }

    /// Like [`PluginRegistry::transition`], applying `update` to the
    /// descriptor in the same critical section. If `update` fails nothing
    /// changes.
    pub fn transition_with<F>(
        &self,
        name: &str,
        from: PluginState,
        to: PluginState,
        update: F,
    ) -> Result<PluginDescriptor, RegistryError>
    where
        F: FnOnce(&mut PluginDescriptor) -> Result<(), RegistryError>,
    {
        let mut plugins = self.plugins.write();
        let current = plugins
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        if current.state != from || !from.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition {
                name: name.to_string(),
                expected: from,
                actual: current.state,
                target: to,
            });
        }

        let mut next = current.clone();
        update(&mut next)?;
        next.state = to;

        debug!(plugin = %name, from = %from, to = %to, "Plugin state transition");
        *current = next;
        Ok(current.clone())
    }

    /// All descriptors, sorted by name
    pub fn list(&self) -> Vec<PluginDescriptor> {
        let mut all: Vec<_> = self.plugins.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.plugins.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of every `Active` plugin, sorted
    pub fn active_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .plugins
            .read()
            .values()
            .filter(|d| d.state == PluginState::Active)
            .map(|d| d.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn find_by_state(&self, state: PluginState) -> Vec<PluginDescriptor> {
        let mut found: Vec<_> = self
            .plugins
            .read()
            .values()
            .filter(|d| d.state == state)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    pub fn find_by_capability(&self, capability: Capability) -> Vec<PluginDescriptor> {
        let mut found: Vec<_> = self
            .plugins
            .read()
            .values()
            .filter(|d| d.has_capability(capability))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    /// Name of the plugin owning a changed path, if any.
    ///
    /// The most specific location wins when locations nest.
    pub fn owner_of(&self, path: &Path) -> Option<String> {
        let plugins = self.plugins.read();
        plugins
            .values()
            .flat_map(|d| {
                d.source_locations
                    .iter()
                    .filter(|loc| path == loc.as_path() || path.starts_with(loc))
                    .map(move |loc| (loc.components().count(), d.name.clone()))
            })
            .max_by_key(|(depth, _)| *depth)
            .map(|(_, name)| name)
    }

    /// Constraints other plugins record against `name`.
    pub fn constraints_on(&self, name: &str) -> Vec<(String, VersionReq)> {
        let mut constraints: Vec<_> = self
            .plugins
            .read()
            .values()
            .filter_map(|d| d.requires.get(name).map(|req| (d.name.clone(), req.clone())))
            .collect();
        constraints.sort_by(|a, b| a.0.cmp(&b.0));
        constraints
    }

    pub fn stats(&self) -> RegistryStats {
        let plugins = self.plugins.read();

        let mut stats = RegistryStats {
            total_plugins: plugins.len(),
            ..RegistryStats::default()
        };

        for descriptor in plugins.values() {
            match descriptor.state {
                PluginState::Active => stats.active_plugins += 1,
                PluginState::Failed => stats.failed_plugins += 1,
                _ => {}
            }
            stats.total_reloads += descriptor.reload_count as usize;
        }

        stats
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_plugins: usize,
    pub active_plugins: usize,
    pub failed_plugins: usize,
    pub total_reloads: usize,
}
