//! Pre-flight validation of candidate plugin code
//!
//! Runs four ordered stages against a candidate and stops at the first
//! failure. Validation never touches the running instance.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use opsctl_kernel::{Capability, PluginManifest};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::loader::{Candidate, PluginLoader};
use super::registry::{PluginDescriptor, PluginRegistry, PluginVersion, VersionReq};

/// Validation stages, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationStage {
    /// The loader can parse the code unit
    Syntax,
    /// Name, version and capability set are acceptable
    InterfaceShape,
    /// Every declared dependency is available
    DependencyAvailability,
    /// Version constraints hold in both directions
    Compatibility,
}

impl ValidationStage {
    pub const ALL: [ValidationStage; 4] = [
        ValidationStage::Syntax,
        ValidationStage::InterfaceShape,
        ValidationStage::DependencyAvailability,
        ValidationStage::Compatibility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStage::Syntax => "syntax",
            ValidationStage::InterfaceShape => "interface-shape",
            ValidationStage::DependencyAvailability => "dependency-availability",
            ValidationStage::Compatibility => "compatibility",
        }
    }
}

impl std::fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: ValidationStage,
    pub passed: bool,
    pub message: String,
}

/// Ordered stage outcomes. Ends at the first failing stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    outcomes: Vec<StageOutcome>,
}

impl ValidationResult {
    fn record(&mut self, stage: ValidationStage, check: Result<String, String>) -> bool {
        let (passed, message) = match check {
            Ok(message) => (true, message),
            Err(message) => (false, message),
        };
        debug!(stage = %stage, passed, "{}", message);
        self.outcomes.push(StageOutcome {
            stage,
            passed,
            message,
        });
        passed
    }

    /// True when every stage ran and passed.
    pub fn passed(&self) -> bool {
        self.outcomes.len() == ValidationStage::ALL.len() && self.outcomes.iter().all(|o| o.passed)
    }

    pub fn outcomes(&self) -> &[StageOutcome] {
        &self.outcomes
    }

    /// The failing stage, if any.
    pub fn failure(&self) -> Option<&StageOutcome> {
        self.outcomes.iter().find(|o| !o.passed)
    }

    pub fn failed_stage(&self) -> Option<ValidationStage> {
        self.failure().map(|o| o.stage)
    }
}

/// What the validator knows about the running system.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Name the candidate must carry (the plugin being reloaded)
    pub expected_name: Option<String>,
    /// Capabilities advertised by the running version
    pub prior_capabilities: BTreeSet<Capability>,
    /// Plugins that count as available dependencies
    pub available: BTreeSet<String>,
    /// Constraints registered dependents record against this plugin
    pub dependent_constraints: Vec<(String, VersionReq)>,
    /// Current version of every registered plugin
    pub versions: HashMap<String, PluginVersion>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for replacing the running `current` descriptor. `unit`
    /// lists the plugins reloaded in the same unit.
    pub fn for_reload(registry: &PluginRegistry, current: &PluginDescriptor, unit: &[String]) -> Self {
        let mut ctx = Self::from_registry(registry, &current.name, unit);
        ctx.expected_name = Some(current.name.clone());
        ctx.prior_capabilities = current.capabilities.clone();
        ctx
    }

    /// Context for loading `name` for the first time (or after a failure).
    pub fn for_load(registry: &PluginRegistry, name: &str) -> Self {
        Self::from_registry(registry, name, &[])
    }

    fn from_registry(registry: &PluginRegistry, name: &str, unit: &[String]) -> Self {
        let descriptors = registry.list();
        let mut available: BTreeSet<String> = registry.active_names().into_iter().collect();
        available.extend(unit.iter().filter(|n| n.as_str() != name).cloned());

        Self {
            expected_name: None,
            prior_capabilities: BTreeSet::new(),
            available,
            dependent_constraints: registry
                .constraints_on(name)
                .into_iter()
                .filter(|(dependent, _)| dependent != name)
                .collect(),
            versions: descriptors
                .into_iter()
                .map(|d| (d.name, d.version))
                .collect(),
        }
    }

    pub fn with_expected_name(mut self, name: &str) -> Self {
        self.expected_name = Some(name.to_string());
        self
    }

    pub fn with_prior_capability(mut self, cap: Capability) -> Self {
        self.prior_capabilities.insert(cap);
        self
    }

    pub fn with_available(mut self, name: &str, version: PluginVersion) -> Self {
        self.available.insert(name.to_string());
        self.versions.insert(name.to_string(), version);
        self
    }

    pub fn with_dependent_constraint(mut self, dependent: &str, req: VersionReq) -> Self {
        self.dependent_constraints.push((dependent.to_string(), req));
        self
    }
}

/// Staged validator
pub struct Validator {
    loader: Arc<dyn PluginLoader>,
}

impl Validator {
    pub fn new(loader: Arc<dyn PluginLoader>) -> Self {
        Self { loader }
    }

    /// Validate the code unit at `location`.
    ///
    /// The candidate is returned only when every stage passed.
    pub async fn validate(
        &self,
        location: &Path,
        ctx: &ValidationContext,
    ) -> (ValidationResult, Option<Candidate>) {
        self.validate_with(location, |_| ctx.clone()).await
    }

    /// Like [`Validator::validate`], building the context once the
    /// candidate's manifest is known.
    pub async fn validate_with<F>(
        &self,
        location: &Path,
        make_ctx: F,
    ) -> (ValidationResult, Option<Candidate>)
    where
        F: FnOnce(&PluginManifest) -> ValidationContext,
    {
        let mut result = ValidationResult::default();

        let candidate = match self.loader.prepare(location).await {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("Candidate at {:?} failed to parse: {}", location, e);
                result.record(ValidationStage::Syntax, Err(e.to_string()));
                return (result, None);
            }
        };
        result.record(
            ValidationStage::Syntax,
            Ok(format!(
                "{} {} parsed from {:?}",
                candidate.manifest.name, candidate.manifest.version, location
            )),
        );

        let ctx = make_ctx(&candidate.manifest);
        if self.check_manifest(&candidate.manifest, &ctx, &mut result) {
            (result, Some(candidate))
        } else {
            (result, None)
        }
    }

    /// Run the stages after `syntax` against an already parsed manifest.
    pub fn check_manifest(
        &self,
        manifest: &PluginManifest,
        ctx: &ValidationContext,
        result: &mut ValidationResult,
    ) -> bool {
        result.record(ValidationStage::InterfaceShape, check_interface(manifest, ctx))
            && result.record(
                ValidationStage::DependencyAvailability,
                check_dependencies(manifest, ctx),
            )
            && result.record(ValidationStage::Compatibility, check_compatibility(manifest, ctx))
    }
}

fn check_interface(manifest: &PluginManifest, ctx: &ValidationContext) -> Result<String, String> {
    if manifest.name.trim().is_empty() {
        return Err("plugin name is empty".to_string());
    }
    if let Some(expected) = ctx.expected_name.as_ref().filter(|e| **e != manifest.name) {
        return Err(format!(
            "candidate is named '{}', expected '{}'",
            manifest.name, expected
        ));
    }

    PluginVersion::parse(&manifest.version)
        .map_err(|e| format!("unparseable version: {}", e))?;

    if manifest.capabilities.is_empty() {
        return Err("no capabilities advertised".to_string());
    }

    let offered: BTreeSet<Capability> = manifest.capabilities.iter().copied().collect();
    let dropped: Vec<String> = ctx
        .prior_capabilities
        .difference(&offered)
        .map(|c| c.to_string())
        .collect();
    if !dropped.is_empty() {
        return Err(format!("drops capabilities: {}", dropped.join(", ")));
    }

    Ok(format!(
        "advertises {}",
        offered
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    ))
}

fn check_dependencies(manifest: &PluginManifest, ctx: &ValidationContext) -> Result<String, String> {
    if manifest.dependencies.iter().any(|d| d == &manifest.name) {
        return Err(format!("{} depends on itself", manifest.name));
    }

    let missing: Vec<&str> = manifest
        .dependencies
        .iter()
        .filter(|dep| !ctx.available.contains(*dep))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(format!("dependencies not active: {}", missing.join(", ")));
    }

    Ok(format!("{} dependencies available", manifest.dependencies.len()))
}

fn check_compatibility(manifest: &PluginManifest, ctx: &ValidationContext) -> Result<String, String> {
    let version = PluginVersion::parse(&manifest.version).map_err(|e| e.to_string())?;

    for (dependent, req) in &ctx.dependent_constraints {
        if !req.matches(&version) {
            return Err(format!(
                "{} requires {} {}, candidate is {}",
                dependent, manifest.name, req, version
            ));
        }
    }

    for (dep, raw) in &manifest.requires {
        let req = VersionReq::parse(raw)?;
        let current = ctx
            .versions
            .get(dep)
            .ok_or_else(|| format!("requirement on unknown plugin {}", dep))?;
        if !req.matches(current) {
            return Err(format!(
                "requires {} {}, running version is {}",
                dep, req, current
            ));
        }
    }

    Ok(format!(
        "{} satisfies {} dependent constraint(s)",
        version,
        ctx.dependent_constraints.len()
    ))
}
