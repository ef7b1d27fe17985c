//! Runtime settings document
//!
//! One file configures the whole runtime:
//!
//! ```toml
//! plugin_dirs = ["/etc/opsctl/plugins"]
//!
//! [hot_reload]
//! strategy = "debounced"
//! cooldown_ms = 2000
//! preserve_state = true
//! snapshot_dir = "/var/lib/opsctl/snapshots"
//!
//! [watch]
//! extensions = ["toml", "so"]
//! ignore_patterns = [".swp"]
//!
//! [plugins.billing]
//! currency = "EUR"
//! ```
//!
//! Values may reference `${VAR}`; `OPSCTL_HOT_RELOAD__COOLDOWN_MS=500`
//! style variables override the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use opsctl_kernel::config::load_with_env;
use opsctl_kernel::{HotReloadConfig, ReloadStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{IntoRuntimeReport, RuntimeResult};
use crate::hot_reload::WatchConfig;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "OPSCTL";

/// Reload strategy as written in the settings file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Immediate,
    #[default]
    Debounced,
    Manual,
}

/// `[hot_reload]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadSection {
    pub strategy: StrategyKind,
    pub cooldown_ms: u64,
    pub preserve_state: bool,
    pub health_check_timeout_ms: u64,
    pub queue_capacity: usize,
    /// Directory finalized snapshots are written to, if any
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for HotReloadSection {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Debounced,
            cooldown_ms: 2000,
            preserve_state: true,
            health_check_timeout_ms: 5000,
            queue_capacity: 64,
            snapshot_dir: None,
        }
    }
}

impl From<&HotReloadSection> for HotReloadConfig {
    fn from(section: &HotReloadSection) -> Self {
        let strategy = match section.strategy {
            StrategyKind::Immediate => ReloadStrategy::Immediate,
            StrategyKind::Debounced => {
                ReloadStrategy::Debounced(Duration::from_millis(section.cooldown_ms))
            }
            StrategyKind::Manual => ReloadStrategy::Manual,
        };

        HotReloadConfig::new()
            .with_strategy(strategy)
            .with_preserve_state(section.preserve_state)
            .with_health_check_timeout(Duration::from_millis(section.health_check_timeout_ms))
            .with_queue_capacity(section.queue_capacity)
    }
}

/// `[watch]` section; unset fields keep the [`WatchConfig`] defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSection {
    pub extensions: Option<Vec<String>>,
    pub ignore_patterns: Vec<String>,
    pub recursive: Option<bool>,
    pub tick_ms: Option<u64>,
}

impl From<&WatchSection> for WatchConfig {
    fn from(section: &WatchSection) -> Self {
        let mut config = WatchConfig::default();
        if let Some(extensions) = &section.extensions {
            config.extensions = extensions.clone();
        }
        config.ignore_patterns.extend(section.ignore_patterns.iter().cloned());
        if let Some(recursive) = section.recursive {
            config.recursive = recursive;
        }
        if let Some(tick) = section.tick_ms {
            config.tick = Duration::from_millis(tick);
        }
        config
    }
}

/// Whole runtime settings document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub hot_reload: HotReloadSection,
    pub watch: WatchSection,
    /// Directories scanned and watched for plugin code units
    pub plugin_dirs: Vec<PathBuf>,
    /// Host settings per plugin, overlaid on manifest settings
    pub plugins: HashMap<String, HashMap<String, serde_json::Value>>,
}

impl RuntimeSettings {
    /// Load from a YAML/TOML/JSON/... file with `OPSCTL_*` overrides.
    pub fn from_file(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        load_with_env(path, ENV_PREFIX).into_report()
    }

    pub fn hot_reload_config(&self) -> HotReloadConfig {
        HotReloadConfig::from(&self.hot_reload)
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig::from(&self.watch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_runtime_defaults() {
        let settings = RuntimeSettings::default();
        let config = settings.hot_reload_config();

        assert_eq!(config.strategy, ReloadStrategy::Debounced(Duration::from_secs(2)));
        assert!(config.preserve_state);
        assert_eq!(config.health_check_timeout, Duration::from_secs(5));
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(settings.watch_config().extensions, WatchConfig::default().extensions);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opsctl.toml");
        std::fs::write(
            &path,
            r#"
plugin_dirs = ["/srv/opsctl/plugins"]

[hot_reload]
strategy = "manual"
health_check_timeout_ms = 250
snapshot_dir = "/var/lib/opsctl/snapshots"

[watch]
extensions = ["toml"]
ignore_patterns = [".swp"]
tick_ms = 20

[plugins.billing]
currency = "EUR"
"#,
        )
        .unwrap();

        let settings = RuntimeSettings::from_file(&path).unwrap();
        assert_eq!(settings.plugin_dirs, vec![PathBuf::from("/srv/opsctl/plugins")]);
        assert_eq!(settings.plugins["billing"]["currency"], serde_json::json!("EUR"));

        assert_eq!(
            settings.hot_reload.snapshot_dir,
            Some(PathBuf::from("/var/lib/opsctl/snapshots"))
        );

        let config = settings.hot_reload_config();
        assert_eq!(config.strategy, ReloadStrategy::Manual);
        assert_eq!(config.health_check_timeout, Duration::from_millis(250));
        assert_eq!(config.queue_capacity, 64);

        let watch = settings.watch_config();
        assert_eq!(watch.extensions, vec!["toml".to_string()]);
        assert!(watch.ignore_patterns.contains(&".swp".to_string()));
        assert_eq!(watch.tick, Duration::from_millis(20));
        assert!(watch.recursive);
    }

    #[test]
    fn test_missing_file() {
        let err = RuntimeSettings::from_file("/nonexistent/opsctl.toml").unwrap_err();
        assert!(matches!(
            err.current_context(),
            crate::error::RuntimeError::Config(_)
        ));
    }
}
