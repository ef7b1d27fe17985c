//! Unit tests for the plugin contract types
//!
//! Covers:
//! - [`Capability`] string forms
//! - [`PluginManifest`] builder methods and TOML shape
//! - [`PluginContext`] shared state
//! - [`HotReloadConfig`] builder and defaults
//! - [`OpsPlugin`] default hooks
#![allow(clippy::module_inception)]

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::time::Duration;

    use crate::plugin::{
        Capability, CommandSpec, HotReloadConfig, OpsPlugin, PluginContext, PluginManifest,
        PluginResult, ReloadPhase, ReloadStrategy,
    };

    // =========================================================================
    // Capability
    // =========================================================================

    #[test]
    fn test_capability_round_trips_through_str() {
        for cap in [
            Capability::CommandProvider,
            Capability::ConfigExtender,
            Capability::ServiceProvider,
        ] {
            let parsed: Capability = cap.as_str().parse().unwrap();
            assert_eq!(parsed, cap);
        }
        assert!("gateway".parse::<Capability>().is_err());
    }

    // =========================================================================
    // PluginManifest
    // =========================================================================

    #[test]
    fn test_manifest_builder() {
        let manifest = PluginManifest::new("billing", "1.4.0")
            .with_description("Invoice commands")
            .with_dependency("database")
            .with_capability(Capability::CommandProvider)
            .with_capability(Capability::CommandProvider)
            .with_requirement("database", "^1.0")
            .with_setting("currency", "EUR");

        assert_eq!(manifest.dependencies, vec!["database".to_string()]);
        assert_eq!(manifest.capabilities.len(), 1, "capabilities are a set");
        assert_eq!(manifest.requires.get("database").map(String::as_str), Some("^1.0"));
        assert_eq!(manifest.factory_key(), "billing");
        assert_eq!(
            manifest.with_factory("billing-v2").factory_key(),
            "billing-v2"
        );
    }

    #[test]
    fn test_manifest_deserializes_kebab_case_capabilities() {
        let json = r#"{
            "name": "gateway",
            "version": "2.0.0",
            "capabilities": ["service-provider", "config-extender"]
        }"#;

        let manifest: PluginManifest = serde_json::from_str(json).unwrap();
        assert!(manifest.has_capability(Capability::ServiceProvider));
        assert!(manifest.has_capability(Capability::ConfigExtender));
        assert!(!manifest.has_capability(Capability::CommandProvider));
        assert!(manifest.dependencies.is_empty());
    }

    // =========================================================================
    // PluginContext
    // =========================================================================

    #[tokio::test]
    async fn test_context_shares_state_between_plugins() {
        let host = PluginContext::new("cluster");
        host.set_state("kubeconfig", "/etc/kube/config".to_string()).await;

        let other = host.for_plugin("charts");
        assert_eq!(other.plugin, "charts");
        assert_eq!(
            other.get_state::<String>("kubeconfig").await.as_deref(),
            Some("/etc/kube/config")
        );
        assert_eq!(other.get_state::<u32>("kubeconfig").await, None);
    }

    #[test]
    fn test_context_typed_settings() {
        let manifest = PluginManifest::new("gateway", "1.0.0").with_setting("port", 8443);
        let ctx = PluginContext::new("gateway").with_settings(manifest.settings);

        assert_eq!(ctx.setting::<u16>("port"), Some(8443));
        assert_eq!(ctx.setting::<String>("port"), None);
        assert_eq!(ctx.setting::<u16>("missing"), None);
    }

    // =========================================================================
    // HotReloadConfig
    // =========================================================================

    #[test]
    fn test_hot_reload_config_defaults() {
        let config = HotReloadConfig::default();
        assert_eq!(config.strategy, ReloadStrategy::Debounced(Duration::from_secs(2)));
        assert!(config.preserve_state);
        assert_eq!(config.queue_capacity, 64);
    }

    #[test]
    fn test_hot_reload_config_builder() {
        let config = HotReloadConfig::new()
            .with_cooldown(Duration::from_millis(250))
            .with_preserve_state(false)
            .with_health_check_timeout(Duration::from_secs(1))
            .with_queue_capacity(0);

        assert_eq!(config.strategy.cooldown(), Some(Duration::from_millis(250)));
        assert!(!config.preserve_state);
        assert_eq!(config.queue_capacity, 1, "queue capacity is clamped to 1");
        assert!(!ReloadStrategy::Manual.watches_files());
        assert_eq!(ReloadStrategy::Immediate.cooldown(), Some(Duration::ZERO));
    }

    #[test]
    fn test_reload_phase_classification() {
        assert!(ReloadPhase::Pending.is_cancellable());
        assert!(ReloadPhase::Validating.is_cancellable());
        assert!(!ReloadPhase::Snapshotting.is_cancellable());
        assert!(ReloadPhase::Committed.is_terminal());
        assert!(ReloadPhase::RolledBack.is_terminal());
        assert!(!ReloadPhase::HealthChecking.is_terminal());
    }

    // =========================================================================
    // OpsPlugin defaults
    // =========================================================================

    struct Minimal {
        manifest: PluginManifest,
    }

    #[async_trait::async_trait]
    impl OpsPlugin for Minimal {
        fn manifest(&self) -> &PluginManifest {
            &self.manifest
        }

        async fn initialize(&mut self, _ctx: &PluginContext) -> PluginResult<()> {
            Ok(())
        }

        fn commands(&self) -> Vec<CommandSpec> {
            vec![CommandSpec::new("status", "Show status")]
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[tokio::test]
    async fn test_plugin_default_hooks() {
        let mut plugin = Minimal {
            manifest: PluginManifest::new("minimal", "0.1.0"),
        };

        assert_eq!(plugin.name(), "minimal");
        assert_eq!(plugin.version(), "0.1.0");
        assert!(plugin.health_check().await.unwrap());
        assert!(plugin.attributes().is_empty());
        assert!(plugin.export_state().is_none());
        assert!(!plugin.import_state(b"blob").unwrap());
        assert!(plugin.detach_connections().is_empty());
        assert!(plugin.execute("status", &[]).await.is_err());
        assert_eq!(plugin.commands()[0].name, "status");
    }
}
