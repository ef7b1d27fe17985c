use super::*;
use serde::Deserialize;
use std::fs;
use tempfile::TempDir;

#[derive(Debug, Deserialize, PartialEq)]
struct WatchSection {
    plugin_dirs: Vec<String>,
    cooldown_ms: u64,
}

#[test]
fn test_detect_format() {
    assert_eq!(detect_format(Path::new("opsctl.yaml")).unwrap(), FileFormat::Yaml);
    assert_eq!(detect_format(Path::new("opsctl.yml")).unwrap(), FileFormat::Yaml);
    assert_eq!(detect_format(Path::new("opsctl.toml")).unwrap(), FileFormat::Toml);
    assert_eq!(detect_format(Path::new("opsctl.json")).unwrap(), FileFormat::Json);
    assert!(detect_format(Path::new("opsctl.txt")).is_err());
    assert!(detect_format(Path::new("opsctl")).is_err());
}

#[test]
fn test_from_str_toml_and_yaml_agree() {
    let toml = r#"
plugin_dirs = ["/opt/opsctl/plugins"]
cooldown_ms = 1500
"#;
    let yaml = r#"
plugin_dirs:
  - /opt/opsctl/plugins
cooldown_ms: 1500
"#;

    let a: WatchSection = from_str(toml, FileFormat::Toml).unwrap();
    let b: WatchSection = from_str(yaml, FileFormat::Yaml).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.cooldown_ms, 1500);
}

#[test]
fn test_substitute_env_vars() {
    // SAFETY: test-local variable names, not read by other tests
    unsafe {
        std::env::set_var("OPSCTL_TEST_PLUGIN_ROOT", "/srv/plugins");
    }

    assert_eq!(
        substitute_env_vars("dir = \"${OPSCTL_TEST_PLUGIN_ROOT}/gateway\""),
        "dir = \"/srv/plugins/gateway\""
    );
    assert_eq!(
        substitute_env_vars("dir = $OPSCTL_TEST_PLUGIN_ROOT"),
        "dir = /srv/plugins"
    );
    assert_eq!(
        substitute_env_vars("dir = ${OPSCTL_TEST_UNSET_VARIABLE}"),
        "dir = ${OPSCTL_TEST_UNSET_VARIABLE}"
    );
}

#[test]
fn test_load_config_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("opsctl.json");
    fs::write(
        &path,
        r#"{ "plugin_dirs": ["./plugins", "./vendor"], "cooldown_ms": 300 }"#,
    )
    .unwrap();

    let section: WatchSection = load_config(&path).unwrap();
    assert_eq!(section.plugin_dirs.len(), 2);
    assert_eq!(section.cooldown_ms, 300);

    let missing = load_config::<WatchSection>(dir.path().join("absent.toml"));
    assert!(matches!(missing, Err(ConfigError::Io(_))));
}
