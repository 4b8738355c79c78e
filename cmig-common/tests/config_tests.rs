//! Tests for config file resolution and root folder priority
//!
//! Tests that manipulate CMIG_* environment variables are marked #[serial]
//! so they never race each other.

use cmig_common::config::{
    load_or_default, load_toml_config, resolve_config_path, resolve_root_folder, TomlConfig,
};
use serial_test::serial;
use std::env;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_load_full_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cmig-migrate.toml");
    std::fs::write(
        &path,
        r#"
root_folder = "/srv/cmig"
bind_address = "0.0.0.0:5740"
approvers = ["ops-lead"]

[logging]
level = "debug"

[orchestrator]
vendor_max_attempts = 5
promote_batch_size = 50

[agent]
url = "http://agent.internal:9000"
"#,
    )
    .unwrap();

    let config = load_toml_config(&path).unwrap();
    assert_eq!(config.bind_address.as_deref(), Some("0.0.0.0:5740"));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.orchestrator.vendor_max_attempts, 5);
    assert_eq!(config.orchestrator.promote_batch_size, 50);
    assert_eq!(config.orchestrator.vendor_call_deadline_ms, 30_000);
    assert_eq!(config.agent.url.as_deref(), Some("http://agent.internal:9000"));
    assert_eq!(config.approvers, vec!["ops-lead".to_string()]);
}

#[test]
fn test_malformed_config_is_config_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "root_folder = [unclosed").unwrap();

    let err = load_toml_config(&path).unwrap_err();
    assert!(matches!(err, cmig_common::Error::Config(_)));
}

#[test]
fn test_explicit_missing_file_is_error() {
    let missing = PathBuf::from("/definitely/not/here/cmig-migrate.toml");
    assert!(load_or_default(Some(&missing), "CMIG_CONFIG_TEST_UNSET").is_err());
}

#[test]
#[serial]
fn test_env_config_path_used_when_no_cli() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("env.toml");
    std::fs::write(&path, "bind_address = \"127.0.0.1:6000\"").unwrap();

    env::set_var("CMIG_CONFIG_TEST", &path);
    let resolved = resolve_config_path(None, "CMIG_CONFIG_TEST");
    env::remove_var("CMIG_CONFIG_TEST");

    assert_eq!(resolved, Some(path));
}

#[test]
#[serial]
fn test_env_root_folder_beats_toml() {
    let config = TomlConfig {
        root_folder: Some("/from/toml".to_string()),
        ..Default::default()
    };

    env::set_var("CMIG_ROOT_FOLDER_TEST", "/from/env");
    let root = resolve_root_folder(None, "CMIG_ROOT_FOLDER_TEST", &config);
    env::remove_var("CMIG_ROOT_FOLDER_TEST");

    assert_eq!(root, PathBuf::from("/from/env"));
}
