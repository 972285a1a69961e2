//! Loading the application configuration from files and the environment.

use sardana::config::{ElementKind, SardanaConfig};
use serial_test::serial;
use std::fs;
use tempfile::tempdir;

const MINIMAL: &str = r#"
[application]
name = "test-pool"
log_level = "debug"

[pool]
motion_loop_sleep_ms = 2

[[controllers]]
name = "motctrl01"
type = "dummy_motor"
[controllers.config]
settle_polls = 1

[[elements]]
name = "mot01"
kind = "motor"
controller = "motctrl01"
axis = 1
"#;

#[test]
#[serial]
fn test_load_from_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sardana.toml");
    fs::write(&path, MINIMAL).unwrap();

    let config = SardanaConfig::load_from(&path).unwrap();
    assert_eq!(config.application.name, "test-pool");
    assert_eq!(config.pool.motion_loop_sleep_ms, 2);
    // untouched pool settings keep their defaults
    assert_eq!(config.pool.motion_loop_states_per_position, 5);
    assert_eq!(config.elements[0].kind, ElementKind::Motor);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sardana.toml");
    fs::write(&path, MINIMAL).unwrap();

    std::env::set_var("SARDANA_POOL__MOTION_LOOP_SLEEP_MS", "7");
    std::env::set_var("SARDANA_APPLICATION__LOG_LEVEL", "warn");
    let config = SardanaConfig::load_from(&path);
    std::env::remove_var("SARDANA_POOL__MOTION_LOOP_SLEEP_MS");
    std::env::remove_var("SARDANA_APPLICATION__LOG_LEVEL");

    let config = config.unwrap();
    assert_eq!(config.pool.motion_loop_sleep_ms, 7);
    assert_eq!(config.application.log_level, "warn");
}

#[test]
#[serial]
fn test_missing_file_gives_defaults() {
    let dir = tempdir().unwrap();
    let config = SardanaConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert!(config.controllers.is_empty());
    assert_eq!(config.pool.worker_threads, 16);
}

#[test]
#[serial]
fn test_malformed_element_kind_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sardana.toml");
    fs::write(
        &path,
        r#"
[[controllers]]
name = "motctrl01"
type = "dummy_motor"

[[elements]]
name = "mot01"
kind = "pseudo_motor"
controller = "motctrl01"
axis = 1
"#,
    )
    .unwrap();

    assert!(SardanaConfig::load_from(&path).is_err());
}

#[test]
#[serial]
fn test_shipped_configuration_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/sardana.toml");
    let config = SardanaConfig::load_from(path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.motor_groups[0].motors.len(), 3);
}
