//! Unit tests for configuration and graceful degradation
//!
//! Covers:
//! - Missing TOML files fall back to defaults instead of failing
//! - Malformed TOML files are reported as configuration errors
//! - Priority order for data folder resolution
//!
//! Note: Uses serial_test to prevent ENV variable race conditions.
//! Tests that manipulate KINDRED_DATA_FOLDER are marked with #[serial].

use kindred_common::config::{
    default_data_folder, load_toml_config, locate_config_file, resolve_data_folder,
    write_toml_config, LoggingConfig, DATA_FOLDER_ENV,
};
use kindred_common::Error;
use serde::{Deserialize, Serialize};
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct SampleConfig {
    data_folder: Option<PathBuf>,
    logging: LoggingConfig,
    queue_size: u32,
}

#[test]
fn test_missing_config_file_yields_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope.toml");

    let config: SampleConfig = load_toml_config(Some(&missing)).unwrap();

    assert_eq!(config, SampleConfig::default());
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_no_config_path_yields_defaults() {
    let config: SampleConfig = load_toml_config(None).unwrap();
    assert_eq!(config, SampleConfig::default());
}

#[test]
fn test_write_then_load_config() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("config.toml");

    let written = SampleConfig {
        data_folder: Some(PathBuf::from("/srv/kindred")),
        logging: LoggingConfig {
            level: "debug".to_string(),
        },
        queue_size: 15,
    };
    write_toml_config(&written, &path).unwrap();

    let loaded: SampleConfig = load_toml_config(Some(&path)).unwrap();
    assert_eq!(loaded, written);
}

#[test]
fn test_partial_config_fills_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(&path, "queue_size = 7\n").unwrap();

    let loaded: SampleConfig = load_toml_config(Some(&path)).unwrap();
    assert_eq!(loaded.queue_size, 7);
    assert_eq!(loaded.logging, LoggingConfig::default());
}

#[test]
fn test_malformed_config_is_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(&path, "queue_size = [not toml").unwrap();

    let result: Result<SampleConfig, Error> = load_toml_config(Some(&path));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_explicit_config_path_wins() {
    let explicit = Path::new("/tmp/definitely-explicit.toml");
    assert_eq!(locate_config_file(Some(explicit)), Some(explicit.to_path_buf()));
}

#[test]
#[serial]
fn test_cli_argument_has_highest_priority() {
    env::set_var(DATA_FOLDER_ENV, "/from/env");

    let resolved = resolve_data_folder(
        Some(Path::new("/from/cli")),
        DATA_FOLDER_ENV,
        Some(Path::new("/from/toml")),
    );

    env::remove_var(DATA_FOLDER_ENV);
    assert_eq!(resolved, PathBuf::from("/from/cli"));
}

#[test]
#[serial]
fn test_env_beats_config_file() {
    env::set_var(DATA_FOLDER_ENV, "/from/env");

    let resolved = resolve_data_folder(None, DATA_FOLDER_ENV, Some(Path::new("/from/toml")));

    env::remove_var(DATA_FOLDER_ENV);
    assert_eq!(resolved, PathBuf::from("/from/env"));
}

#[test]
#[serial]
fn test_config_value_beats_default() {
    env::remove_var(DATA_FOLDER_ENV);

    let resolved = resolve_data_folder(None, DATA_FOLDER_ENV, Some(Path::new("/from/toml")));
    assert_eq!(resolved, PathBuf::from("/from/toml"));
}

#[test]
#[serial]
fn test_resolver_with_no_overrides_uses_default() {
    env::remove_var(DATA_FOLDER_ENV);

    let resolved = resolve_data_folder(None, DATA_FOLDER_ENV, None);
    assert_eq!(resolved, default_data_folder());
    assert!(resolved.to_string_lossy().contains("kindred"));
}
