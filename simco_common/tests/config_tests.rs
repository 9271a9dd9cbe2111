//! File-backed configuration loading tests.

use std::io::Write;

use simco_common::config::{ConfigError, ConfigLoader, CoordinationMode, JsonConfigLoader};

fn write_config(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn loads_minimal_config() {
    let file = write_config(
        r#"{
            "coord_mode": "async",
            "module_configs": [
                {
                    "name": "planning",
                    "bin_path": "/usr/bin/true",
                    "exec_period_ms": 100,
                    "response_time_ms": 20
                }
            ]
        }"#,
    );
    let config = JsonConfigLoader::new(file.path()).load().unwrap();
    assert_eq!(config.coord_mode, CoordinationMode::Async);
    assert_eq!(config.module_configs.len(), 1);
    let m = &config.module_configs[0];
    assert_eq!(m.name, "planning");
    assert_eq!(m.exec_period_ms, 100);
    assert!(m.auto_launch);
    assert!(config.auto_stop);
    assert!(config.max_forcing_timeout_ms > 0);
}

#[test]
fn missing_file_is_not_found() {
    let loader = JsonConfigLoader::new("/nonexistent/simco.json");
    assert!(matches!(loader.load(), Err(ConfigError::FileNotFound(_))));
}

#[test]
fn malformed_json_is_parse_error() {
    let file = write_config("{ not json");
    let loader = JsonConfigLoader::new(file.path());
    assert!(matches!(loader.load(), Err(ConfigError::ParseError(_))));
}

#[test]
fn zero_period_is_validation_error() {
    let file = write_config(
        r#"{
            "coord_mode": "sync",
            "module_configs": [
                { "name": "control", "bin_path": "/usr/bin/true", "exec_period_ms": 0 }
            ]
        }"#,
    );
    let loader = JsonConfigLoader::new(file.path());
    assert!(matches!(loader.load(), Err(ConfigError::ValidationError(_))));
}

#[test]
fn unknown_coordination_mode_is_parse_error() {
    let file = write_config(r#"{ "coord_mode": "turbo", "module_configs": [] }"#);
    let loader = JsonConfigLoader::new(file.path());
    assert!(matches!(loader.load(), Err(ConfigError::ParseError(_))));
}
