//! Exercises `load_config` against real files on disk: env interpolation,
//! validation failures, and the not-found path, none of which the unit
//! tests in `src/config/` cover since those work against in-memory TOML
//! strings only.

use std::fs;

use mcpd::config::load_config;
use mcpd::error::ConfigError;

#[test]
fn loads_a_valid_config_file_with_env_interpolation() {
    std::env::set_var("MCPD_TEST_SERVER_COMMAND", "fake-mcp-server");
    let dir = tempfile::tempdir().expect("create temp dir");
    let config_path = dir.path().join("config.toml");
    fs::write(
        &config_path,
        r#"
        [[server]]
        server_id = "primary"
        command = "${MCPD_TEST_SERVER_COMMAND}"
        args = ["--stdio"]
        priority = 0
        idle_timeout = "5m"
        "#,
    )
    .expect("write config file");

    let config = load_config(Some(&config_path)).expect("config should load and validate");
    assert_eq!(config.servers.len(), 1);
    assert_eq!(config.servers[0].command, "fake-mcp-server");
    assert_eq!(config.servers[0].args, vec!["--stdio".to_string()]);

    std::env::remove_var("MCPD_TEST_SERVER_COMMAND");
}

#[test]
fn missing_config_file_reports_not_found() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let missing = dir.path().join("does-not-exist.toml");

    let result = load_config(Some(&missing));
    assert!(matches!(result, Err(ConfigError::NotFound { .. })));
}

#[test]
fn config_with_no_servers_fails_validation() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let config_path = dir.path().join("config.toml");
    fs::write(&config_path, "[daemon]\n").expect("write config file");

    let result = load_config(Some(&config_path));
    assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
}

#[test]
fn malformed_toml_reports_parse_error() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let config_path = dir.path().join("config.toml");
    fs::write(&config_path, "this is not valid toml {{{").expect("write config file");

    let result = load_config(Some(&config_path));
    assert!(matches!(result, Err(ConfigError::ParseError { .. })));
}
