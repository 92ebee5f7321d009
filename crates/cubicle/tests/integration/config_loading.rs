use cubicle::config::{Config, ConfigError, SourceLayout};

use super::FIXTURES_PATH;

#[test]
fn test_load_valid_config() {
    let path = format!("{}/configs/valid_full.toml", FIXTURES_PATH);
    let config = Config::from_file(&path).expect("Failed to load config");

    assert!(config.languages.contains_key("java"));
    assert!(config.languages.contains_key("python"));
    assert_eq!(config.default_limits.memory_mb, Some(128));
    assert_eq!(config.default_limits.timeout_secs, Some(5.0));
    assert_eq!(config.sessions.idle_timeout_secs, 600);
    assert_eq!(config.app.backend_port_base, 6000);
    assert_eq!(config.server.ws_prefix, "/ws/session");

    let java = config.get_language("java").expect("java not found");
    assert_eq!(java.layout, SourceLayout::Package);
    assert!(java.is_compiled());

    let limits = config.effective_limits(java.limits.as_ref());
    assert_eq!(limits.memory_mb, Some(512));
    assert_eq!(limits.cpus, Some(0.25));
}

#[test]
fn test_load_minimal_config() {
    let path = format!("{}/configs/valid_minimal.toml", FIXTURES_PATH);
    let config = Config::from_file(&path).expect("Failed to load config");

    assert!(config.languages.contains_key("shell"));
    assert_eq!(config.app.frontend_port_base, 3000);
    assert_eq!(config.server.ws_prefix, "/ws/interactive");
}

#[test]
fn test_load_shipped_example_config() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/cubicle.example.toml");
    let config = Config::from_file(path).expect("Failed to load example config");

    for id in ["java", "python", "c", "cpp", "go"] {
        assert!(config.languages.contains_key(id), "missing {id}");
    }
}

#[test]
fn test_load_missing_file() {
    let path = format!("{}/configs/does_not_exist.toml", FIXTURES_PATH);
    let result = Config::from_file(&path);
    assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
}

#[test]
fn test_load_invalid_empty_name() {
    let path = format!("{}/configs/invalid_empty_name.toml", FIXTURES_PATH);
    let result = Config::from_file(&path);
    assert!(result.is_err());
}

#[test]
fn test_load_invalid_empty_extension() {
    let path = format!("{}/configs/invalid_empty_extension.toml", FIXTURES_PATH);
    let result = Config::from_file(&path);
    assert!(result.is_err());
}

#[test]
fn test_load_invalid_empty_run_command() {
    let path = format!("{}/configs/invalid_empty_run_command.toml", FIXTURES_PATH);
    let result = Config::from_file(&path);
    assert!(result.is_err());
}

#[test]
fn test_load_invalid_entry_pattern() {
    let path = format!("{}/configs/invalid_entry_pattern.toml", FIXTURES_PATH);
    let result = Config::from_file(&path);
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}
