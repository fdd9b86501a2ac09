//! Loads `AgentConfig` the way the agent binary does at startup: from a real TOML file
//! on disk, through the `VISIONOPS_` environment overlay, into validation.

use std::io::Write;
use visionops::config::AgentConfig;

fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("agent.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    (dir, path)
}

#[test]
fn a_minimal_valid_file_loads_with_governor_defaults_intact() {
    let (_dir, path) = write_config(
        r#"
        [[cameras]]
        id = "cam-1"
        url = "rtsp://127.0.0.1/stream"

        [replication]
        endpoint_base_url = "https://example.invalid"
        "#,
    );

    let config = AgentConfig::load(&path).unwrap();
    assert_eq!(config.cameras.len(), 1);
    assert_eq!(config.governor.warm_temp_celsius, 65.0);
    assert_eq!(config.governor.hot_temp_celsius, 70.0);
    assert_eq!(config.governor.critical_temp_celsius, 75.0);
    assert_eq!(config.governor.memory_warn_mb, 4000.0);
    assert_eq!(config.governor.memory_hot_mb, 5000.0);
    assert_eq!(config.governor.memory_critical_mb, 6000.0);
}

#[test]
fn a_file_with_inverted_thermal_thresholds_fails_validation() {
    let (_dir, path) = write_config(
        r#"
        [[cameras]]
        id = "cam-1"
        url = "rtsp://127.0.0.1/stream"

        [replication]
        endpoint_base_url = "https://example.invalid"

        [governor]
        warm_temp_celsius = 80.0
        hot_temp_celsius = 70.0
        critical_temp_celsius = 90.0
        "#,
    );

    let result = AgentConfig::load(&path);
    assert!(result.is_err(), "warm >= hot must be rejected at load time, not silently accepted");
}

#[test]
fn environment_overlay_applies_on_top_of_the_file_during_load() {
    let (dir, path) = write_config(
        r#"
        [[cameras]]
        id = "cam-1"
        url = "rtsp://127.0.0.1/stream"

        [replication]
        endpoint_base_url = "https://example.invalid"
        "#,
    );

    let overridden = dir.path().join("overridden.db");
    // SAFETY: test-only, scoped to this process; no other test in this binary reads
    // this particular variable.
    unsafe { std::env::set_var("VISIONOPS_DATABASE_PATH", &overridden) };
    let config = AgentConfig::load(&path).unwrap();
    unsafe { std::env::remove_var("VISIONOPS_DATABASE_PATH") };

    assert_eq!(config.database_path, overridden);
}

#[test]
fn missing_file_surfaces_a_configuration_error_rather_than_panicking() {
    let result = AgentConfig::load("/nonexistent/path/agent.toml");
    assert!(result.is_err());
}
