//! Configuration system tests
//!
//! Tests configuration loading, validation, and environment overrides

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use predicates::prelude::*;
use tempfile::TempDir;

use syncdeck::config::{init_config, SyncConfig};
use syncdeck::Error;

/// Test fixture for configuration testing
struct ConfigFixture {
    temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("syncdeck.toml");
        Self { temp_dir, config_path }
    }

    fn write_config(&self, content: &str) {
        fs::write(&self.config_path, content).unwrap();
    }

    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }

    fn cmd(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::Command::cargo_bin("syncdeck").unwrap();
        cmd.current_dir(self.temp_dir.path())
            .env("HOME", self.temp_dir.path())
            .env("XDG_CONFIG_HOME", self.temp_dir.path().join(".config"));
        cmd
    }
}

// ─────────────────────────────────────────────────────────────────
// Valid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_minimal_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[client]
url = "wss://example.com/ws"
"#,
    );

    let config = SyncConfig::load(Some(fixture.path())).unwrap();
    assert_eq!(config.client.url, "wss://example.com/ws");
    assert_eq!(config.reconnect.initial_delay_ms, 1_000);
    assert_eq!(config.sync.log_capacity, 1_000);

    fixture
        .cmd()
        .args(["config", "validate", "--config", fixture.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_full_config_drives_component_settings() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[client]
url = "ws://dash.local:9000/ws"
connect_timeout_ms = 2500
capabilities = ["state.patch"]
message_queue_size = 16

[reconnect]
initial_delay_ms = 200
max_delay_ms = 5000
multiplier = 1.5
max_attempts = 8

[sync]
resync_on_gap = false
log_capacity = 50
event_capacity = 32

[worker]
in_process = true
init_timeout_secs = 5
request_timeout_secs = 60

[worker.runner]
target = "lobby"

[logging]
level = "debug"
json_format = true
"#,
    );

    let config = SyncConfig::load(Some(fixture.path())).unwrap();

    let connection = config.connection_config();
    assert_eq!(connection.connect_timeout, Duration::from_millis(2500));
    assert_eq!(connection.initial_reconnect_delay, Duration::from_millis(200));
    assert_eq!(connection.max_reconnect_delay, Duration::from_secs(5));
    assert_eq!(connection.multiplier, 1.5);
    assert_eq!(connection.max_reconnect_attempts, 8);
    assert_eq!(connection.message_queue_size, 16);

    let session = config.session_config();
    assert_eq!(session.capabilities, vec!["state.patch"]);
    assert!(!session.resync_on_gap);
    assert_eq!(session.log_capacity, 50);

    let supervisor = config.supervisor_config();
    assert_eq!(supervisor.init_timeout, Some(Duration::from_secs(5)));
    assert_eq!(supervisor.request_timeout, Some(Duration::from_secs(60)));
    assert_eq!(config.runner_config()["target"], "lobby");
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_invalid_client_url() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[client]
url = "https://example.com"
"#,
    );

    let err = SyncConfig::load(Some(fixture.path())).unwrap_err();
    assert!(matches!(err, Error::ConfigValidation { .. }));

    fixture
        .cmd()
        .args(["config", "validate", "--config", fixture.path()])
        .assert()
        .code(10)
        .stderr(predicate::str::contains("ws://"));
}

#[test]
fn test_max_delay_below_initial() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[reconnect]
initial_delay_ms = 5000
max_delay_ms = 1000
"#,
    );

    let err = SyncConfig::load(Some(fixture.path())).unwrap_err();
    assert!(matches!(
        err,
        Error::ConfigValidation { field: Some(ref f), .. } if f == "reconnect.max_delay_ms"
    ));
}

#[test]
fn test_invalid_log_level() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[logging]
level = "verbose"
"#,
    );

    fixture
        .cmd()
        .args(["config", "validate", "--config", fixture.path()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid log level"));
}

#[test]
fn test_malformed_toml() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[client
url = "wss://example.com"
"#,
    );

    let err = SyncConfig::load(Some(fixture.path())).unwrap_err();
    assert!(matches!(err, Error::ConfigParse { .. }));

    fixture
        .cmd()
        .args(["config", "validate", "--config", fixture.path()])
        .assert()
        .code(10);
}

// ─────────────────────────────────────────────────────────────────
// Discovery and Init Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_in_working_directory_is_found() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[client]
url = "wss://found.example.com/ws"
"#,
    );

    fixture
        .cmd()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("wss://found.example.com/ws"));
}

#[test]
fn test_init_config_refuses_overwrite() {
    let fixture = ConfigFixture::new();
    let path = fixture.temp_dir.path().join("nested").join("config.toml");
    let path_str = path.to_str().unwrap();

    let written = init_config(Some(path_str), false).unwrap();
    assert_eq!(written, path);
    assert!(SyncConfig::load(Some(path_str)).is_ok());

    assert!(init_config(Some(path_str), false).is_err());
    assert!(init_config(Some(path_str), true).is_ok());
}

// ─────────────────────────────────────────────────────────────────
// Override Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_env_override_beats_file() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[client]
url = "wss://file.example.com/ws"
"#,
    );

    fixture
        .cmd()
        .args(["config", "show", "--config", fixture.path()])
        .env("SYNCDECK_URL", "wss://env.example.com/ws")
        .env("SYNCDECK_RECONNECT_MAX_ATTEMPTS", "12")
        .assert()
        .success()
        .stdout(predicate::str::contains("wss://env.example.com/ws"))
        .stdout(predicate::str::contains("max_attempts = 12"));
}

#[test]
fn test_log_file_tilde_expansion() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[logging]
file = "~/logs/syncdeck.log"
"#,
    );

    let output = fixture
        .cmd()
        .args(["config", "show", "--config", fixture.path()])
        .assert()
        .success();

    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    assert!(stdout.contains("file = "));
    assert!(!stdout.contains("file = \"~"));
}
