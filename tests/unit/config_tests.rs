use std::path::Path;
use std::time::Duration;

use chat_bridge::config::{default_socket_dir, BridgeConfig, FailurePolicy};
use chat_bridge::AppError;

fn sample_toml() -> &'static str {
    r#"
socket_dir = "/tmp/bridge-test"
fire_and_forget_failures = "log"
retry_interval_ms = 250

[log]
level = "debug"
max_bytes = 1024
backups = 3

[daemon]
program = "/opt/bridge/chat-bridge"
args = ["--log-format", "json"]

[session]
user = "alice"
"#
}

#[test]
fn parses_full_config() {
    let config = BridgeConfig::from_toml_str(sample_toml()).expect("valid config");
    assert_eq!(config.socket_dir.as_deref(), Some(Path::new("/tmp/bridge-test")));
    assert_eq!(config.fire_and_forget_failures, FailurePolicy::Log);
    assert_eq!(config.retry_interval(), Duration::from_millis(250));
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.log.max_bytes, 1024);
    assert_eq!(config.log.backups, 3);
    assert_eq!(
        config.daemon.program.as_deref(),
        Some(Path::new("/opt/bridge/chat-bridge"))
    );
    assert_eq!(config.daemon.args, vec!["--log-format", "json"]);
    assert_eq!(config.session.user.as_deref(), Some("alice"));
}

#[test]
fn empty_config_uses_defaults() {
    let config = BridgeConfig::from_toml_str("").expect("defaults are valid");
    assert_eq!(config, BridgeConfig::default());
    assert_eq!(config.fire_and_forget_failures, FailurePolicy::Broadcast);
    assert_eq!(config.retry_interval(), Duration::from_secs(1));
    assert_eq!(config.log.max_bytes, 65_536);
    assert_eq!(config.log.backups, 1);
    assert_eq!(
        config.daemon_handle().socket_path,
        default_socket_dir().join("socket")
    );
}

#[test]
fn socket_dir_and_socket_path_are_exclusive() {
    let raw = r#"
socket_dir = "/tmp/a"
socket_path = "/tmp/b.sock"
"#;
    let err = BridgeConfig::from_toml_str(raw).unwrap_err();
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("mutually exclusive")));
}

#[test]
fn zero_retry_interval_is_rejected() {
    let err = BridgeConfig::from_toml_str("retry_interval_ms = 0").unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn zero_log_size_is_rejected() {
    let err = BridgeConfig::from_toml_str("[log]\nmax_bytes = 0").unwrap_err();
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("max_bytes")));
}

#[test]
fn unknown_failure_policy_is_rejected() {
    let err = BridgeConfig::from_toml_str(r#"fire_and_forget_failures = "ignore""#).unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn direct_socket_path_uses_suffixed_sidecars() {
    let config = BridgeConfig::from_toml_str(r#"socket_path = "/run/chat.sock""#).unwrap();
    let handle = config.daemon_handle();
    assert_eq!(handle.socket_path, Path::new("/run/chat.sock"));
    assert_eq!(handle.pid_path, Path::new("/run/chat.sock.pid"));
    assert_eq!(handle.log_path, Path::new("/run/chat.sock.log"));
}

#[test]
fn override_socket_replaces_configured_layout() {
    let mut config = BridgeConfig::from_toml_str(sample_toml()).unwrap();
    config.override_socket(None, Some("/tmp/direct.sock".into()));
    assert!(config.socket_dir.is_none());
    assert_eq!(
        config.daemon_handle().socket_path,
        Path::new("/tmp/direct.sock")
    );

    config.override_socket(None, None);
    assert_eq!(
        config.daemon_handle().socket_path,
        Path::new("/tmp/direct.sock"),
        "no override keeps the current layout"
    );
}

#[test]
fn load_from_missing_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = BridgeConfig::load_from_path(dir.path().join("missing.toml")).unwrap_err();
    assert!(matches!(err, AppError::Config(ref msg) if msg.starts_with("failed to read config")));
}

#[test]
fn load_or_default_reads_file_when_given() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.toml");
    std::fs::write(&path, sample_toml()).unwrap();

    let loaded = BridgeConfig::load_or_default(Some(&path)).unwrap();
    assert_eq!(loaded.session.user.as_deref(), Some("alice"));
    assert_eq!(
        BridgeConfig::load_or_default(None).unwrap(),
        BridgeConfig::default()
    );
}
