//! Bridge configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::daemon::layout::DaemonHandle;
use crate::{AppError, Result};

/// What the daemon does when a fire-and-forget call fails.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Push an `error` event to every connected client and log it.
    #[default]
    Broadcast,
    /// Only log the failure.
    Log,
}

/// Daemon log file settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LogConfig {
    /// Initial `tracing` filter directive for the daemon.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Size at which `daemon.log` is rotated.
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,
    /// Number of rotated files kept.
    #[serde(default = "default_log_backups")]
    pub backups: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_bytes: default_log_max_bytes(),
            backups: default_log_backups(),
        }
    }
}

/// How the supervisor launches the daemon.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub struct DaemonConfig {
    /// Daemon executable; defaults to `chat-bridge` beside the current binary.
    #[serde(default)]
    pub program: Option<PathBuf>,
    /// Extra arguments placed before the socket arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Presets for the in-process session served by the daemon binary.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// User logged in at startup.
    #[serde(default)]
    pub user: Option<String>,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_max_bytes() -> u64 {
    65_536
}

fn default_log_backups() -> u32 {
    1
}

fn default_retry_interval_ms() -> u64 {
    1_000
}

/// Default socket directory: `<tmp>/chat_bridge`.
#[must_use]
pub fn default_socket_dir() -> PathBuf {
    std::env::temp_dir().join("chat_bridge")
}

/// Bridge configuration parsed from TOML.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Directory holding `socket`, `pid` and `daemon.log`.
    #[serde(default)]
    pub socket_dir: Option<PathBuf>,
    /// Direct socket path; sidecars become `<path>.pid` and `<path>.log`.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    /// Handling of failed fire-and-forget calls.
    #[serde(default)]
    pub fire_and_forget_failures: FailurePolicy,
    /// Delay between connection attempts while the daemon starts.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Daemon log settings.
    #[serde(default)]
    pub log: LogConfig,
    /// Daemon launch settings.
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// In-process session presets.
    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_dir: None,
            socket_path: None,
            fire_and_forget_failures: FailurePolicy::default(),
            retry_interval_ms: default_retry_interval_ms(),
            log: LogConfig::default(),
            daemon: DaemonConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise use defaults.
    ///
    /// # Errors
    ///
    /// Propagates [`BridgeConfig::load_from_path`] failures.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load_from_path)
    }

    /// Replace the socket location, clearing whichever layout was configured.
    pub fn override_socket(&mut self, socket_dir: Option<PathBuf>, socket_path: Option<PathBuf>) {
        if socket_dir.is_some() || socket_path.is_some() {
            self.socket_dir = socket_dir;
            self.socket_path = socket_path;
        }
    }

    /// Socket and sidecar paths for the configured layout.
    #[must_use]
    pub fn daemon_handle(&self) -> DaemonHandle {
        match (&self.socket_path, &self.socket_dir) {
            (Some(path), _) => DaemonHandle::at_socket(path),
            (None, Some(dir)) => DaemonHandle::in_dir(dir),
            (None, None) => DaemonHandle::in_dir(default_socket_dir()),
        }
    }

    /// Connect retry interval.
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.socket_dir.is_some() && self.socket_path.is_some() {
            return Err(AppError::Config(
                "socket_dir and socket_path are mutually exclusive".into(),
            ));
        }

        if self.retry_interval_ms == 0 {
            return Err(AppError::Config(
                "retry_interval_ms must be greater than zero".into(),
            ));
        }

        if self.log.max_bytes == 0 {
            return Err(AppError::Config(
                "log.max_bytes must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
