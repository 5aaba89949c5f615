//! Daemon discovery, launch, connection retry and termination.
//!
//! "Something accepts connections on the socket" is the only liveness
//! signal. The pid file is consulted solely by [`Supervisor::terminate`].

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::daemon::layout::DaemonHandle;
use crate::ipc::{self, client::Client};
use crate::{AppError, Result};

/// Default daemon executable name.
pub const DAEMON_PROGRAM: &str = "chat-bridge";

/// Launches and reaches the daemon bound to one [`DaemonHandle`].
#[derive(Debug, Clone)]
pub struct Supervisor {
    handle: DaemonHandle,
    program: PathBuf,
    args: Vec<String>,
    config_path: Option<PathBuf>,
    retry_interval: Duration,
}

impl Supervisor {
    /// Supervisor for `handle` launching `program`, retrying every second.
    pub fn new(handle: DaemonHandle, program: impl Into<PathBuf>) -> Self {
        Self {
            handle,
            program: program.into(),
            args: Vec::new(),
            config_path: None,
            retry_interval: Duration::from_secs(1),
        }
    }

    /// Supervisor described by `config`.
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        let program = config
            .daemon
            .program
            .clone()
            .unwrap_or_else(default_program);
        Self::new(config.daemon_handle(), program)
            .with_args(config.daemon.args.clone())
            .with_retry_interval(config.retry_interval())
    }

    /// Extra arguments passed ahead of the socket arguments.
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Configuration file handed to the spawned daemon with `--config`.
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Delay between connection attempts.
    #[must_use]
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Socket and sidecar paths.
    #[must_use]
    pub fn handle(&self) -> &DaemonHandle {
        &self.handle
    }

    /// Whether a daemon is accepting connections on the socket.
    pub async fn is_running(&self) -> bool {
        ipc::is_listening(&self.handle.socket_path).await
    }

    /// Start a daemon unless one is already listening.
    ///
    /// The child runs in its own session (`--detach`) and outlives the
    /// caller. It records its own pid while holding the startup lock, so
    /// when two callers race only the daemon that wins the socket writes
    /// the pid file. Returns `true` when a process was spawned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Daemon` if the process cannot be spawned, or
    /// `AppError::Io` if the runtime directory cannot be created.
    pub async fn ensure_daemon(&self) -> Result<bool> {
        if self.is_running().await {
            debug!(socket = %self.handle.socket_path.display(), "daemon already listening");
            return Ok(false);
        }

        self.handle.prepare_dir()?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(config_path) = &self.config_path {
            cmd.arg("--config").arg(config_path);
        }
        cmd.arg("--socket")
            .arg(&self.handle.socket_path)
            .arg("--pid-file")
            .arg(&self.handle.pid_path)
            .arg("--log-file")
            .arg(&self.handle.log_path)
            .arg("--detach")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);

        let child = cmd.spawn().map_err(|err| {
            AppError::Daemon(format!(
                "failed to spawn {}: {err}",
                self.program.display()
            ))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| AppError::Daemon("daemon exited immediately after spawn".into()))?;
        info!(pid, socket = %self.handle.socket_path.display(), "daemon spawned");

        // Reap the child in the background so it never lingers as a zombie
        // while this process keeps running.
        tokio::spawn(async move {
            let mut child = child;
            match child.wait().await {
                Ok(status) => debug!(pid, %status, "daemon process exited"),
                Err(err) => debug!(pid, %err, "failed to wait for daemon process"),
            }
        });

        Ok(true)
    }

    /// Connect to the daemon, retrying forever while it starts.
    ///
    /// "Not found" and "connection refused" are expected during startup and
    /// are retried every `retry_interval`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` for any other connection failure.
    pub async fn connect(&self) -> Result<Client> {
        let path = &self.handle.socket_path;
        let mut attempts: u64 = 0;
        loop {
            attempts += 1;
            match ipc::dial(path).await {
                Ok(stream) => {
                    debug!(attempts, socket = %path.display(), "connected to daemon");
                    return Ok(Client::from_stream(stream));
                }
                Err(err) if is_transient(&err) => {
                    debug!(attempts, %err, "daemon not reachable yet; retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(err) => {
                    return Err(AppError::Transport(format!(
                        "failed to connect to {}: {err}",
                        path.display()
                    )));
                }
            }
        }
    }

    /// [`Supervisor::ensure_daemon`] followed by [`Supervisor::connect`].
    ///
    /// # Errors
    ///
    /// Propagates failures from either step.
    pub async fn ensure_and_connect(&self) -> Result<Client> {
        self.ensure_daemon().await?;
        self.connect().await
    }

    /// Send SIGTERM to the process recorded in the pid file.
    ///
    /// A missing or unreadable pid file, or a pid that no longer exists,
    /// means the daemon is already stopped: returns `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Daemon` if the signal cannot be delivered for any
    /// other reason.
    #[cfg(unix)]
    pub fn terminate(&self) -> Result<bool> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.handle.read_pid() else {
            debug!(pid_file = %self.handle.pid_path.display(), "no pid file; daemon already stopped");
            return Ok(false);
        };

        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                info!(pid, "sent SIGTERM to daemon");
                Ok(true)
            }
            Err(Errno::ESRCH) => {
                debug!(pid, "daemon process already gone");
                if let Err(err) = std::fs::remove_file(&self.handle.pid_path) {
                    warn!(%err, "failed to remove stale pid file");
                }
                Ok(false)
            }
            Err(err) => Err(AppError::Daemon(format!(
                "failed to signal daemon pid {pid}: {err}"
            ))),
        }
    }

    /// Terminating by pid requires Unix signals.
    ///
    /// # Errors
    ///
    /// Always returns `AppError::Daemon` on this platform.
    #[cfg(not(unix))]
    pub fn terminate(&self) -> Result<bool> {
        Err(AppError::Daemon(
            "terminating the daemon is only supported on unix".into(),
        ))
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
    )
}

/// `chat-bridge` next to the running executable, or on `PATH` as fallback.
fn default_program() -> PathBuf {
    let name = format!("{DAEMON_PROGRAM}{}", std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(name))
}
