//! Socket and sidecar file locations for one daemon process.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::{AppError, Result};

/// File name of the socket inside a daemon directory.
pub const SOCKET_FILE: &str = "socket";
/// File name of the pid sidecar inside a daemon directory.
pub const PID_FILE: &str = "pid";
/// File name of the log sidecar inside a daemon directory.
pub const LOG_FILE: &str = "daemon.log";

/// Paths that identify one physical daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonHandle {
    /// Unix socket the daemon listens on.
    pub socket_path: PathBuf,
    /// Decimal pid of the daemon, used only for termination.
    pub pid_path: PathBuf,
    /// Size-rotated daemon log.
    pub log_path: PathBuf,
    /// `<socket>.lock`, held by a starting daemon from the liveness check
    /// until its pid is recorded and the socket bound.
    pub lock_path: PathBuf,
}

/// Exclusive startup lock; released on drop.
#[derive(Debug)]
pub struct StartupLock {
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl DaemonHandle {
    /// Directory layout: `<dir>/socket`, `<dir>/pid`, `<dir>/daemon.log`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            socket_path: dir.join(SOCKET_FILE),
            pid_path: dir.join(PID_FILE),
            log_path: dir.join(LOG_FILE),
            lock_path: with_suffix(&dir.join(SOCKET_FILE), ".lock"),
        }
    }

    /// Direct layout: the socket at `path`, sidecars `<path>.pid` and `<path>.log`.
    pub fn at_socket(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        Self {
            socket_path: path.to_path_buf(),
            pid_path: with_suffix(path, ".pid"),
            log_path: with_suffix(path, ".log"),
            lock_path: with_suffix(path, ".lock"),
        }
    }

    /// Create the directory holding the socket and sidecars.
    ///
    /// A plain file squatting on the directory path is removed first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be created.
    pub fn prepare_dir(&self) -> Result<()> {
        let Some(dir) = self.socket_path.parent() else {
            return Ok(());
        };
        if dir.as_os_str().is_empty() {
            return Ok(());
        }
        if dir.is_file() {
            fs::remove_file(dir).map_err(|err| {
                AppError::Io(format!("cannot remove file at {}: {err}", dir.display()))
            })?;
        }
        fs::create_dir_all(dir)
            .map_err(|err| AppError::Io(format!("cannot create {}: {err}", dir.display())))
    }

    /// Write `pid` to the pid sidecar.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be written.
    pub fn write_pid(&self, pid: u32) -> Result<()> {
        fs::write(&self.pid_path, pid.to_string()).map_err(|err| {
            AppError::Io(format!(
                "cannot write pid file {}: {err}",
                self.pid_path.display()
            ))
        })
    }

    /// Read the recorded pid; `None` when the file is missing or unreadable.
    #[must_use]
    pub fn read_pid(&self) -> Option<i32> {
        fs::read_to_string(&self.pid_path)
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .filter(|pid: &i32| *pid > 0)
    }

    /// Block until this process holds the startup lock.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the lock file cannot be opened or locked.
    pub fn lock_startup(&self) -> Result<StartupLock> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|err| {
                AppError::Io(format!(
                    "cannot open lock file {}: {err}",
                    self.lock_path.display()
                ))
            })?;

        #[cfg(unix)]
        {
            let lock = nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusive).map_err(
                |(_, errno)| {
                    AppError::Io(format!(
                        "cannot lock {}: {errno}",
                        self.lock_path.display()
                    ))
                },
            )?;
            Ok(StartupLock { _lock: lock })
        }

        #[cfg(not(unix))]
        {
            Ok(StartupLock { _file: file })
        }
    }

    /// Remove the socket and pid files, ignoring ones already gone.
    pub fn remove_runtime_files(&self) {
        for path in [&self.socket_path, &self.pid_path] {
            if let Err(err) = fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), %err, "failed to remove runtime file");
                }
            }
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
