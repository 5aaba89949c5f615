#![forbid(unsafe_code)]

//! `chat-bridge`: long-lived daemon serving the chat session over a Unix socket.
//!
//! Usually launched by `chat-bridge-ctl start` (or any other supervisor)
//! with `--detach`, so it outlives the front end that spawned it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer, Registry};

use chat_bridge::daemon::layout::{DaemonHandle, StartupLock};
use chat_bridge::daemon::logfile::RotatingLogFile;
use chat_bridge::ipc::server::{watch_server, Server};
use chat_bridge::ipc::{self, broadcast::Broadcaster};
use chat_bridge::session::{LogControl, MemorySession};
use chat_bridge::{AppError, BridgeConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "chat-bridge", about = "Chat session daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding `socket`, `pid` and `daemon.log`.
    #[arg(long, conflicts_with = "socket")]
    socket_dir: Option<PathBuf>,

    /// Socket path; sidecars default to `<path>.pid` and `<path>.log`.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Override the pid file location.
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Override the log file location.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log to stderr instead of the rotating log file.
    #[arg(long)]
    log_stderr: bool,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Start a new session, detaching from the caller's terminal.
    #[arg(long)]
    detach: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let detach_result = args.detach.then(detach_session);

    let mut config = BridgeConfig::load_or_default(args.config.as_deref())?;
    config.override_socket(args.socket_dir.clone(), args.socket.clone());

    let mut handle = config.daemon_handle();
    if let Some(pid_file) = &args.pid_file {
        handle.pid_path.clone_from(pid_file);
    }
    if let Some(log_file) = &args.log_file {
        handle.log_path.clone_from(log_file);
    }
    handle.prepare_dir()?;

    let log_control = init_tracing(&args, &config, &handle)?;
    if let Some(Err(err)) = detach_result {
        warn!(%err, "could not start a new session; continuing attached");
    }
    info!(socket = %handle.socket_path.display(), pid = std::process::id(), "chat-bridge bootstrap");

    let startup = handle.lock_startup()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Daemon(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(config, handle, log_control, startup))
}

async fn run(
    config: BridgeConfig,
    handle: DaemonHandle,
    log_control: LogControl,
    startup: StartupLock,
) -> Result<()> {
    let socket = handle.socket_path.clone();

    // ── Claim the socket ────────────────────────────────
    if ipc::is_listening(&socket).await {
        return Err(AppError::Daemon(format!(
            "a daemon is already listening on {}",
            socket.display()
        )));
    }
    if socket.exists() {
        std::fs::remove_file(&socket).map_err(|err| {
            AppError::Io(format!("cannot remove stale socket {}: {err}", socket.display()))
        })?;
        info!(socket = %socket.display(), "removed stale socket");
    }
    handle.write_pid(std::process::id())?;

    // ── Build the session and serve it ──────────────────
    let broadcaster = Broadcaster::new();
    let mut session = MemorySession::new(broadcaster.clone()).with_log_control(log_control);
    if let Some(user) = &config.session.user {
        session = session.with_user(user.clone());
    }

    let ct = CancellationToken::new();
    let server = Server::new(MemorySession::router(), Arc::new(session), broadcaster.clone())
        .with_failure_policy(config.fire_and_forget_failures);
    let server_handle = match server.spawn(&socket, ct.clone()) {
        Ok(server_handle) => server_handle,
        Err(err) => {
            if let Err(io_err) = std::fs::remove_file(&handle.pid_path) {
                warn!(%io_err, "failed to remove pid file");
            }
            return Err(err);
        }
    };
    drop(startup);
    info!("chat-bridge daemon ready");

    // ── Wait for shutdown or a server fault ─────────────
    let watcher = watch_server(server_handle, broadcaster);
    tokio::pin!(watcher);
    let server_finished = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            false
        }
        failure = &mut watcher => {
            if failure.is_none() {
                warn!("server task stopped unexpectedly");
            }
            true
        }
    };

    ct.cancel();
    if !server_finished {
        if let Some(failure) = watcher.await {
            error!(error = %failure, "server task failed during shutdown");
        }
    }

    handle.remove_runtime_files();
    info!("chat-bridge shut down");
    Ok(())
}

#[cfg(unix)]
fn detach_session() -> std::result::Result<(), String> {
    nix::unistd::setsid()
        .map(|_| ())
        .map_err(|err| err.to_string())
}

#[cfg(not(unix))]
fn detach_session() -> std::result::Result<(), String> {
    Err("session detach is only supported on unix".into())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

/// Install the global subscriber and return a hook that swaps its filter.
fn init_tracing(args: &Cli, config: &BridgeConfig, handle: &DaemonHandle) -> Result<LogControl> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))
        .map_err(|err| AppError::Config(format!("invalid log level: {err}")))?;

    let log_file = if args.log_stderr {
        None
    } else {
        Some(RotatingLogFile::open(
            &handle.log_path,
            config.log.max_bytes,
            config.log.backups,
        )?)
    };

    let output: Box<dyn Layer<Registry> + Send + Sync> = match (args.log_format, log_file) {
        (LogFormat::Text, Some(file)) => fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .boxed(),
        (LogFormat::Json, Some(file)) => fmt::layer().json().with_writer(Mutex::new(file)).boxed(),
        (LogFormat::Text, None) => fmt::layer().with_writer(std::io::stderr).boxed(),
        (LogFormat::Json, None) => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };

    let (filter, reload_handle) = reload::Layer::new(env_filter);
    tracing_subscriber::registry()
        .with(output.with_filter(filter))
        .try_init()
        .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?;

    Ok(Arc::new(move |level: &str| match EnvFilter::try_new(level) {
        Ok(filter) => reload_handle.reload(filter).is_ok(),
        Err(_) => false,
    }))
}
