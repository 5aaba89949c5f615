#![forbid(unsafe_code)]

//! `chat-bridge-ctl`: short-lived front end for the `chat-bridge` daemon.
//!
//! Starts the daemon on demand, issues calls against its session, streams
//! its events, and stops it again.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use chat_bridge::daemon::supervisor::Supervisor;
use chat_bridge::ipc::client::Client;
use chat_bridge::protocol::{CallArgs, Event};
use chat_bridge::{AppError, BridgeConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "chat-bridge-ctl",
    about = "Front-end CLI for the chat-bridge daemon",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the daemon's `socket`, `pid` and `daemon.log`.
    #[arg(long, conflicts_with = "socket")]
    socket_dir: Option<PathBuf>,

    /// Daemon socket path.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Diagnostic output format on stderr (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the daemon if needed and wait until it accepts connections.
    Start,

    /// Call a verb and print its result.
    Request {
        /// Verb path, e.g. `session.user`.
        verb: String,
        /// Positional arguments; values that are not JSON are sent as strings.
        args: Vec<String>,
        /// Keyword arguments as a JSON object.
        #[arg(long)]
        kwargs: Option<String>,
    },

    /// Send a verb without waiting for a result.
    Fire {
        /// Verb path, e.g. `session.connect`.
        verb: String,
        /// Positional arguments; values that are not JSON are sent as strings.
        args: Vec<String>,
        /// Keyword arguments as a JSON object.
        #[arg(long)]
        kwargs: Option<String>,
    },

    /// Print events as JSON lines until the daemon disconnects.
    Listen {
        /// Event names to print; all events when omitted.
        events: Vec<String>,
    },

    /// Stop the daemon recorded in the pid file.
    Stop,
}

fn main() {
    let args = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    match args.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    let outcome = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Daemon(format!("failed to build tokio runtime: {err}")))
        .and_then(|runtime| runtime.block_on(run(args)));

    if let Err(err) = outcome {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> Result<()> {
    let mut config = BridgeConfig::load_or_default(args.config.as_deref())?;
    config.override_socket(args.socket_dir, args.socket);
    let mut supervisor = Supervisor::from_config(&config);
    if let Some(path) = &args.config {
        supervisor = supervisor.with_config_path(path);
    }

    match args.command {
        Command::Start => {
            let spawned = supervisor.ensure_daemon().await?;
            let client = supervisor.connect().await?;
            shutdown(&client).await;
            print_json(&json!({
                "spawned": spawned,
                "socket": supervisor.handle().socket_path,
            }))
        }
        Command::Request { verb, args, kwargs } => {
            let call_args = parse_call_args(&args, kwargs.as_deref())?;
            let client = supervisor.ensure_and_connect().await?;
            let outcome = client.request(&verb, call_args).await;
            shutdown(&client).await;
            print_json(&outcome?)
        }
        Command::Fire { verb, args, kwargs } => {
            let call_args = parse_call_args(&args, kwargs.as_deref())?;
            let client = supervisor.ensure_and_connect().await?;
            let outcome = client.fire_and_forget(&verb, call_args).await;
            shutdown(&client).await;
            outcome
        }
        Command::Listen { events } => {
            let client = supervisor.ensure_and_connect().await?;
            let _subscriptions: Vec<_> = if events.is_empty() {
                vec![client.on_any(print_event)]
            } else {
                events
                    .iter()
                    .map(|name| client.on(name, print_event))
                    .collect()
            };
            tokio::select! {
                () = client.closed() => {}
                _ = tokio::signal::ctrl_c() => shutdown(&client).await,
            }
            Ok(())
        }
        Command::Stop => {
            let stopped = supervisor.terminate()?;
            print_json(&json!({ "stopped": stopped }))
        }
    }
}

async fn shutdown(client: &Client) {
    client.close();
    client.closed().await;
}

fn print_event(event: Event) -> std::future::Ready<Result<()>> {
    let line = json!({ "event": event.name, "payload": event.payload });
    println!("{line}");
    std::future::ready(Ok(()))
}

fn print_json(value: &Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::Decode(format!("cannot render result: {err}")))?;
    println!("{text}");
    Ok(())
}

/// Build call arguments from command-line words.
fn parse_call_args(args: &[String], kwargs: Option<&str>) -> Result<CallArgs> {
    let mut call_args = CallArgs::new();
    for raw in args {
        call_args = call_args.arg(parse_word(raw));
    }

    if let Some(raw) = kwargs {
        let Value::Object(map) = serde_json::from_str::<Value>(raw)
            .map_err(|err| AppError::Config(format!("--kwargs is not valid JSON: {err}")))?
        else {
            return Err(AppError::Config("--kwargs must be a JSON object".into()));
        };
        call_args.kwargs = map;
    }

    Ok(call_args)
}

fn parse_word(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}
