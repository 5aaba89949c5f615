//! Error types shared across the bridge.

use std::fmt::{Display, Formatter};

use crate::protocol::RemoteError;

/// Shared bridge result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Bridge error enumeration covering every failure mode of the local protocol.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Socket missing, refused, or otherwise unreachable.
    Transport(String),
    /// A single frame could not be decoded.
    Decode(String),
    /// The daemon executed the call and it failed (includes unroutable verbs).
    Remote(RemoteError),
    /// The connection dropped before the call could complete.
    ConnectionLost(String),
    /// Daemon process spawn or termination failure.
    Daemon(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Remote failure carried by this error, if the daemon produced one.
    #[must_use]
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Decode(msg) => write!(f, "decode: {msg}"),
            Self::Remote(err) => write!(f, "remote: {err}"),
            Self::ConnectionLost(msg) => write!(f, "connection lost: {msg}"),
            Self::Daemon(msg) => write!(f, "daemon: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<RemoteError> for AppError {
    fn from(err: RemoteError) -> Self {
        Self::Remote(err)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
