#![forbid(unsafe_code)]

//! Local bridge between short-lived front ends and a long-lived chat daemon.
//!
//! The daemon owns the session state and serves it over a Unix socket; front
//! ends call into it by verb path and receive pushed events.

pub mod config;
pub mod daemon;
pub mod errors;
pub mod ipc;
pub mod protocol;
pub mod session;

pub use config::BridgeConfig;
pub use errors::{AppError, Result};
