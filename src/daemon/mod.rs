//! Daemon process management: socket layout, supervisor, log file.

pub mod layout;
pub mod logfile;
pub mod supervisor;
