//! Local IPC layer between the daemon and its front-end clients.
//!
//! Both ends talk over a Unix domain socket addressed by file path, using
//! the `interprocess` crate's tokio integration. Frames are encoded by
//! [`crate::protocol::codec`] and split by [`crate::protocol::framer`].

pub mod broadcast;
pub mod client;
pub mod events;
pub mod path;
pub mod router;
pub mod server;

use std::io;
use std::path::Path;

use interprocess::local_socket::tokio::{prelude::*, Listener, Stream};
use interprocess::local_socket::{GenericFilePath, ListenerOptions, ToFsName};

/// Open a connection to the socket at `path`.
///
/// # Errors
///
/// Returns the raw I/O error so callers can tell "not found" and
/// "connection refused" apart from other failures.
pub async fn dial(path: &Path) -> io::Result<Stream> {
    let name = path.to_fs_name::<GenericFilePath>()?;
    Stream::connect(name).await
}

/// Whether something is accepting connections at `path`.
pub async fn is_listening(path: &Path) -> bool {
    dial(path).await.is_ok()
}

/// Bind a listener at `path`.
///
/// # Errors
///
/// Returns the raw I/O error, e.g. `AddrInUse` when the file already exists.
pub fn listen(path: &Path) -> io::Result<Listener> {
    let name = path.to_fs_name::<GenericFilePath>()?;
    ListenerOptions::new().name(name).create_tokio()
}
