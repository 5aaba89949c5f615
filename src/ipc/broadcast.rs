//! Fan-out of daemon events to every live client connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{Event, Frame, RemoteError, ERROR_EVENT};

/// Identifier of one accepted connection.
pub type ConnectionId = u64;

/// Registry of outbound queues, one per connected client.
///
/// Cheap to clone; all clones share the same set. The backend keeps a clone
/// to push events whenever it likes.
#[derive(Debug, Clone, Default)]
pub struct Broadcaster {
    connections: Arc<Mutex<HashMap<ConnectionId, mpsc::Sender<Frame>>>>,
    next_id: Arc<AtomicU64>,
}

impl Broadcaster {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection's outbound queue.
    pub fn register(&self, outbound: mpsc::Sender<Frame>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, outbound);
        debug!(connection = id, "connection registered");
        id
    }

    /// Stop tracking a connection.
    pub fn unregister(&self, id: ConnectionId) {
        if self.lock().remove(&id).is_some() {
            debug!(connection = id, "connection unregistered");
        }
    }

    /// Number of tracked connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// Push `Event{name, payload}` to every live connection.
    ///
    /// Connections whose queue is closed are pruned; a full queue drops the
    /// event for that client only. Returns the number of clients reached.
    pub fn emit(&self, name: &str, payload: Vec<Value>) -> usize {
        let frame = Frame::Event(Event::new(name, payload));
        let mut connections = self.lock();
        let mut closed = Vec::new();
        let mut delivered = 0;

        for (id, outbound) in connections.iter() {
            match outbound.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(connection = id, event = name, "client queue full; event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            connections.remove(&id);
            debug!(connection = id, "pruned closed connection during broadcast");
        }

        delivered
    }

    /// Broadcast an `error` event carrying `err`.
    pub fn emit_error(&self, err: &RemoteError) -> usize {
        let payload = serde_json::to_value(err).unwrap_or_else(|_| Value::String(err.to_string()));
        self.emit(ERROR_EVENT, vec![payload])
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, mpsc::Sender<Frame>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
