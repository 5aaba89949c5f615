//! Publish/subscribe registry for events received by a client.
//!
//! Handlers are keyed by event name. Each subscription owns a queue drained
//! by its own task: one handler sees events in the order they were
//! dispatched, while a slow, failing or panicking handler cannot stop the
//! others or stall the client's read loop.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::protocol::Event;
use crate::Result;

/// Dispatched locally with `[message]` when an incoming frame is unusable.
pub const PROTOCOL_ERROR_EVENT: &str = "protocol_error";

/// Dispatched locally once when the connection to the daemon is lost.
pub const DISCONNECTED_EVENT: &str = "disconnected";

/// Registry key matching every event name.
const ANY_EVENT: &str = "*";

type SubscriptionId = u64;
type HandlerFn = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type HandlerMap = HashMap<String, Vec<HandlerEntry>>;

struct HandlerEntry {
    id: SubscriptionId,
    queue: mpsc::UnboundedSender<Event>,
    /// Handler and queue receiver until the first dispatch starts the worker.
    idle: Mutex<Option<(HandlerFn, mpsc::UnboundedReceiver<Event>)>>,
}

impl HandlerEntry {
    fn new(id: SubscriptionId, handler: HandlerFn) -> Self {
        let (queue, events) = mpsc::unbounded_channel();
        Self {
            id,
            queue,
            idle: Mutex::new(Some((handler, events))),
        }
    }

    /// Queue `event`, starting the worker task on first use.
    fn deliver(&self, key: &str, event: Event) -> bool {
        if self.queue.send(event).is_err() {
            return false;
        }
        let idle = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((handler, events)) = idle {
            tokio::spawn(run_handler(key.to_owned(), self.id, handler, events));
        }
        true
    }
}

/// Event name to handler mapping. Clones share the same registry.
#[derive(Clone, Default)]
pub struct EventRegistry {
    handlers: Arc<RwLock<HandlerMap>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<&str, usize> = handlers
            .iter()
            .map(|(name, list)| (name.as_str(), list.len()))
            .collect();
        f.debug_struct("EventRegistry")
            .field("handlers", &counts)
            .finish()
    }
}

impl EventRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to events named `name`.
    pub fn subscribe<F, Fut>(&self, name: &str, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: HandlerFn = Arc::new(move |event: Event| handler(event).boxed());
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_owned())
            .or_default()
            .push(HandlerEntry::new(id, handler));
        debug!(event = name, subscription = id, "handler subscribed");

        Subscription {
            registry: self.clone(),
            name: name.to_owned(),
            id,
        }
    }

    /// Subscribe `handler` to every event, local pseudo-events included.
    pub fn subscribe_any<F, Fut>(&self, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(ANY_EVENT, handler)
    }

    /// Number of handlers subscribed to exactly `name`.
    #[must_use]
    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map_or(0, Vec::len)
    }

    /// Queue the event for every handler of `name` and every catch-all
    /// handler. Returns how many handlers it was queued for.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, name: &str, payload: Vec<Value>) -> usize {
        let keys: &[&str] = if name == ANY_EVENT {
            &[ANY_EVENT]
        } else {
            &[name, ANY_EVENT]
        };

        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut queued = 0;
        for key in keys {
            for entry in handlers.get(*key).into_iter().flatten() {
                if entry.deliver(key, Event::new(name, payload.clone())) {
                    queued += 1;
                }
            }
        }

        if queued == 0 {
            debug!(event = name, "no handler for event");
        }
        queued
    }

    fn remove(&self, name: &str, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|entry| entry.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(name);
        }
        removed
    }
}

/// Run one subscription's handler over its queue, one event at a time.
async fn run_handler(
    key: String,
    id: SubscriptionId,
    handler: HandlerFn,
    mut events: mpsc::UnboundedReceiver<Event>,
) {
    while let Some(event) = events.recv().await {
        let name = event.name.clone();
        let handler = Arc::clone(&handler);
        match AssertUnwindSafe(async move { handler(event).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(event = %name, %err, "event handler failed"),
            Err(_) => error!(event = %name, "event handler panicked"),
        }
    }
    debug!(event = %key, subscription = id, "handler worker stopped");
}

/// Handle returned by a subscription; dropping it keeps the handler active.
#[derive(Debug)]
#[must_use = "keep the subscription to be able to unsubscribe later"]
pub struct Subscription {
    registry: EventRegistry,
    name: String,
    id: SubscriptionId,
}

impl Subscription {
    /// Event name this subscription listens to (`*` for catch-all).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the handler. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let removed = self.registry.remove(&self.name, self.id);
        if removed {
            debug!(event = %self.name, subscription = self.id, "handler unsubscribed");
        }
        removed
    }
}
