//! Front-end side endpoint.
//!
//! A [`Client`] owns one connection to the daemon. Two background tasks
//! serve it: a writer draining an outbound queue onto the socket, and a
//! reader that resolves pending calls by id and hands events to the
//! [`EventRegistry`].
//!
//! When the connection goes away, for whatever reason, every pending call
//! fails with [`AppError::ConnectionLost`], the local `disconnected` event
//! fires once, and later calls fail immediately.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use interprocess::local_socket::tokio::{prelude::*, Stream};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ipc::events::{EventRegistry, Subscription, DISCONNECTED_EVENT, PROTOCOL_ERROR_EVENT};
use crate::protocol::codec::encode_frame;
use crate::protocol::framer::FrameCodec;
use crate::protocol::{CallArgs, Frame, Payload, Request, RequestId, Response, FIRE_AND_FORGET};
use crate::{AppError, Result};

/// Outbound queue depth.
const OUTBOUND_CAPACITY: usize = 64;

#[derive(Default)]
struct PendingCalls {
    calls: HashMap<RequestId, oneshot::Sender<Payload>>,
    /// Set once the connection is gone; new calls are refused.
    lost: Option<String>,
}

struct Shared {
    pending: Mutex<PendingCalls>,
    events: EventRegistry,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingCalls> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, response: Response) {
        let Some(waiter) = self.pending().calls.remove(&response.id) else {
            warn!(id = response.id, "response for unknown request id");
            return;
        };
        if waiter.send(response.payload).is_err() {
            debug!(id = response.id, "caller stopped waiting for response");
        }
    }

    /// Record the loss and fail every outstanding call.
    fn mark_lost(&self, reason: &str) -> usize {
        let mut pending = self.pending();
        pending.lost.get_or_insert_with(|| reason.to_owned());
        let failed = pending.calls.len();
        pending.calls.clear();
        failed
    }

    fn lost_error(&self) -> AppError {
        let reason = self
            .pending()
            .lost
            .clone()
            .unwrap_or_else(|| "connection closed".to_owned());
        AppError::ConnectionLost(reason)
    }
}

struct Inner {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Vec<u8>>,
    /// Next request id. Held while a frame is queued so ids reach the wire
    /// in increasing order.
    next_id: AsyncMutex<RequestId>,
    shutdown: CancellationToken,
    /// Cancelled by the writer once it has flushed and released the socket.
    flushed: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Connection to a running daemon. Clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("closed", &self.is_closed())
            .field("events", &self.inner.shared.events)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect to the daemon socket at `path`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if nothing accepts connections there.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = super::dial(path).await.map_err(|err| {
            AppError::Transport(format!("failed to connect to {}: {err}", path.display()))
        })?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected socket.
    #[must_use]
    pub fn from_stream(stream: Stream) -> Self {
        let (recv, send) = stream.split();
        Self::from_io(recv, send)
    }

    /// Run the endpoint over any byte stream pair.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_io<R, W>(recv: R, send: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingCalls::default()),
            events: EventRegistry::new(),
        });
        let shutdown = CancellationToken::new();
        let flushed = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        tokio::spawn(run_writer(
            send,
            outbound_rx,
            shutdown.clone(),
            flushed.clone(),
        ));
        tokio::spawn(run_reader(recv, Arc::clone(&shared), shutdown.clone()));

        Self {
            inner: Arc::new(Inner {
                shared,
                outbound,
                next_id: AsyncMutex::new(1),
                shutdown,
                flushed,
            }),
        }
    }

    /// Call `verb` and wait for its result.
    ///
    /// # Errors
    ///
    /// - `AppError::Remote` when the daemon answered with an error sentinel,
    ///   including unroutable verbs.
    /// - `AppError::ConnectionLost` when the connection is gone before or
    ///   while waiting.
    /// - `AppError::Decode` if the request cannot be encoded.
    pub async fn request(&self, verb: impl AsRef<str>, args: CallArgs) -> Result<Value> {
        if self.inner.shutdown.is_cancelled() {
            return Err(self.inner.shared.lost_error());
        }

        let (waiter, result) = oneshot::channel();
        {
            let mut next_id = self.inner.next_id.lock().await;
            let id = *next_id;
            *next_id += 1;
            let bytes = encode_frame(&Frame::Request(Request {
                id,
                verb: verb.as_ref().to_owned(),
                args,
            }))?;

            {
                let mut pending = self.inner.shared.pending();
                if let Some(reason) = &pending.lost {
                    return Err(AppError::ConnectionLost(reason.clone()));
                }
                pending.calls.insert(id, waiter);
            }

            if self.inner.outbound.send(bytes).await.is_err() {
                self.inner.shared.pending().calls.remove(&id);
                return Err(self.inner.shared.lost_error());
            }
        }

        match result.await {
            Ok(payload) => payload.into_result().map_err(AppError::Remote),
            Err(_) => Err(self.inner.shared.lost_error()),
        }
    }

    /// Like [`Client::request`], deserializing the result into `T`.
    ///
    /// # Errors
    ///
    /// As [`Client::request`], plus `AppError::Decode` when the result does
    /// not have the shape of `T`.
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        verb: impl AsRef<str>,
        args: CallArgs,
    ) -> Result<T> {
        let value = self.request(verb, args).await?;
        serde_json::from_value(value)
            .map_err(|err| AppError::Decode(format!("unexpected result shape: {err}")))
    }

    /// Send `verb` without waiting for, or ever receiving, a result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConnectionLost` once the connection is gone.
    pub async fn fire_and_forget(&self, verb: impl AsRef<str>, args: CallArgs) -> Result<()> {
        if self.is_closed() {
            return Err(self.inner.shared.lost_error());
        }

        let bytes = encode_frame(&Frame::Request(Request {
            id: FIRE_AND_FORGET,
            verb: verb.as_ref().to_owned(),
            args,
        }))?;

        let _order = self.inner.next_id.lock().await;
        self.inner
            .outbound
            .send(bytes)
            .await
            .map_err(|_| self.inner.shared.lost_error())
    }

    /// Subscribe `handler` to events named `name`.
    pub fn on<F, Fut>(&self, name: &str, handler: F) -> Subscription
    where
        F: Fn(crate::protocol::Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.shared.events.subscribe(name, handler)
    }

    /// Subscribe `handler` to every event.
    pub fn on_any<F, Fut>(&self, handler: F) -> Subscription
    where
        F: Fn(crate::protocol::Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.shared.events.subscribe_any(handler)
    }

    /// Registry backing [`Client::on`].
    #[must_use]
    pub fn events(&self) -> &EventRegistry {
        &self.inner.shared.events
    }

    /// Close the connection. Pending calls fail with `ConnectionLost`;
    /// frames already queued are still written.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    /// Whether the connection is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled() || self.inner.shared.pending().lost.is_some()
    }

    /// Wait until the connection is gone and queued frames are flushed.
    pub async fn closed(&self) {
        self.inner.flushed.cancelled().await;
    }
}

async fn run_writer<W>(
    mut send: W,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    shutdown: CancellationToken,
    flushed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut healthy = true;
    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => break,

            bytes = outbound.recv() => {
                let Some(bytes) = bytes else { break };
                if let Err(err) = send.write_all(&bytes).await {
                    warn!(%err, "write to daemon failed");
                    healthy = false;
                    shutdown.cancel();
                    break;
                }
            }
        }
    }

    if healthy {
        outbound.close();
        while let Ok(bytes) = outbound.try_recv() {
            if let Err(err) = send.write_all(&bytes).await {
                debug!(%err, "dropping queued frames after write failure");
                break;
            }
        }
        if let Err(err) = send.shutdown().await {
            debug!(%err, "socket shutdown failed");
        }
    }
    flushed.cancel();
}

async fn run_reader<R>(recv: R, shared: Arc<Shared>, shutdown: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(recv, FrameCodec::new());

    let reason = loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => break "connection closed by client".to_owned(),

            item = framed.next() => match item {
                None => break "daemon closed the connection".to_owned(),
                Some(Err(err)) => break format!("read failed: {err}"),
                Some(Ok(Err(err))) => {
                    warn!(%err, "discarding undecodable frame");
                    shared
                        .events
                        .dispatch(PROTOCOL_ERROR_EVENT, vec![Value::String(err.to_string())]);
                }
                Some(Ok(Ok(Frame::Response(response)))) => shared.resolve(response),
                Some(Ok(Ok(Frame::Event(event)))) => {
                    shared.events.dispatch(&event.name, event.payload);
                }
                Some(Ok(Ok(Frame::Request(request)))) => {
                    warn!(id = request.id, verb = %request.verb, "daemon sent a request frame");
                    shared.events.dispatch(
                        PROTOCOL_ERROR_EVENT,
                        vec![Value::String(format!("unexpected request frame '{}'", request.verb))],
                    );
                }
            },
        }
    };

    let failed = shared.mark_lost(&reason);
    shutdown.cancel();
    debug!(reason = %reason, failed, "connection lost");
    shared
        .events
        .dispatch(DISCONNECTED_EVENT, vec![Value::String(reason)]);
}
