//! Daemon-side endpoint.
//!
//! Listens on a Unix domain socket and serves any number of concurrent
//! clients. Each accepted connection gets a reader loop that frames incoming
//! bytes and a writer task that owns the send half. Requests run as their
//! own tasks, so a slow operation suspends only itself.
//!
//! ## Per-connection lifecycle
//!
//! ```text
//! Connected --(request frame)--> Dispatching --(response queued)--> Connected
//!     \
//!      `--(eof / read error)--> Closed
//! ```
//!
//! Responses and broadcast events share one outbound queue per connection,
//! so the writer is the only place that touches the socket.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use interprocess::local_socket::tokio::{prelude::*, RecvHalf, SendHalf, Stream};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::FailurePolicy;
use crate::ipc::broadcast::{Broadcaster, ConnectionId};
use crate::ipc::router::Router;
use crate::protocol::codec::encode_frame;
use crate::protocol::framer::FrameCodec;
use crate::protocol::{Frame, Payload, RemoteError, Request, Response, FIRE_AND_FORGET};
use crate::{AppError, Result};

/// Outbound queue depth per connection.
const OUTBOUND_CAPACITY: usize = 256;

/// Time given to connection writers to flush a server failure broadcast.
const FAILURE_FLUSH_GRACE: Duration = Duration::from_millis(200);

/// Server endpoint over a shared state object `S`.
pub struct Server<S> {
    router: Router<S>,
    state: Arc<S>,
    broadcaster: Broadcaster,
    policy: FailurePolicy,
}

struct Shared<S> {
    router: Router<S>,
    state: Arc<S>,
    broadcaster: Broadcaster,
    policy: FailurePolicy,
}

impl<S: Send + Sync + 'static> Server<S> {
    /// Serve `state` through `router`, fanning events out via `broadcaster`.
    pub fn new(router: Router<S>, state: Arc<S>, broadcaster: Broadcaster) -> Self {
        Self {
            router,
            state,
            broadcaster,
            policy: FailurePolicy::default(),
        }
    }

    /// Choose how failed fire-and-forget calls are reported.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Broadcaster shared with the served state.
    #[must_use]
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Bind `socket_path` and spawn the accept loop.
    ///
    /// The loop runs until `ct` is cancelled. Connections already accepted
    /// wind down on the same token.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the listener cannot be created.
    pub fn spawn(self, socket_path: &Path, ct: CancellationToken) -> Result<JoinHandle<()>> {
        let listener = super::listen(socket_path).map_err(|err| {
            AppError::Transport(format!(
                "failed to listen on {}: {err}",
                socket_path.display()
            ))
        })?;

        let socket_label = socket_path.display().to_string();
        info!(socket = %socket_label, "bridge server listening");

        let shared = Arc::new(Shared {
            router: self.router,
            state: self.state,
            broadcaster: self.broadcaster,
            policy: self.policy,
        });

        let handle = tokio::spawn(async move {
            let span = info_span!("bridge_server", socket = %socket_label);
            async move {
                loop {
                    tokio::select! {
                        () = ct.cancelled() => {
                            info!("bridge server shutting down");
                            break;
                        }
                        accept_result = listener.accept() => {
                            match accept_result {
                                Ok(stream) => {
                                    let shared = Arc::clone(&shared);
                                    tokio::spawn(handle_connection(stream, shared, ct.clone()));
                                }
                                Err(err) => {
                                    warn!(%err, "accept failed");
                                }
                            }
                        }
                    }
                }
            }
            .instrument(span)
            .await;
        });

        Ok(handle)
    }
}

/// Wait for the accept loop started by [`Server::spawn`] to finish.
///
/// If the task failed, one best-effort `error` event carrying a `panicked`
/// error is broadcast to every live connection before returning it. A clean
/// stop returns `None`.
pub async fn watch_server(handle: JoinHandle<()>, broadcaster: Broadcaster) -> Option<RemoteError> {
    match handle.await {
        Ok(()) => None,
        Err(err) => {
            let failure = RemoteError::panicked(format!("daemon server task failed: {err}"));
            error!(error = %failure, "server task failed");
            let reached = broadcaster.emit_error(&failure);
            info!(reached, "broadcast server failure to clients");
            tokio::time::sleep(FAILURE_FLUSH_GRACE).await;
            Some(failure)
        }
    }
}

/// Serve one client until it disconnects or the server shuts down.
async fn handle_connection<S: Send + Sync + 'static>(
    stream: Stream,
    shared: Arc<Shared<S>>,
    ct: CancellationToken,
) {
    let (recv, send) = stream.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let connection = shared.broadcaster.register(outbound_tx.clone());

    let span = info_span!("bridge_conn", connection);
    async move {
        info!("client connected");
        let conn_ct = ct.child_token();
        let writer = tokio::spawn(
            run_writer(send, outbound_rx, conn_ct.clone()).instrument(tracing::Span::current()),
        );

        read_requests(recv, &shared, &outbound_tx, &conn_ct, connection).await;

        // The writer stops once every in-flight request has queued its
        // response, so a client that only half-closed still gets its replies.
        shared.broadcaster.unregister(connection);
        drop(outbound_tx);
        if let Err(err) = writer.await {
            warn!(%err, "connection writer task failed");
        }
        conn_ct.cancel();
        info!("client disconnected");
    }
    .instrument(span)
    .await;
}

async fn read_requests<S: Send + Sync + 'static>(
    recv: RecvHalf,
    shared: &Arc<Shared<S>>,
    outbound: &mpsc::Sender<Frame>,
    ct: &CancellationToken,
    connection: ConnectionId,
) {
    let mut framed = FramedRead::new(recv, FrameCodec::new());

    loop {
        tokio::select! {
            biased;

            () = ct.cancelled() => {
                debug!("reader stopping on shutdown");
                break;
            }

            item = framed.next() => match item {
                None => {
                    debug!("client closed the stream");
                    break;
                }
                Some(Err(err)) => {
                    warn!(%err, "connection read failed");
                    break;
                }
                Some(Ok(Err(err))) => {
                    warn!(%err, "discarding undecodable frame");
                }
                Some(Ok(Ok(Frame::Request(request)))) => {
                    spawn_request(Arc::clone(shared), request, outbound.clone());
                }
                Some(Ok(Ok(other))) => {
                    warn!(connection, frame = ?other, "ignoring non-request frame from client");
                }
            },
        }
    }
}

/// Drain the outbound queue onto the socket.
async fn run_writer(mut send: SendHalf, mut outbound: mpsc::Receiver<Frame>, ct: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            () = ct.cancelled() => break,

            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let bytes = match encode_frame(&frame) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        error!(%err, "failed to encode outbound frame");
                        continue;
                    }
                };
                if let Err(err) = send.write_all(&bytes).await {
                    warn!(%err, "write to client failed");
                    break;
                }
            }
        }
    }
}

/// Run one request independently of the connection that carried it.
///
/// A fire-and-forget call keeps running after its connection drops; a
/// regular call queues exactly one response.
fn spawn_request<S: Send + Sync + 'static>(
    shared: Arc<Shared<S>>,
    request: Request,
    outbound: mpsc::Sender<Frame>,
) {
    let span = info_span!("request", id = request.id, verb = %request.verb);
    tokio::spawn(
        async move {
            let Request { id, verb, args } = request;
            let inner = {
                let shared = Arc::clone(&shared);
                let verb = verb.clone();
                tokio::spawn(async move { shared.router.dispatch(&shared.state, &verb, args).await })
            };

            let payload = match inner.await {
                Ok(payload) => payload,
                Err(err) => {
                    let failure = RemoteError::panicked(format!("'{verb}' failed: {err}"));
                    error!(error = %failure, "operation task failed");
                    Payload::Error(failure)
                }
            };

            if id == FIRE_AND_FORGET {
                if let Payload::Error(failure) = payload {
                    report_detached_failure(&shared, &verb, &failure);
                }
                return;
            }

            if let Payload::Error(ref failure) = payload {
                debug!(error = %failure, "request failed");
            }
            if outbound
                .send(Frame::Response(Response { id, payload }))
                .await
                .is_err()
            {
                debug!("connection closed before the response could be sent");
            }
        }
        .instrument(span),
    );
}

fn report_detached_failure<S>(shared: &Shared<S>, verb: &str, failure: &RemoteError) {
    match shared.policy {
        FailurePolicy::Broadcast => {
            let reached = shared.broadcaster.emit_error(failure);
            warn!(verb, error = %failure, reached, "fire-and-forget call failed; broadcast");
        }
        FailurePolicy::Log => {
            warn!(verb, error = %failure, "fire-and-forget call failed");
        }
    }
}
