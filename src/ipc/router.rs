//! Verb dispatch table.
//!
//! Operations are registered up front under a path such as `user` or
//! `http.session.closed`, each with an explicit [`OperationKind`]. A request
//! verb is resolved by dropping its first segment (the namespace label) and
//! looking the remainder up in the table. Nothing outside the table is
//! reachable from the socket.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use tracing::{debug, warn};

use crate::protocol::{CallArgs, Payload, RemoteError};

/// How a registered operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Read a value; arguments are ignored. Runs inline.
    Get,
    /// Synchronous call; runs on the blocking worker pool.
    Call,
    /// Asynchronous call; awaited on the scheduler before replying.
    CallAsync,
}

type GetFn<S> = Arc<dyn Fn(&S) -> Payload + Send + Sync>;
type CallFn<S> = Arc<dyn Fn(&S, CallArgs) -> Payload + Send + Sync>;
type AsyncFn<S> = Arc<dyn Fn(Arc<S>, CallArgs) -> BoxFuture<'static, Payload> + Send + Sync>;

enum Handler<S> {
    Get(GetFn<S>),
    Call(CallFn<S>),
    CallAsync(AsyncFn<S>),
}

impl<S> Handler<S> {
    fn kind(&self) -> OperationKind {
        match self {
            Self::Get(_) => OperationKind::Get,
            Self::Call(_) => OperationKind::Call,
            Self::CallAsync(_) => OperationKind::CallAsync,
        }
    }
}

/// Dispatch table over a shared state object `S`.
pub struct Router<S> {
    routes: HashMap<String, Handler<S>>,
}

impl<S> Default for Router<S> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<S> std::fmt::Debug for Router<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut verbs: Vec<_> = self.routes.keys().collect();
        verbs.sort();
        f.debug_struct("Router").field("routes", &verbs).finish()
    }
}

impl<S: Send + Sync + 'static> Router<S> {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value read.
    #[must_use]
    pub fn get<F, T>(self, path: &str, read: F) -> Self
    where
        F: Fn(&S) -> Result<T, RemoteError> + Send + Sync + 'static,
        T: Serialize,
    {
        self.insert(
            path,
            Handler::Get(Arc::new(move |state: &S| Payload::from_outcome(read(state)))),
        )
    }

    /// Register a synchronous call, executed off the scheduler.
    #[must_use]
    pub fn call<F, T>(self, path: &str, call: F) -> Self
    where
        F: Fn(&S, CallArgs) -> Result<T, RemoteError> + Send + Sync + 'static,
        T: Serialize,
    {
        self.insert(
            path,
            Handler::Call(Arc::new(move |state: &S, args: CallArgs| {
                Payload::from_outcome(call(state, args))
            })),
        )
    }

    /// Register an asynchronous call.
    #[must_use]
    pub fn call_async<F, Fut, T>(self, path: &str, call: F) -> Self
    where
        F: Fn(Arc<S>, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
        T: Serialize + 'static,
    {
        self.insert(
            path,
            Handler::CallAsync(Arc::new(move |state: Arc<S>, args: CallArgs| {
                call(state, args).map(Payload::from_outcome).boxed()
            })),
        )
    }

    fn insert(mut self, path: &str, handler: Handler<S>) -> Self {
        let path = path.trim_matches('.').to_owned();
        if self.routes.insert(path.clone(), handler).is_some() {
            warn!(path = %path, "operation registered twice; keeping the later one");
        }
        self
    }

    /// Kind of the operation `verb` resolves to.
    #[must_use]
    pub fn kind(&self, verb: &str) -> Option<OperationKind> {
        self.resolve(verb).ok().map(Handler::kind)
    }

    /// Registered paths, without namespace, in sorted order.
    #[must_use]
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    fn resolve(&self, verb: &str) -> Result<&Handler<S>, RemoteError> {
        verb.split_once('.')
            .map(|(_namespace, path)| path)
            .filter(|path| !path.is_empty())
            .and_then(|path| self.routes.get(path))
            .ok_or_else(|| RemoteError::unroutable(verb))
    }

    /// Resolve `verb` and run it against `state`.
    ///
    /// Never fails: resolution errors, operation errors, and panics in
    /// blocking calls all come back as [`Payload::Error`].
    pub async fn dispatch(&self, state: &Arc<S>, verb: &str, args: CallArgs) -> Payload {
        let handler = match self.resolve(verb) {
            Ok(handler) => handler,
            Err(err) => {
                debug!(verb, "unroutable verb");
                return Payload::Error(err);
            }
        };

        match handler {
            Handler::Get(read) => {
                if !args.is_empty() {
                    debug!(verb, "arguments ignored for value read");
                }
                read(state.as_ref())
            }
            Handler::Call(call) => {
                let call = Arc::clone(call);
                let state = Arc::clone(state);
                tokio::task::spawn_blocking(move || call(&state, args))
                    .await
                    .unwrap_or_else(|err| {
                        Payload::Error(RemoteError::panicked(format!("'{verb}' failed: {err}")))
                    })
            }
            Handler::CallAsync(call) => call(Arc::clone(state), args).await,
        }
    }
}
