//! In-memory chat session served by the `chat-bridge` daemon.
//!
//! Stands in for a remote chat backend: it keeps users, channels and
//! messages in process memory and announces changes through the
//! [`Broadcaster`]. The verb table is built by [`MemorySession::router`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::ipc::broadcast::Broadcaster;
use crate::ipc::router::Router;
use crate::protocol::{materialize, RemoteError};

/// Default page size of `history`.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Applies a log filter directive; returns `false` if it does not parse.
pub type LogControl = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A chat channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel id, assigned in creation order.
    pub id: u64,
    /// Display name.
    pub name: String,
}

/// A message posted to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message id, assigned in posting order.
    pub id: u64,
    /// Channel the message belongs to.
    pub channel_id: u64,
    /// User who posted it.
    pub author: String,
    /// Message text.
    pub content: String,
    /// Whether the text was changed after posting.
    pub edited: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    user: Option<String>,
    connected: bool,
    channels: BTreeMap<u64, Channel>,
    messages: BTreeMap<u64, Message>,
    last_channel_id: u64,
    last_message_id: u64,
}

/// In-memory session state shared by every client of one daemon.
pub struct MemorySession {
    state: Mutex<SessionState>,
    broadcaster: Broadcaster,
    log_control: Option<LogControl>,
    latency: Duration,
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession")
            .field("state", &*self.state())
            .field("log_control", &self.log_control.is_some())
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

impl MemorySession {
    /// Empty, logged-out session publishing through `broadcaster`.
    #[must_use]
    pub fn new(broadcaster: Broadcaster) -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            broadcaster,
            log_control: None,
            latency: Duration::ZERO,
        }
    }

    /// Start logged in as `user`.
    #[must_use]
    pub fn with_user(self, user: impl Into<String>) -> Self {
        self.state().user = Some(user.into());
        self
    }

    /// Hook used by `set_logging_level`.
    #[must_use]
    pub fn with_log_control(mut self, control: LogControl) -> Self {
        self.log_control = Some(control);
        self
    }

    /// Simulated backend round-trip applied to every asynchronous operation.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Verb table exposing this session. Paths carry no namespace; clients
    /// address them as `<namespace>.<path>`, e.g. `session.user`.
    #[must_use]
    pub fn router() -> Router<Self> {
        Router::new()
            .get("user", |session: &Self| Ok(session.user()))
            .get("is_logged_in", |session: &Self| Ok(session.is_logged_in()))
            .get("is_closed", |session: &Self| Ok(session.is_closed()))
            .get("channels", |session: &Self| {
                materialize(session.state().channels.values())
            })
            .get("messages", |session: &Self| {
                materialize(session.state().messages.values())
            })
            .call("login", |session, args| {
                session.login(args.get(0, "user")?);
                Ok(())
            })
            .call("create_channel", |session, args| {
                session.create_channel(&args.get::<String>(0, "name")?)
            })
            .call("get_channel", |session, args| {
                session.get_channel(args.get(0, "id")?)
            })
            .call("history", |session, args| {
                session.history(
                    args.get(0, "channel_id")?,
                    args.get_or(1, "limit", DEFAULT_HISTORY_LIMIT)?,
                )
            })
            .call("set_logging_level", |session, args| {
                Ok(session.set_logging_level(&args.get::<String>(0, "level")?))
            })
            .call_async("start", |session, args| async move {
                session.login(args.get(0, "user")?);
                session.connect().await
            })
            .call_async("connect", |session, _args| async move {
                session.connect().await
            })
            .call_async("close", |session, _args| async move {
                session.close().await;
                Ok::<_, RemoteError>(())
            })
            .call_async("send_message", |session, args| async move {
                let channel_id = args.get(0, "channel_id")?;
                let content: String = args.get(1, "content")?;
                session.send_message(channel_id, &content).await
            })
            .call_async("edit_message", |session, args| async move {
                let message_id = args.get(0, "message_id")?;
                let content: String = args.get(1, "content")?;
                session.edit_message(message_id, &content).await
            })
            .call_async("delete_message", |session, args| async move {
                session.delete_message(args.get(0, "message_id")?).await
            })
    }

    /// Logged-in user, if any.
    #[must_use]
    pub fn user(&self) -> Option<String> {
        self.state().user.clone()
    }

    /// Whether a user is logged in.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.state().user.is_some()
    }

    /// `true` unless connected.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.state().connected
    }

    /// All channels in id order.
    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        self.state().channels.values().cloned().collect()
    }

    /// All messages in id order.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.state().messages.values().cloned().collect()
    }

    /// Set the current user.
    pub fn login(&self, user: String) {
        info!(user = %user, "session login");
        self.state().user = Some(user);
    }

    /// Connect as the logged-in user and emit `ready`.
    ///
    /// # Errors
    ///
    /// Fails with `raised` when nobody is logged in.
    pub async fn connect(&self) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        let user = {
            let mut state = self.state();
            let user = state
                .user
                .clone()
                .ok_or_else(|| RemoteError::raised("cannot connect: not logged in"))?;
            state.connected = true;
            user
        };
        info!(user = %user, "session connected");
        self.broadcaster.emit("ready", vec![json!(user)]);
        Ok(())
    }

    /// Disconnect and emit `disconnect`.
    pub async fn close(&self) {
        self.simulate_latency().await;
        self.state().connected = false;
        info!("session closed");
        self.broadcaster.emit("disconnect", Vec::new());
    }

    /// Create a channel and emit `channel_create`.
    ///
    /// # Errors
    ///
    /// Fails with `bad_arguments` for a blank name.
    pub fn create_channel(&self, name: &str) -> Result<Channel, RemoteError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RemoteError::bad_arguments("channel name must not be empty"));
        }
        let channel = {
            let mut state = self.state();
            state.last_channel_id += 1;
            let channel = Channel {
                id: state.last_channel_id,
                name: name.to_owned(),
            };
            state.channels.insert(channel.id, channel.clone());
            channel
        };
        self.emit("channel_create", &channel);
        Ok(channel)
    }

    /// Look up a channel.
    ///
    /// # Errors
    ///
    /// Fails with `raised` for an unknown id.
    pub fn get_channel(&self, id: u64) -> Result<Channel, RemoteError> {
        self.state()
            .channels
            .get(&id)
            .cloned()
            .ok_or_else(|| RemoteError::raised(format!("unknown channel {id}")))
    }

    /// The newest `limit` messages of a channel, oldest first.
    ///
    /// # Errors
    ///
    /// Fails with `raised` for an unknown channel.
    pub fn history(&self, channel_id: u64, limit: usize) -> Result<Vec<Message>, RemoteError> {
        let state = self.state();
        if !state.channels.contains_key(&channel_id) {
            return Err(RemoteError::raised(format!("unknown channel {channel_id}")));
        }
        let mut newest: Vec<Message> = state
            .messages
            .values()
            .rev()
            .filter(|message| message.channel_id == channel_id)
            .take(limit)
            .cloned()
            .collect();
        newest.reverse();
        Ok(newest)
    }

    /// Post a message and emit `message`.
    ///
    /// # Errors
    ///
    /// Fails with `raised` when not connected or the channel is unknown.
    pub async fn send_message(&self, channel_id: u64, content: &str) -> Result<Message, RemoteError> {
        self.simulate_latency().await;
        let message = {
            let mut state = self.state();
            let author = connected_user(&state)?;
            if !state.channels.contains_key(&channel_id) {
                return Err(RemoteError::raised(format!("unknown channel {channel_id}")));
            }
            state.last_message_id += 1;
            let message = Message {
                id: state.last_message_id,
                channel_id,
                author,
                content: content.to_owned(),
                edited: false,
            };
            state.messages.insert(message.id, message.clone());
            message
        };
        self.emit("message", &message);
        Ok(message)
    }

    /// Replace a message's text and emit `message_edit`.
    ///
    /// # Errors
    ///
    /// Fails with `raised` when not connected or the message is unknown.
    pub async fn edit_message(&self, message_id: u64, content: &str) -> Result<Message, RemoteError> {
        self.simulate_latency().await;
        let message = {
            let mut state = self.state();
            connected_user(&state)?;
            let message = state
                .messages
                .get_mut(&message_id)
                .ok_or_else(|| RemoteError::raised(format!("unknown message {message_id}")))?;
            content.clone_into(&mut message.content);
            message.edited = true;
            message.clone()
        };
        self.emit("message_edit", &message);
        Ok(message)
    }

    /// Delete a message and emit `message_delete`.
    ///
    /// # Errors
    ///
    /// Fails with `raised` when not connected or the message is unknown.
    pub async fn delete_message(&self, message_id: u64) -> Result<Message, RemoteError> {
        self.simulate_latency().await;
        let message = {
            let mut state = self.state();
            connected_user(&state)?;
            state
                .messages
                .remove(&message_id)
                .ok_or_else(|| RemoteError::raised(format!("unknown message {message_id}")))?
        };
        self.emit("message_delete", &message);
        Ok(message)
    }

    /// Change the daemon's log filter. Returns whether `level` was applied.
    pub fn set_logging_level(&self, level: &str) -> bool {
        let applied = self
            .log_control
            .as_ref()
            .is_some_and(|control| control(level));
        if applied {
            info!(level, "logging level changed");
            self.broadcaster
                .emit("remote_update", vec![json!({ "logging_level": level })]);
        } else {
            debug!(level, "logging level not applied");
        }
        applied
    }

    fn emit<T: Serialize>(&self, name: &str, item: &T) {
        match serde_json::to_value(item) {
            Ok(value) => {
                self.broadcaster.emit(name, vec![value]);
            }
            Err(err) => {
                let failure = RemoteError::unserializable(format!("event '{name}': {err}"));
                self.broadcaster.emit_error(&failure);
            }
        }
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn connected_user(state: &SessionState) -> Result<String, RemoteError> {
    match (&state.user, state.connected) {
        (Some(user), true) => Ok(user.clone()),
        (None, _) => Err(RemoteError::raised("not logged in")),
        (Some(_), false) => Err(RemoteError::raised("not connected")),
    }
}
