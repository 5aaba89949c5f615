//! Wire records exchanged between the daemon and its front-end clients.
//!
//! Every value that crosses the socket is one of the closed record types
//! below; nothing is ever deserialized into an arbitrary in-memory object.
//!
//! ## Record shapes
//!
//! ```text
//! request   [id, verb, [positional_args, keyword_args]]
//! response  [id, {"status": "ok", "value": ...}]
//!           [id, {"status": "error", "value": {"kind": ..., "message": ...}}]
//! event     ["event", name, payload...]
//! ```
//!
//! A request whose id is [`FIRE_AND_FORGET`] never receives a response.

pub mod codec;
pub mod framer;

use std::fmt::{Display, Formatter};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Correlation identifier carried by requests and responses.
pub type RequestId = i64;

/// Request id marking a call that expects no response.
pub const FIRE_AND_FORGET: RequestId = -1;

/// Leading tag that distinguishes event records from responses.
pub const EVENT_TAG: &str = "event";

/// Event name used by the daemon to broadcast failures to every client.
pub const ERROR_EVENT: &str = "error";

/// Classification of a failure produced on the daemon side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// The invoked operation returned an error.
    Raised,
    /// The verb path does not name a registered operation.
    UnroutableVerb,
    /// Arguments were missing or had the wrong shape.
    BadArguments,
    /// The result could not be represented on the wire.
    Unserializable,
    /// The operation panicked while running.
    Panicked,
}

impl RemoteErrorKind {
    /// Stable wire label for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raised => "raised",
            Self::UnroutableVerb => "unroutable_verb",
            Self::BadArguments => "bad_arguments",
            Self::Unserializable => "unserializable",
            Self::Panicked => "panicked",
        }
    }
}

/// Error sentinel carried in place of a result value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Failure classification.
    pub kind: RemoteErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl RemoteError {
    /// Build an error of the given kind.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The operation itself failed.
    pub fn raised(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Raised, message)
    }

    /// Nothing is registered under `verb`.
    pub fn unroutable(verb: &str) -> Self {
        Self::new(
            RemoteErrorKind::UnroutableVerb,
            format!("no operation registered for verb '{verb}'"),
        )
    }

    /// Arguments did not match what the operation expects.
    pub fn bad_arguments(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::BadArguments, message)
    }

    /// A result could not be serialized.
    pub fn unserializable(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unserializable, message)
    }

    /// The operation panicked.
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Panicked, message)
    }
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Result slot of a response: either a materialized value or an error sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Payload {
    /// Successful, fully materialized result.
    #[serde(rename = "ok")]
    Value(Value),
    /// Error sentinel.
    Error(RemoteError),
}

impl Payload {
    /// Serialize an operation outcome, substituting an error sentinel for
    /// results that cannot be represented on the wire.
    pub fn from_outcome<T: Serialize>(outcome: std::result::Result<T, RemoteError>) -> Self {
        match outcome {
            Ok(value) => match serde_json::to_value(value) {
                Ok(value) => Self::Value(value),
                Err(err) => Self::Error(RemoteError::unserializable(err.to_string())),
            },
            Err(err) => Self::Error(err),
        }
    }

    /// Split into a standard result.
    ///
    /// # Errors
    ///
    /// Returns the carried [`RemoteError`] when this payload is a sentinel.
    pub fn into_result(self) -> std::result::Result<Value, RemoteError> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Error(err) => Err(err),
        }
    }
}

/// Drain a finite sequence into an ordered list value.
///
/// Lazily produced collections (iterators, map views) are collected before
/// encoding so that only self-contained values ever reach the wire.
///
/// # Errors
///
/// Returns [`RemoteErrorKind::Unserializable`] if any element fails to serialize.
pub fn materialize<I, T>(items: I) -> std::result::Result<Value, RemoteError>
where
    I: IntoIterator<Item = T>,
    T: Serialize,
{
    items
        .into_iter()
        .map(|item| serde_json::to_value(item))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map(Value::Array)
        .map_err(|err| RemoteError::unserializable(err.to_string()))
}

/// Positional and keyword arguments of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    /// Positional arguments in call order.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    /// Empty argument list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Whether no arguments were supplied at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }

    /// Fetch an argument by keyword `name`, falling back to position `index`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteErrorKind::BadArguments`] when the argument is absent
    /// or does not deserialize into `T`.
    pub fn get<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> std::result::Result<T, RemoteError> {
        let raw = self
            .lookup(index, name)
            .ok_or_else(|| RemoteError::bad_arguments(format!("missing argument '{name}'")))?;
        serde_json::from_value(raw.clone())
            .map_err(|err| RemoteError::bad_arguments(format!("argument '{name}': {err}")))
    }

    /// Like [`CallArgs::get`], returning `default` when the argument is absent.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteErrorKind::BadArguments`] when a supplied argument does
    /// not deserialize into `T`.
    pub fn get_or<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
        default: T,
    ) -> std::result::Result<T, RemoteError> {
        if self.lookup(index, name).is_none() {
            return Ok(default);
        }
        self.get(index, name)
    }

    fn lookup(&self, index: usize, name: &str) -> Option<&Value> {
        self.kwargs.get(name).or_else(|| self.args.get(index))
    }

    fn to_record(&self) -> Value {
        Value::Array(vec![
            Value::Array(self.args.clone()),
            Value::Object(self.kwargs.clone()),
        ])
    }

    fn from_record(record: Value) -> std::result::Result<Self, String> {
        let Value::Array(parts) = record else {
            return Err("call arguments must be [args, kwargs]".into());
        };
        let mut parts = parts.into_iter();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(Value::Array(args)), Some(Value::Object(kwargs)), None) => {
                Ok(Self { args, kwargs })
            }
            _ => Err("call arguments must be [args, kwargs]".into()),
        }
    }
}

/// Path-addressed call sent by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id, or [`FIRE_AND_FORGET`].
    pub id: RequestId,
    /// Dot-separated verb path; the first segment is a namespace label.
    pub verb: String,
    /// Call arguments.
    pub args: CallArgs,
}

impl Request {
    /// Whether the sender expects no response.
    #[must_use]
    pub fn is_fire_and_forget(&self) -> bool {
        self.id == FIRE_AND_FORGET
    }
}

/// Reply to exactly one non-fire-and-forget request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the request being answered.
    pub id: RequestId,
    /// Result or error sentinel.
    pub payload: Payload,
}

/// Unsolicited daemon-to-client notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Event name.
    pub name: String,
    /// Event arguments.
    pub payload: Vec<Value>,
}

impl Event {
    /// Build an event.
    pub fn new(name: impl Into<String>, payload: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Client-to-daemon call.
    Request(Request),
    /// Daemon-to-client reply.
    Response(Response),
    /// Daemon-to-client notification.
    Event(Event),
}

impl Frame {
    /// Lower this frame into its array record shape.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the payload cannot be represented.
    pub fn to_record(&self) -> std::result::Result<Value, serde_json::Error> {
        let record = match self {
            Self::Request(request) => Value::Array(vec![
                Value::from(request.id),
                Value::String(request.verb.clone()),
                request.args.to_record(),
            ]),
            Self::Response(response) => Value::Array(vec![
                Value::from(response.id),
                serde_json::to_value(&response.payload)?,
            ]),
            Self::Event(event) => {
                let mut items = Vec::with_capacity(event.payload.len() + 2);
                items.push(Value::String(EVENT_TAG.to_owned()));
                items.push(Value::String(event.name.clone()));
                items.extend(event.payload.iter().cloned());
                Value::Array(items)
            }
        };
        Ok(record)
    }

    /// Rebuild a frame from its array record shape.
    ///
    /// # Errors
    ///
    /// Returns a description of the shape violation.
    pub fn from_record(record: Value) -> std::result::Result<Self, String> {
        let Value::Array(items) = record else {
            return Err("record is not an array".into());
        };
        let mut items = items.into_iter();
        match items.next() {
            Some(Value::String(tag)) if tag == EVENT_TAG => {
                let Some(Value::String(name)) = items.next() else {
                    return Err("event record is missing its name".into());
                };
                Ok(Self::Event(Event {
                    name,
                    payload: items.collect(),
                }))
            }
            Some(Value::Number(id)) => {
                let id = id
                    .as_i64()
                    .ok_or_else(|| format!("request id {id} is not an integer"))?;
                match (items.next(), items.next(), items.next()) {
                    (Some(Value::String(verb)), Some(args), None) => {
                        Ok(Self::Request(Request {
                            id,
                            verb,
                            args: CallArgs::from_record(args)?,
                        }))
                    }
                    (Some(payload), None, None) => {
                        let payload = serde_json::from_value(payload)
                            .map_err(|err| format!("invalid response payload: {err}"))?;
                        Ok(Self::Response(Response { id, payload }))
                    }
                    _ => Err(format!("record with id {id} has an unknown shape")),
                }
            }
            Some(other) => Err(format!("unexpected record head: {other}")),
            None => Err("record is empty".into()),
        }
    }
}
