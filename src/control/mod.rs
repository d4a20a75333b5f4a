//! Control protocol: request/response envelopes, responders and the
//! dispatcher that routes requests to engine operations.

mod dispatcher;

pub use dispatcher::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::db::{BackendType, Event, TargetSummary};
use crate::metrics::Metrics;
use crate::probe::ProbeResult;

/// Dispatcher error types.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("InvalidInput: {0}")]
    InvalidInput(String),
    #[error("StoreFailure: {0}")]
    Store(String),
    #[error("Unrecognized: no handler for action '{action}' operation '{operation}'")]
    Unrecognized { action: String, operation: String },
    #[error("Internal: {0}")]
    Internal(String),
    #[error("responder closed before the response was delivered")]
    ResponderClosed,
}

impl From<crate::db::DbError> for DispatchError {
    fn from(e: crate::db::DbError) -> Self {
        DispatchError::Store(e.to_string())
    }
}

/// Transport a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Persistent session channel (WebSocket).
    Push,
    /// Request/response administrative channel (HTTP).
    Admin,
}

/// Outcome code carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultCode {
    Ok,
    Error,
    NotFound,
    Unsupported,
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultCode::Ok => "ok",
            ResultCode::Error => "error",
            ResultCode::NotFound => "notfound",
            ResultCode::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

/// Naming of the envelope fields on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Envelope {
    /// `operation`, `correlationId`, `sessionId`.
    #[default]
    Standard,
    /// `sub`, `responseid`, `sessionid`, as sent by older clients.
    Legacy,
}

impl Envelope {
    /// Legacy if any short envelope name is present in `fields`.
    fn detect(fields: &Map<String, Value>) -> Self {
        if ["sub", "responseid", "sessionid"].iter().any(|k| fields.contains_key(*k)) {
            Envelope::Legacy
        } else {
            Envelope::Standard
        }
    }
}

/// An inbound control request.
///
/// Envelope fields also accept the short names used by older clients
/// (`sub`, `responseid`, `sessionid`); the response then uses the same
/// names. Every other key is payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "WireRequest")]
pub struct ControlRequest {
    pub action: String,
    pub operation: String,
    pub correlation_id: Value,
    pub session_id: Option<Value>,
    pub payload: Map<String, Value>,
    pub envelope: Envelope,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    #[serde(default)]
    action: String,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    correlation_id: Option<Value>,
    #[serde(default)]
    responseid: Option<Value>,
    #[serde(default)]
    session_id: Option<Value>,
    #[serde(default)]
    sessionid: Option<Value>,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

impl From<WireRequest> for ControlRequest {
    fn from(wire: WireRequest) -> Self {
        let legacy = wire.sub.is_some() || wire.responseid.is_some() || wire.sessionid.is_some();
        Self {
            action: wire.action,
            operation: wire.operation.or(wire.sub).unwrap_or_default(),
            correlation_id: wire.correlation_id.or(wire.responseid).unwrap_or(Value::Null),
            session_id: wire.session_id.or(wire.sessionid),
            payload: wire.payload,
            envelope: if legacy { Envelope::Legacy } else { Envelope::Standard },
        }
    }
}

impl ControlRequest {
    pub fn new(action: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<Value>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// First non-empty string payload field among `keys`.
    pub fn str_field(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|k| self.payload.get(*k))
            .find_map(|v| match v {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    /// Non-negative integer payload field, accepting numeric strings.
    pub fn usize_field(&self, key: &str) -> Option<usize> {
        match self.payload.get(key)? {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Operation-specific response fields. Absent fields are omitted on the wire.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collections: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub databases: Option<Vec<TargetSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<Event>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drivers: Option<BTreeMap<BackendType, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An outbound response, correlated to exactly one request.
///
/// Serialized with the envelope names its request used.
#[derive(Debug, Clone)]
pub struct ControlResponse {
    pub action: String,
    pub operation: String,
    pub correlation_id: Value,
    pub session_id: Option<Value>,
    pub result: ResultCode,
    pub body: ResponseBody,
    pub envelope: Envelope,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StandardResponse<'a> {
    action: &'a str,
    operation: &'a str,
    correlation_id: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a Value>,
    result: ResultCode,
    #[serde(flatten)]
    body: &'a ResponseBody,
}

#[derive(Serialize)]
struct LegacyResponse<'a> {
    action: &'a str,
    sub: &'a str,
    responseid: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    sessionid: Option<&'a Value>,
    result: ResultCode,
    #[serde(flatten)]
    body: &'a ResponseBody,
}

impl Serialize for ControlResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.envelope {
            Envelope::Standard => StandardResponse {
                action: &self.action,
                operation: &self.operation,
                correlation_id: &self.correlation_id,
                session_id: self.session_id.as_ref(),
                result: self.result,
                body: &self.body,
            }
            .serialize(serializer),
            Envelope::Legacy => LegacyResponse {
                action: &self.action,
                sub: &self.operation,
                responseid: &self.correlation_id,
                sessionid: self.session_id.as_ref(),
                result: self.result,
                body: &self.body,
            }
            .serialize(serializer),
        }
    }
}

impl ControlResponse {
    pub fn for_request(request: &ControlRequest, result: ResultCode, body: ResponseBody) -> Self {
        Self {
            action: request.action.clone(),
            operation: request.operation.clone(),
            correlation_id: request.correlation_id.clone(),
            session_id: request.session_id.clone(),
            result,
            body,
            envelope: request.envelope,
        }
    }

    /// An `error` response for a frame that could not be parsed.
    ///
    /// Whatever envelope fields survive in `raw` are echoed back.
    pub fn malformed(raw: &str, message: impl Into<String>) -> Self {
        let value: Value = serde_json::from_str(raw).unwrap_or(Value::Null);
        let envelope = value.as_object().map(Envelope::detect).unwrap_or_default();
        let field = |keys: &[&str]| keys.iter().find_map(|k| value.get(*k)).cloned();
        let text = |keys: &[&str]| {
            field(keys)
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default()
        };

        Self {
            action: text(&["action"]),
            operation: text(&["operation", "sub"]),
            correlation_id: field(&["correlationId", "responseid"]).unwrap_or(Value::Null),
            session_id: field(&["sessionId", "sessionid"]),
            result: ResultCode::Error,
            body: ResponseBody {
                error: Some(message.into()),
                ..Default::default()
            },
            envelope,
        }
    }
}

/// Delivers the single response to a request over its originating transport.
#[async_trait]
pub trait Responder: Send {
    async fn send(self: Box<Self>, response: ControlResponse) -> Result<(), DispatchError>;
}

/// Responder for a persistent session: responses are queued on the
/// session's outbound channel.
pub struct ChannelResponder {
    tx: mpsc::UnboundedSender<ControlResponse>,
}

impl ChannelResponder {
    pub fn new(tx: mpsc::UnboundedSender<ControlResponse>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Responder for ChannelResponder {
    async fn send(self: Box<Self>, response: ControlResponse) -> Result<(), DispatchError> {
        self.tx.send(response).map_err(|_| DispatchError::ResponderClosed)
    }
}

/// Responder for a terminating request/response exchange.
pub struct OneshotResponder {
    tx: oneshot::Sender<ControlResponse>,
}

impl OneshotResponder {
    pub fn new() -> (Self, oneshot::Receiver<ControlResponse>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Responder for OneshotResponder {
    async fn send(self: Box<Self>, response: ControlResponse) -> Result<(), DispatchError> {
        self.tx.send(response).map_err(|_| DispatchError::ResponderClosed)
    }
}
