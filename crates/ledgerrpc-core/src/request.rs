//! JSON-RPC 2.0 wire types and frame codec.
//!
//! Outbound requests are framed as a single-element batch
//! (`[{"jsonrpc":"2.0","id":"…","method":"…","params":[…]}]`). Inbound frames
//! may be either batch arrays or bare objects and carry either a response
//! (has `id`) or a server push notification (has `method`, no `id`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RpcError;

/// JSON-RPC request ID: string, number, or null.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

impl RpcId {
    /// A fresh, globally unique correlation id.
    pub fn fresh() -> Self {
        Self::String(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// A single JSON-RPC parameter value.
pub type RpcParam = Value;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RpcId,
    pub method: String,
    /// Positional params array, or `null`.
    pub params: Value,
}

impl JsonRpcRequest {
    /// Create a request with a fresh correlation id.
    pub fn new(method: impl Into<String>, params: Vec<RpcParam>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: RpcId::fresh(),
            method: method.into(),
            params: Value::Array(params),
        }
    }

    /// The best-effort keepalive frame. Nobody waits for its response.
    pub fn keepalive() -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: RpcId::fresh(),
            method: "ping".into(),
            params: Value::Null,
        }
    }

    /// Encode as a single-element batch frame.
    pub fn to_frame(&self) -> Result<String, RpcError> {
        serde_json::to_string(std::slice::from_ref(self))
            .map_err(|e| RpcError::Other(format!("encoding {} request: {e}", self.method)))
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Returns `true` if this is a successful response (has result, no error).
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.result.is_some()
    }

    /// Unwrap the result value or return the server's error object.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// `params` of a server push notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationParams {
    pub subscription: u64,
    pub result: Value,
}

/// A server push notification (`<kind>Notification`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: NotificationParams,
}

impl JsonRpcNotification {
    /// The notification kind, e.g. `"signature"` for `signatureNotification`.
    pub fn kind(&self) -> Option<&str> {
        self.method.strip_suffix("Notification")
    }

    /// Decode the `{context, value}` envelope of the notification result.
    pub fn payload(&self) -> Result<NotificationPayload, RpcError> {
        serde_json::from_value(self.params.result.clone()).map_err(|e| {
            RpcError::MalformedMessage(format!("{} payload: {e}", self.method))
        })
    }
}

/// `context` of a notification result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationContext {
    pub slot: u64,
}

/// The payload delivered to subscribers: the slot the node observed the
/// change at, and the kind-specific value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub context: NotificationContext,
    pub value: Value,
}

impl NotificationPayload {
    pub fn slot(&self) -> u64 {
        self.context.slot
    }
}

/// One parsed inbound message.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl InboundMessage {
    /// Parse a text frame into its messages.
    ///
    /// Batch arrays yield one message per well-formed element; malformed
    /// elements are logged and skipped. Bare objects yield one. The frame is
    /// rejected only when nothing in it parses.
    pub fn parse_frame(text: &str) -> Result<Vec<InboundMessage>, RpcError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| RpcError::MalformedMessage(format!("invalid JSON: {e}")))?;

        let items = match value {
            Value::Array(items) => items,
            other => return Ok(vec![Self::from_value(other)?]),
        };
        let mut messages = Vec::with_capacity(items.len());
        let mut first_error = None;
        for item in items {
            match Self::from_value(item) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed batch element");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if messages.is_empty() => Err(e),
            _ => Ok(messages),
        }
    }

    fn from_value(value: Value) -> Result<InboundMessage, RpcError> {
        let Some(obj) = value.as_object() else {
            return Err(RpcError::MalformedMessage("frame element is not an object".into()));
        };

        if obj.contains_key("id") && !obj.contains_key("method") {
            serde_json::from_value(value)
                .map(InboundMessage::Response)
                .map_err(|e| RpcError::MalformedMessage(format!("response: {e}")))
        } else if obj.contains_key("method") {
            serde_json::from_value(value)
                .map(InboundMessage::Notification)
                .map_err(|e| RpcError::MalformedMessage(format!("notification: {e}")))
        } else {
            Err(RpcError::MalformedMessage(
                "message has neither `id` nor `method`".into(),
            ))
        }
    }
}
