//! Error types shared by every LedgerRPC transport and service.

use thiserror::Error;

use crate::request::JsonRpcError;

/// Errors that can occur during an RPC operation.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The connection carrying a pending request closed before a response
    /// arrived. Subscriptions recover on their own; requests do not.
    #[error("connection lost before the request completed")]
    ConnectionLost,

    /// JSON-RPC error object returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// No wallet is able to sign, or signing was rejected.
    #[error("signing failed: {0}")]
    Signing(String),

    /// An inbound frame could not be parsed or lacked the expected shape.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// HTTP request failed (connection refused, non-2xx status, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket connect/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Request timed out after the configured duration.
    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// A result could not be deserialized into the requested type.
    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// The session was explicitly disconnected.
    #[error("session closed")]
    Closed,

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl RpcError {
    /// Returns `true` if this error is transient and the call may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::WebSocket(_) | Self::Timeout { .. } | Self::ConnectionLost
        )
    }

    /// Returns `true` if the node itself rejected the request.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(RpcError::ConnectionLost.is_retryable());
        assert!(RpcError::Timeout { ms: 10 }.is_retryable());
        assert!(!RpcError::Signing("no wallet".into()).is_retryable());

        let rpc = RpcError::Rpc(JsonRpcError {
            code: -32002,
            message: "Transaction simulation failed".into(),
            data: None,
        });
        assert!(!rpc.is_retryable());
        assert!(rpc.is_server_error());
        assert_eq!(
            rpc.to_string(),
            "RPC error -32002: Transaction simulation failed"
        );
    }
}
