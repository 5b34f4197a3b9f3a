//! The `RpcTransport` trait — one-shot request/response over any channel.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::RpcError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// Transport health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Transport is responding normally.
    Healthy,
    /// Transport is reconnecting or retrying.
    Degraded,
    /// Transport is not connected.
    Unhealthy,
    /// Health status is unknown (not yet checked).
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// The central async trait every request/response transport implements.
///
/// Implemented over HTTP (`ledgerrpc-http`) and over the persistent
/// WebSocket session (`ledgerrpc-ws`). Object-safe; stored as
/// `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the response.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, RpcError>;

    /// Return the current health status of this transport.
    fn health(&self) -> HealthStatus {
        HealthStatus::Unknown
    }

    /// Return the transport's identifier (URL or name).
    fn url(&self) -> &str;
}

/// Call a method and decode the result, surfacing server errors as
/// [`RpcError::Rpc`].
pub async fn call<T: DeserializeOwned>(
    transport: &dyn RpcTransport,
    method: &str,
    params: Vec<Value>,
) -> Result<T, RpcError> {
    let req = JsonRpcRequest::new(method, params);
    let resp = transport.send(req).await?;
    let result = resp.into_result().map_err(RpcError::Rpc)?;
    serde_json::from_value(result).map_err(RpcError::Deserialization)
}
