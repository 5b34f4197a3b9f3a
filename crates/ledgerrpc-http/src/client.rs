//! HTTP JSON-RPC client backed by `reqwest`.
//!
//! Features:
//! - Single-element batch framing (`[{…}]`), matching the WebSocket framing
//! - Automatic retry with exponential backoff for transient errors
//! - Accepts batched (`[{…}]`) or bare (`{…}`) response bodies

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use ledgerrpc_core::config::HttpConfig;
use ledgerrpc_core::error::RpcError;
use ledgerrpc_core::policy::RetryPolicy;
use ledgerrpc_core::request::{JsonRpcRequest, JsonRpcResponse};
use ledgerrpc_core::transport::{HealthStatus, RpcTransport};

/// HTTP JSON-RPC client for one-shot calls.
pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl HttpRpcClient {
    /// Create a new client for the given JSON-RPC endpoint URL.
    pub fn new(url: impl Into<String>, config: HttpConfig) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| RpcError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            http,
            retry: RetryPolicy::new(config.retry.clone()),
            request_timeout: config.request_timeout(),
        })
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Result<Self, RpcError> {
        Self::new(url, HttpConfig::default())
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, RpcError> {
        let resp = self
            .http
            .post(&self.url)
            .json(std::slice::from_ref(req))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout {
                        ms: self.request_timeout.as_millis() as u64,
                    }
                } else {
                    RpcError::Http(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RpcError::Http(format!("HTTP {status}: {body}")));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| RpcError::Http(e.to_string()))?;
        first_response(body)
    }
}

/// Extract the response from a batched or bare response body.
fn first_response(body: Value) -> Result<JsonRpcResponse, RpcError> {
    let single = match body {
        Value::Array(items) => items
            .into_iter()
            .next()
            .ok_or_else(|| RpcError::MalformedMessage("empty batch response".into()))?,
        other => other,
    };
    serde_json::from_value(single)
        .map_err(|e| RpcError::MalformedMessage(format!("response: {e}")))
}

#[async_trait]
impl RpcTransport for HttpRpcClient {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, RpcError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(&req).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            url = %self.url,
                            method = %req.method,
                            "retrying request"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(
                            attempt,
                            error = %e,
                            url = %self.url,
                            method = %req.method,
                            "max retries exceeded"
                        );
                        return Err(e);
                    }
                },
                // Server-side errors arrive as Ok(JsonRpcResponse); anything
                // else here is malformed output and not worth retrying.
                Err(e) => return Err(e),
            }
        }
    }

    fn health(&self) -> HealthStatus {
        HealthStatus::Unknown
    }

    fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerrpc_core::policy::RetryConfig;
    use ledgerrpc_core::RpcClient;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn batched_and_bare_bodies() {
        let batched = first_response(json!([{"jsonrpc": "2.0", "id": "x", "result": 7}])).unwrap();
        assert_eq!(batched.result, Some(json!(7)));

        let bare = first_response(json!({"jsonrpc": "2.0", "id": "x", "result": true})).unwrap();
        assert_eq!(bare.result, Some(json!(true)));

        assert!(matches!(
            first_response(json!([])),
            Err(RpcError::MalformedMessage(_))
        ));
    }

    /// Minimal one-connection-per-request HTTP responder. Echoes the request
    /// id back with `result` set to the request's method name.
    async fn spawn_echo_node(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let body = loop {
                        let n = sock.read(&mut chunk).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        let text = String::from_utf8_lossy(&buf).to_string();
                        if let Some(split) = text.find("\r\n\r\n") {
                            let len = text[..split]
                                .lines()
                                .find_map(|l| {
                                    let lower = l.to_ascii_lowercase();
                                    lower
                                        .strip_prefix("content-length:")
                                        .map(|v| v.trim().parse::<usize>().unwrap())
                                })
                                .unwrap_or(0);
                            if buf.len() >= split + 4 + len {
                                break text[split + 4..split + 4 + len].to_string();
                            }
                        }
                    };
                    let req: Value = serde_json::from_str(&body).unwrap();
                    let reply = json!([{
                        "jsonrpc": "2.0",
                        "id": req[0]["id"],
                        "result": req[0]["method"],
                    }])
                    .to_string();
                    let resp = format!(
                        "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
                        reply.len()
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn call_round_trips_through_http() {
        let url = spawn_echo_node("200 OK").await;
        let client = RpcClient::new(Arc::new(HttpRpcClient::default_for(url).unwrap()));
        let method: String = client.call("getHealth", vec![]).await.unwrap();
        assert_eq!(method, "getHealth");
    }

    #[tokio::test]
    async fn non_success_status_is_retried_then_surfaced() {
        let url = spawn_echo_node("503 Service Unavailable").await;
        let config = HttpConfig {
            retry: RetryConfig {
                max_retries: 1,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
                multiplier: 1.0,
                jitter_fraction: 0.0,
            },
            ..HttpConfig::default()
        };
        let client = HttpRpcClient::new(url, config).unwrap();
        let err = client
            .send(JsonRpcRequest::new("getHealth", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Http(msg) if msg.starts_with("HTTP 503")));
    }
}
