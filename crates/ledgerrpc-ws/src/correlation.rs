//! Correlation of outgoing requests with their responses.
//!
//! Every request gets a fresh string id; the response carrying that id
//! resolves exactly that waiter, whatever order responses arrive in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time;

use ledgerrpc_core::error::RpcError;
use ledgerrpc_core::request::{JsonRpcRequest, JsonRpcResponse, RpcId};

use crate::lock;
use crate::transport::Transport;

type Waiter = oneshot::Sender<Result<JsonRpcResponse, RpcError>>;

struct PendingRequest {
    method: String,
    waiter: Waiter,
}

/// Map of outstanding requests on the shared transport. Cheap to clone.
#[derive(Clone)]
pub struct CorrelationRegistry {
    transport: Transport,
    pending: Arc<Mutex<HashMap<RpcId, PendingRequest>>>,
    timeout: Duration,
}

impl CorrelationRegistry {
    pub fn new(transport: Transport, timeout: Duration) -> Self {
        Self {
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Send `method(params)` and await its result.
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        self.request_with(JsonRpcRequest::new(method, params)).await
    }

    /// Send a pre-built request and await its result.
    pub async fn request_with(&self, req: JsonRpcRequest) -> Result<Value, RpcError> {
        self.exchange(req).await?.into_result().map_err(RpcError::Rpc)
    }

    /// Send a pre-built request and await the raw response.
    ///
    /// Waits for the connection to open first. Dropping the returned future
    /// does not cancel the call on the server.
    pub async fn exchange(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, RpcError> {
        self.timed(req, true).await
    }

    /// Like [`exchange`](Self::exchange) but fails with
    /// [`RpcError::ConnectionLost`] instead of waiting for the socket.
    pub(crate) async fn exchange_now(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, RpcError> {
        self.timed(req, false).await
    }

    async fn timed(&self, req: JsonRpcRequest, wait_open: bool) -> Result<JsonRpcResponse, RpcError> {
        let id = req.id.clone();
        let outcome = time::timeout(self.timeout, async {
            if wait_open {
                self.transport.wait_open().await?;
            }
            let frame = req.to_frame()?;
            let rx = self.register(&req);
            if let Err(e) = self.transport.send(frame) {
                self.forget(&req.id);
                return Err(e);
            }
            tracing::trace!(id = %req.id, method = %req.method, "request sent");
            // Sender dropped without a value: the map was cleared.
            rx.await.unwrap_or(Err(RpcError::ConnectionLost))
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                self.forget(&id);
                Err(RpcError::Timeout {
                    ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Store a waiter for `req`.
    pub(crate) fn register(&self, req: &JsonRpcRequest) -> oneshot::Receiver<Result<JsonRpcResponse, RpcError>> {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(
            req.id.clone(),
            PendingRequest {
                method: req.method.clone(),
                waiter: tx,
            },
        );
        rx
    }

    fn forget(&self, id: &RpcId) {
        lock(&self.pending).remove(id);
    }

    /// Deliver a response to its waiter. Returns `false` for unknown ids.
    pub fn resolve(&self, resp: JsonRpcResponse) -> bool {
        let Some(pending) = lock(&self.pending).remove(&resp.id) else {
            tracing::trace!(id = %resp.id, "response for unknown id dropped");
            return false;
        };
        tracing::trace!(id = %resp.id, method = %pending.method, "response matched");
        // The caller may have stopped waiting; the response is simply discarded.
        let _ = pending.waiter.send(Ok(resp));
        true
    }

    /// Reject every outstanding request with [`RpcError::ConnectionLost`].
    pub fn reject_all(&self) -> usize {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        let count = drained.len();
        for (id, pending) in drained {
            tracing::debug!(id = %id, method = %pending.method, "request orphaned by connection loss");
            let _ = pending.waiter.send(Err(RpcError::ConnectionLost));
        }
        count
    }

    /// Number of requests awaiting a response.
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }
}
