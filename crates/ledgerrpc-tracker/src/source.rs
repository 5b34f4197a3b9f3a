//! What the tracker needs from the outside world, and the real
//! implementations backed by a WebSocket session and an RPC client.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

use ledgerrpc_core::client::RpcClient;
use ledgerrpc_core::commitment::Commitment;
use ledgerrpc_core::error::RpcError;
use ledgerrpc_core::request::NotificationPayload;
use ledgerrpc_core::types::SignatureStatus;
use ledgerrpc_ws::{SubscriptionKey, SubscriptionManager, WsSession};

/// Push updates for a signature at one commitment level.
///
/// Dropping the returned stream releases the underlying subscription.
#[async_trait]
pub trait SignatureFeed: Send + Sync + 'static {
    async fn signature_updates(
        &self,
        signature: &str,
        commitment: Commitment,
    ) -> Result<BoxStream<'static, NotificationPayload>, RpcError>;
}

/// Request/response lookups used by the poll loop.
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    async fn signature_status(&self, signature: &str) -> Result<Option<SignatureStatus>, RpcError>;

    async fn transaction_details(&self, signature: &str) -> Result<Option<Value>, RpcError>;
}

#[async_trait]
impl SignatureFeed for SubscriptionManager {
    async fn signature_updates(
        &self,
        signature: &str,
        commitment: Commitment,
    ) -> Result<BoxStream<'static, NotificationPayload>, RpcError> {
        let subscription = self
            .subscribe(SubscriptionKey::signature(signature, commitment))
            .await?;
        Ok(subscription.boxed())
    }
}

#[async_trait]
impl SignatureFeed for WsSession {
    async fn signature_updates(
        &self,
        signature: &str,
        commitment: Commitment,
    ) -> Result<BoxStream<'static, NotificationPayload>, RpcError> {
        self.subscriptions()
            .signature_updates(signature, commitment)
            .await
    }
}

#[async_trait]
impl StatusSource for RpcClient {
    async fn signature_status(&self, signature: &str) -> Result<Option<SignatureStatus>, RpcError> {
        self.get_signature_status(signature).await
    }

    async fn transaction_details(&self, signature: &str) -> Result<Option<Value>, RpcError> {
        self.get_transaction(signature).await
    }
}
