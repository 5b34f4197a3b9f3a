//! `WsSession` — one persistent connection with request correlation and
//! subscription routing wired together.
//!
//! A single router task consumes the transport's events in socket order and
//! fans them out: responses to the [`CorrelationRegistry`], notifications
//! to the [`SubscriptionManager`], lifecycle markers to both.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use ledgerrpc_core::client::RpcClient;
use ledgerrpc_core::config::WsConfig;
use ledgerrpc_core::error::RpcError;
use ledgerrpc_core::request::{InboundMessage, JsonRpcRequest, JsonRpcResponse};
use ledgerrpc_core::transport::{HealthStatus, RpcTransport};

use crate::correlation::CorrelationRegistry;
use crate::lock;
use crate::subscriptions::{Subscription, SubscriptionKey, SubscriptionManager};
use crate::transport::{ConnectionState, Transport, TransportEvent};

struct SessionInner {
    transport: Transport,
    registry: CorrelationRegistry,
    subscriptions: SubscriptionManager,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.transport.shutdown_now();
        if let Some(router) = lock(&self.router).take() {
            router.abort();
        }
    }
}

/// Process-scoped connection state. Cheap to clone; the connection closes
/// when the last clone is dropped or [`disconnect`](Self::disconnect) is called.
#[derive(Clone)]
pub struct WsSession {
    inner: Arc<SessionInner>,
}

impl WsSession {
    /// Start connecting to `url` in the background. Must be called inside a
    /// Tokio runtime.
    pub fn start(url: impl Into<String>, config: WsConfig) -> Self {
        let timeout = config.request_timeout();
        let transport = Transport::new(url, config);
        let registry = CorrelationRegistry::new(transport.clone(), timeout);
        let subscriptions = SubscriptionManager::new(transport.clone(), registry.clone());

        // Attach before connecting so the first `Opened` is observed.
        let events = transport.router_events();
        let router = tokio::spawn(route(events, registry.clone(), subscriptions.clone()));
        transport.connect();

        Self {
            inner: Arc::new(SessionInner {
                transport,
                registry,
                subscriptions,
                router: Mutex::new(Some(router)),
            }),
        }
    }

    /// Start and wait for the first successful connection.
    pub async fn connect(url: impl Into<String>, config: WsConfig) -> Result<Self, RpcError> {
        let session = Self::start(url, config);
        session.ready().await?;
        Ok(session)
    }

    /// Wait until the socket is open.
    pub async fn ready(&self) -> Result<(), RpcError> {
        self.inner.transport.wait_open().await
    }

    /// Clean close: no reconnect. Outstanding requests fail with
    /// `ConnectionLost` and every subscription stream ends.
    pub async fn disconnect(&self) {
        self.inner.transport.disconnect().await;
        self.inner.registry.reject_all();
        self.inner.subscriptions.close_all();
        if let Some(router) = lock(&self.inner.router).take() {
            router.abort();
        }
        tracing::info!(url = %self.inner.transport.url(), "session closed");
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.inner.registry
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.inner.subscriptions
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.transport.state()
    }

    /// Correlated call over the socket.
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        self.inner.registry.request(method, params).await
    }

    pub async fn subscribe(&self, key: SubscriptionKey) -> Result<Subscription, RpcError> {
        self.inner.subscriptions.subscribe(key).await
    }

    /// Typed client that sends its calls over this session.
    pub fn client(&self) -> RpcClient {
        RpcClient::new(Arc::new(self.clone()))
    }
}

#[async_trait]
impl RpcTransport for WsSession {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, RpcError> {
        self.inner.registry.exchange(req).await
    }

    fn health(&self) -> HealthStatus {
        match self.inner.transport.current_state() {
            ConnectionState::Open => HealthStatus::Healthy,
            ConnectionState::Connecting => HealthStatus::Degraded,
            ConnectionState::Closed => HealthStatus::Unhealthy,
        }
    }

    fn url(&self) -> &str {
        self.inner.transport.url()
    }
}

/// Router task: the only consumer of the lossless event feed for a session.
async fn route(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    registry: CorrelationRegistry,
    subscriptions: SubscriptionManager,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Opened => subscriptions.on_connection_opened(),
            TransportEvent::Closed => {
                let orphaned = registry.reject_all();
                if orphaned > 0 {
                    tracing::debug!(count = orphaned, "rejected in-flight requests");
                }
                subscriptions.on_connection_lost();
            }
            TransportEvent::Message(InboundMessage::Response(resp)) => {
                // Subscription ids are recorded before the waiter wakes.
                subscriptions.on_response(&resp);
                registry.resolve(resp);
            }
            TransportEvent::Message(InboundMessage::Notification(n)) => {
                subscriptions.dispatch(&n);
            }
        }
    }
}
