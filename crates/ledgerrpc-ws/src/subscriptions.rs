//! Subscription multiplexing over the shared socket.
//!
//! Handles are grouped by [`SubscriptionKey`]; one server subscription
//! serves every handle attached to a key. Server subscription ids are only
//! valid for one connection: on `Closed` every entry falls back to
//! `Pending`, and on `Opened` each pending key is subscribed again. Handles
//! keep receiving across reconnects without noticing.

use std::collections::HashMap;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time;

use ledgerrpc_core::commitment::Commitment;
use ledgerrpc_core::error::RpcError;
use ledgerrpc_core::policy::Backoff;
use ledgerrpc_core::request::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, NotificationPayload, RpcId,
};

use crate::correlation::CorrelationRegistry;
use crate::lock;
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Server-side subscription families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Account,
    Signature,
    Program,
    Logs,
}

impl SubscriptionKind {
    pub const ALL: [SubscriptionKind; 4] = [
        SubscriptionKind::Account,
        SubscriptionKind::Signature,
        SubscriptionKind::Program,
        SubscriptionKind::Logs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Signature => "signature",
            Self::Program => "program",
            Self::Logs => "logs",
        }
    }

    pub fn subscribe_method(&self) -> String {
        format!("{}Subscribe", self.as_str())
    }

    pub fn unsubscribe_method(&self) -> String {
        format!("{}Unsubscribe", self.as_str())
    }

    pub fn notification_method(&self) -> String {
        format!("{}Notification", self.as_str())
    }
}

impl std::fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionKind {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| RpcError::Other(format!("unknown subscription kind: {s}")))
    }
}

/// Identity of a server subscription: what is watched, how, at which level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    /// Account or program address, transaction signature, or the address
    /// mentioned in logs (`"all"` / `"allWithVotes"` for the log firehose).
    pub resource: String,
    pub kind: SubscriptionKind,
    pub commitment: Commitment,
}

impl SubscriptionKey {
    pub fn new(kind: SubscriptionKind, resource: impl Into<String>, commitment: Commitment) -> Self {
        Self {
            resource: resource.into(),
            kind,
            commitment,
        }
    }

    pub fn account(address: impl Into<String>, commitment: Commitment) -> Self {
        Self::new(SubscriptionKind::Account, address, commitment)
    }

    pub fn signature(signature: impl Into<String>, commitment: Commitment) -> Self {
        Self::new(SubscriptionKind::Signature, signature, commitment)
    }

    pub fn program(program_id: impl Into<String>, commitment: Commitment) -> Self {
        Self::new(SubscriptionKind::Program, program_id, commitment)
    }

    pub fn logs(mentions: impl Into<String>, commitment: Commitment) -> Self {
        Self::new(SubscriptionKind::Logs, mentions, commitment)
    }

    /// Positional params of the `<kind>Subscribe` call.
    pub fn subscribe_params(&self) -> Vec<Value> {
        let commitment = self.commitment.as_str();
        match self.kind {
            SubscriptionKind::Account | SubscriptionKind::Program => vec![
                json!(self.resource),
                json!({ "encoding": "base64", "commitment": commitment }),
            ],
            SubscriptionKind::Signature => {
                vec![json!(self.resource), json!({ "commitment": commitment })]
            }
            SubscriptionKind::Logs => {
                let filter = match self.resource.as_str() {
                    "all" | "allWithVotes" => json!(self.resource),
                    address => json!({ "mentions": [address] }),
                };
                vec![filter, json!({ "commitment": commitment })]
            }
        }
    }

    pub fn subscribe_request(&self) -> JsonRpcRequest {
        JsonRpcRequest::new(self.kind.subscribe_method(), self.subscribe_params())
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.kind, self.resource, self.commitment)
    }
}

/// Lifecycle of a subscription as seen by one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Waiting for a server id (first subscribe or after a reconnect).
    Pending,
    /// Server id recorded; notifications are routed.
    Active,
    /// The handle is detached or the manager was shut down.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

type HandleId = u64;

struct Entry {
    subscription_id: Option<u64>,
    state: SubscriptionState,
    /// Correlation id of the subscribe request in flight, if any.
    inflight: Option<RpcId>,
    handles: HashMap<HandleId, mpsc::UnboundedSender<NotificationPayload>>,
}

/// What a subscribe response meant for the table.
#[derive(Debug)]
enum Completion {
    NotOurs,
    Activated { key: SubscriptionKey, id: u64 },
    Failed { key: SubscriptionKey, error: RpcError },
    /// Every handle left while the subscribe was in flight.
    Orphaned { kind: SubscriptionKind, id: u64 },
}

#[derive(Debug, PartialEq)]
enum Detach {
    Unknown,
    StillShared,
    Removed {
        kind: SubscriptionKind,
        subscription_id: Option<u64>,
    },
}

/// Routing state. Every method is synchronous; callers hold the mutex
/// only for the call.
#[derive(Default)]
struct SubscriptionTable {
    entries: HashMap<SubscriptionKey, Entry>,
    by_id: HashMap<u64, SubscriptionKey>,
    inflight: HashMap<RpcId, SubscriptionKey>,
    next_handle: HandleId,
}

impl SubscriptionTable {
    fn attach(&mut self, key: &SubscriptionKey) -> (HandleId, mpsc::UnboundedReceiver<NotificationPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.next_handle += 1;
        let handle = self.next_handle;
        self.entries
            .entry(key.clone())
            .or_insert_with(|| Entry {
                subscription_id: None,
                state: SubscriptionState::Pending,
                inflight: None,
                handles: HashMap::new(),
            })
            .handles
            .insert(handle, tx);
        (handle, rx)
    }

    /// Build the subscribe request for a pending key, unless one is in flight.
    fn begin_subscribe(&mut self, key: &SubscriptionKey) -> Option<JsonRpcRequest> {
        let entry = self.entries.get_mut(key)?;
        if entry.state != SubscriptionState::Pending || entry.inflight.is_some() {
            return None;
        }
        let req = key.subscribe_request();
        entry.inflight = Some(req.id.clone());
        self.inflight.insert(req.id.clone(), key.clone());
        Some(req)
    }

    fn complete(&mut self, resp: &JsonRpcResponse) -> Completion {
        let Some(key) = self.inflight.remove(&resp.id) else {
            return Completion::NotOurs;
        };
        let server_id = resp.result.as_ref().and_then(Value::as_u64);

        let entry = match self.entries.get_mut(&key) {
            Some(entry) if entry.inflight.as_ref() == Some(&resp.id) => entry,
            _ => {
                return match server_id {
                    Some(id) => Completion::Orphaned { kind: key.kind, id },
                    None => Completion::NotOurs,
                }
            }
        };
        entry.inflight = None;

        if let Some(err) = &resp.error {
            return Completion::Failed {
                key,
                error: RpcError::Rpc(err.clone()),
            };
        }
        match server_id {
            Some(id) => {
                entry.subscription_id = Some(id);
                entry.state = SubscriptionState::Active;
                self.by_id.insert(id, key.clone());
                Completion::Activated { key, id }
            }
            None => Completion::Failed {
                key,
                error: RpcError::MalformedMessage(format!(
                    "subscribe result is not an integer id: {:?}",
                    resp.result
                )),
            },
        }
    }

    /// Forget an in-flight marker whose response will never be processed.
    /// A late response for it is then treated as orphaned.
    fn abandon(&mut self, key: &SubscriptionKey, id: &RpcId) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.inflight.as_ref() == Some(id) {
                entry.inflight = None;
            }
        }
    }

    fn detach(&mut self, key: &SubscriptionKey, handle: HandleId) -> Detach {
        let Some(entry) = self.entries.get_mut(key) else {
            return Detach::Unknown;
        };
        if entry.handles.remove(&handle).is_none() {
            return Detach::Unknown;
        }
        if !entry.handles.is_empty() {
            return Detach::StillShared;
        }
        let subscription_id = self.entries.remove(key).and_then(|e| e.subscription_id);
        if let Some(id) = subscription_id {
            self.by_id.remove(&id);
        }
        Detach::Removed {
            kind: key.kind,
            subscription_id,
        }
    }

    /// Deliver a notification to every handle of its key. Returns the number
    /// of handles reached.
    fn route(&self, notification: &JsonRpcNotification, payload: &NotificationPayload) -> usize {
        let Some(key) = self.by_id.get(&notification.params.subscription) else {
            return 0;
        };
        if notification.kind() != Some(key.kind.as_str()) {
            return 0;
        }
        self.entries
            .get(key)
            .map(|entry| {
                entry
                    .handles
                    .values()
                    .filter(|tx| tx.send(payload.clone()).is_ok())
                    .count()
            })
            .unwrap_or(0)
    }

    fn connection_lost(&mut self) -> usize {
        self.by_id.clear();
        self.inflight.clear();
        let mut demoted = 0;
        for entry in self.entries.values_mut() {
            if entry.state == SubscriptionState::Active {
                demoted += 1;
            }
            entry.state = SubscriptionState::Pending;
            entry.subscription_id = None;
            entry.inflight = None;
        }
        demoted
    }

    fn pending_keys(&self) -> Vec<SubscriptionKey> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == SubscriptionState::Pending && e.inflight.is_none())
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn handle_state(&self, key: &SubscriptionKey, handle: HandleId) -> SubscriptionState {
        match self.entries.get(key) {
            Some(entry) if entry.handles.contains_key(&handle) => entry.state,
            _ => SubscriptionState::Cancelled,
        }
    }

    fn close_all(&mut self) {
        self.entries.clear();
        self.by_id.clear();
        self.inflight.clear();
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns every subscription on one transport. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionManager {
    table: Arc<Mutex<SubscriptionTable>>,
    transport: Transport,
    registry: CorrelationRegistry,
}

impl SubscriptionManager {
    pub fn new(transport: Transport, registry: CorrelationRegistry) -> Self {
        Self {
            table: Arc::new(Mutex::new(SubscriptionTable::default())),
            transport,
            registry,
        }
    }

    /// Attach a handle to `key`, subscribing on the server if this is the
    /// first handle for it.
    ///
    /// While the connection is down the handle is returned `Pending` and
    /// the subscribe goes out once the socket opens. A server error or a
    /// timeout on the initial subscribe is returned as an error; handles
    /// that attached to the key meanwhile stay `Pending` and the subscribe
    /// is retried with backoff.
    pub async fn subscribe(&self, key: SubscriptionKey) -> Result<Subscription, RpcError> {
        let (handle, rx, request) = {
            let mut table = lock(&self.table);
            let (handle, rx) = table.attach(&key);
            let request = if self.transport.is_open() {
                table.begin_subscribe(&key)
            } else {
                None
            };
            (handle, rx, request)
        };
        let subscription = Subscription {
            manager: self.clone(),
            key: key.clone(),
            handle,
            rx,
            detached: false,
        };

        let Some(req) = request else {
            tracing::debug!(key = %key, "attached to subscription");
            return Ok(subscription);
        };

        tracing::debug!(key = %key, id = %req.id, "subscribing");
        match self.send_subscribe(&key, req).await {
            Ok(_) => Ok(subscription),
            Err(RpcError::ConnectionLost) => {
                tracing::debug!(key = %key, "connection lost during subscribe, will resubscribe");
                Ok(subscription)
            }
            Err(e) => {
                drop(subscription);
                if lock(&self.table).entries.contains_key(&key) {
                    tracing::warn!(key = %key, error = %e, "subscribe failed, retrying for remaining handles");
                    self.keep_subscribing(key, None);
                }
                Err(e)
            }
        }
    }

    /// Send one subscribe request and return the server id. Activation is
    /// recorded by `on_response`; an unanswered request is abandoned.
    async fn send_subscribe(&self, key: &SubscriptionKey, req: JsonRpcRequest) -> Result<u64, RpcError> {
        let id = req.id.clone();
        match self.registry.exchange_now(req).await {
            Ok(resp) => {
                if let Some(err) = resp.error {
                    return Err(RpcError::Rpc(err));
                }
                resp.result.as_ref().and_then(Value::as_u64).ok_or_else(|| {
                    RpcError::MalformedMessage("subscribe result is not an integer id".into())
                })
            }
            Err(e) => {
                lock(&self.table).abandon(key, &id);
                Err(e)
            }
        }
    }

    /// Drive `key` to `Active` in the background. `first` goes out at once;
    /// after a failure the next attempt waits for the reconnect backoff.
    /// Stops once the key is active, has no handles left, or the socket
    /// closes (the next `Opened` takes over).
    fn keep_subscribing(&self, key: SubscriptionKey, first: Option<JsonRpcRequest>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut backoff = Backoff::new(manager.transport.config().reconnect.clone());
            let mut next = first;
            loop {
                let req = match next.take() {
                    Some(req) => req,
                    None => {
                        time::sleep(backoff.next_delay()).await;
                        if !manager.transport.is_open() {
                            return;
                        }
                        match lock(&manager.table).begin_subscribe(&key) {
                            Some(req) => req,
                            None => return,
                        }
                    }
                };
                match manager.send_subscribe(&key, req).await {
                    Ok(_) | Err(RpcError::ConnectionLost) => return,
                    Err(e) => tracing::warn!(
                        key = %key,
                        error = %e,
                        attempt = backoff.attempts() + 1,
                        "subscribe failed, retrying"
                    ),
                }
            }
        });
    }

    /// Record the outcome of a subscribe response. Must run before the
    /// response resolves its waiter so later notifications find the id.
    pub(crate) fn on_response(&self, resp: &JsonRpcResponse) {
        let completion = lock(&self.table).complete(resp);
        match completion {
            Completion::NotOurs => {}
            Completion::Activated { key, id } => {
                tracing::debug!(key = %key, subscription = id, "subscription active");
            }
            Completion::Failed { key, error } => {
                tracing::warn!(key = %key, error = %error, "subscribe failed");
            }
            Completion::Orphaned { kind, id } => {
                tracing::debug!(kind = %kind, subscription = id, "releasing orphaned subscription");
                self.release_in_background(kind, id);
            }
        }
    }

    /// Route a notification to the handles of its subscription.
    pub(crate) fn dispatch(&self, notification: &JsonRpcNotification) {
        let payload = match notification.payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(method = %notification.method, error = %e, "dropping notification");
                return;
            }
        };
        let delivered = lock(&self.table).route(notification, &payload);
        if delivered == 0 {
            tracing::trace!(
                method = %notification.method,
                subscription = notification.params.subscription,
                "notification for unknown subscription dropped"
            );
        }
    }

    pub(crate) fn on_connection_lost(&self) {
        let demoted = lock(&self.table).connection_lost();
        if demoted > 0 {
            tracing::info!(count = demoted, "subscriptions pending until reconnect");
        }
    }

    /// Subscribe every pending key again on the fresh socket.
    pub(crate) fn on_connection_opened(&self) {
        let requests: Vec<_> = {
            let mut table = lock(&self.table);
            table
                .pending_keys()
                .into_iter()
                .filter_map(|key| table.begin_subscribe(&key).map(|req| (key, req)))
                .collect()
        };
        if requests.is_empty() {
            return;
        }
        tracing::info!(count = requests.len(), "resubscribing");

        for (key, req) in requests {
            self.keep_subscribing(key, Some(req));
        }
    }

    /// Drop every handle's sender; open streams end.
    pub(crate) fn close_all(&self) {
        lock(&self.table).close_all();
    }

    /// Number of distinct server subscriptions (keys).
    pub fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current server id for `key`, if active.
    pub fn subscription_id(&self, key: &SubscriptionKey) -> Option<u64> {
        lock(&self.table)
            .entries
            .get(key)
            .and_then(|e| e.subscription_id)
    }

    fn detach(&self, key: &SubscriptionKey, handle: HandleId) -> Detach {
        lock(&self.table).detach(key, handle)
    }

    /// Send `<kind>Unsubscribe([id])` if the socket is open. Ids from a
    /// closed socket are already void on the server.
    async fn release(&self, kind: SubscriptionKind, id: u64) -> Result<bool, RpcError> {
        if !self.transport.is_open() {
            return Ok(false);
        }
        let req = JsonRpcRequest::new(kind.unsubscribe_method(), vec![json!(id)]);
        let resp = self.registry.exchange_now(req).await?;
        let value = resp.into_result().map_err(RpcError::Rpc)?;
        tracing::debug!(kind = %kind, subscription = id, "unsubscribed");
        Ok(value.as_bool().unwrap_or(false))
    }

    fn release_in_background(&self, kind: SubscriptionKind, id: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(kind = %kind, subscription = id, "no runtime, unsubscribe skipped");
            return;
        };
        let manager = self.clone();
        runtime.spawn(async move {
            if let Err(e) = manager.release(kind, id).await {
                tracing::debug!(kind = %kind, subscription = id, error = %e, "unsubscribe failed");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// One consumer's view of a subscription: an unbounded stream of
/// notification payloads. Dropping it unsubscribes in the background.
pub struct Subscription {
    manager: SubscriptionManager,
    key: SubscriptionKey,
    handle: HandleId,
    rx: mpsc::UnboundedReceiver<NotificationPayload>,
    detached: bool,
}

impl Subscription {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn state(&self) -> SubscriptionState {
        if self.detached {
            return SubscriptionState::Cancelled;
        }
        lock(&self.manager.table).handle_state(&self.key, self.handle)
    }

    /// Server id currently backing this handle.
    pub fn subscription_id(&self) -> Option<u64> {
        if self.detached {
            return None;
        }
        self.manager.subscription_id(&self.key)
    }

    /// Next notification; `None` once the manager shuts down.
    pub async fn next(&mut self) -> Option<NotificationPayload> {
        self.rx.recv().await
    }

    /// Detach this handle. If it was the last one for its key, the server
    /// subscription is released and the server's answer returned.
    pub async fn unsubscribe(mut self) -> Result<bool, RpcError> {
        self.detached = true;
        match self.manager.detach(&self.key, self.handle) {
            Detach::Removed {
                kind,
                subscription_id: Some(id),
            } => self.manager.release(kind, id).await,
            _ => Ok(true),
        }
    }
}

impl Stream for Subscription {
    type Item = NotificationPayload;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Detach::Removed {
            kind,
            subscription_id: Some(id),
        } = self.manager.detach(&self.key, self.handle)
        {
            self.manager.release_in_background(kind, id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("handle", &self.handle)
            .finish()
    }
}
