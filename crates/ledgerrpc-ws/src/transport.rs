//! The persistent WebSocket connection.
//!
//! A background task owns the socket. It publishes connection state on a
//! `watch` channel and every inbound message, plus `Opened` / `Closed`
//! lifecycle markers, in socket order on two outlets: a `broadcast` channel
//! for observers, which may lag and skip, and one unbounded router channel
//! that never drops an event. Unclean closure triggers a reconnect;
//! [`Transport::disconnect`] does not.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use ledgerrpc_core::config::WsConfig;
use ledgerrpc_core::error::RpcError;
use ledgerrpc_core::policy::Backoff;
use ledgerrpc_core::request::{InboundMessage, JsonRpcRequest};

use crate::lock;

/// A connection that stayed up at least this long resets the backoff.
const STABLE_CONNECTION: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Everything the transport publishes, in socket order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A new physical socket is open.
    Opened,
    /// One parsed inbound message.
    Message(InboundMessage),
    /// The current socket is gone. Sends fail until the next `Opened`.
    Closed,
}

struct Control {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Inner {
    url: String,
    config: WsConfig,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<TransportEvent>,
    /// Lossless feed for the session router.
    router_tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    /// Writer of the current socket; `None` while not open.
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    control: Mutex<Option<Control>>,
    connections: AtomicU64,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            tracing::debug!(url = %self.url, from = %prev, to = %state, "connection state");
        }
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(router) = lock(&self.router_tx).as_ref() {
            let _ = router.send(event.clone());
        }
        // No receivers is fine: nobody is listening yet.
        let _ = self.events_tx.send(event);
    }

    fn handle_frame(&self, text: &str) {
        match InboundMessage::parse_frame(text) {
            Ok(messages) => {
                for msg in messages {
                    self.emit(TransportEvent::Message(msg));
                }
            }
            Err(e) => {
                tracing::warn!(
                    url = %self.url,
                    error = %e,
                    frame = %text.chars().take(120).collect::<String>(),
                    "dropping malformed frame"
                );
            }
        }
    }
}

/// Handle to the shared WebSocket transport. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Create a transport for `url`. Nothing connects until [`connect`](Self::connect).
    pub fn new(url: impl Into<String>, config: WsConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                config,
                state_tx,
                events_tx,
                router_tx: Mutex::new(None),
                outbound: Mutex::new(None),
                control: Mutex::new(None),
                connections: AtomicU64::new(0),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn config(&self) -> &WsConfig {
        &self.inner.config
    }

    /// Start the connection task. No-op if it is already running.
    pub fn connect(&self) {
        let mut control = lock(&self.inner.control);
        if control.as_ref().is_some_and(|c| !c.task.is_finished()) {
            return;
        }
        let (shutdown, shutdown_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            run(inner, shutdown_rx).await;
        });
        *control = Some(Control { shutdown, task });
    }

    /// Clean close: stop the task, close the socket, do not reconnect.
    pub async fn disconnect(&self) {
        let control = lock(&self.inner.control).take();
        if let Some(control) = control {
            let _ = control.shutdown.send(());
            if let Err(e) = control.task.await {
                tracing::warn!(url = %self.inner.url, error = %e, "transport task ended abnormally");
            }
        }
        self.inner.set_state(ConnectionState::Closed);
    }

    /// Signal shutdown without waiting for the task. Used from `Drop`.
    pub(crate) fn shutdown_now(&self) {
        if let Some(control) = lock(&self.inner.control).take() {
            let _ = control.shutdown.send(());
        }
    }

    /// `true` while the connection task runs (between `connect` and `disconnect`).
    pub fn is_running(&self) -> bool {
        lock(&self.inner.control)
            .as_ref()
            .is_some_and(|c| !c.task.is_finished())
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.current_state() == ConnectionState::Open
    }

    /// Connection-state signal.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Inbound messages and lifecycle markers for observers. A receiver that
    /// falls more than `event_capacity` events behind skips the oldest ones.
    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Every event from now on, without loss. Replaces any earlier router
    /// receiver, which then ends.
    pub(crate) fn router_events(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.router_tx) = Some(tx);
        rx
    }

    /// Number of sockets opened so far.
    pub fn connections(&self) -> u64 {
        self.inner.connections.load(Ordering::Relaxed)
    }

    /// Wait until the connection is open.
    ///
    /// Fails with [`RpcError::Closed`] if the transport is not running.
    pub async fn wait_open(&self) -> Result<(), RpcError> {
        if !self.is_running() {
            return Err(RpcError::Closed);
        }
        let mut state = self.state();
        state
            .wait_for(|s| *s == ConnectionState::Open)
            .await
            .map(|_| ())
            .map_err(|_| RpcError::Closed)
    }

    /// Queue a text frame on the open socket.
    ///
    /// Fails with [`RpcError::ConnectionLost`] when no socket is open.
    pub fn send(&self, frame: String) -> Result<(), RpcError> {
        let outbound = lock(&self.inner.outbound);
        match outbound.as_ref() {
            Some(tx) => tx
                .send(Message::Text(frame))
                .map_err(|_| RpcError::ConnectionLost),
            None => Err(RpcError::ConnectionLost),
        }
    }

    /// Frame and queue a request.
    pub fn send_request(&self, req: &JsonRpcRequest) -> Result<(), RpcError> {
        self.send(req.to_frame()?)
    }
}

/// How a single connection ended.
enum ConnectionEnd {
    Shutdown,
    Dropped,
}

/// Connection task: connect, serve, reconnect until shut down.
async fn run(inner: Arc<Inner>, mut shutdown: oneshot::Receiver<()>) {
    let mut backoff = Backoff::new(inner.config.reconnect.clone());

    loop {
        inner.set_state(ConnectionState::Connecting);
        tracing::info!(url = %inner.url, "connecting via WebSocket");

        let attempt = tokio::select! {
            res = tokio_tungstenite::connect_async(inner.url.as_str()) => res,
            _ = &mut shutdown => break,
        };

        let delay = match attempt {
            Err(e) => {
                inner.set_state(ConnectionState::Closed);
                let delay = backoff.next_delay();
                tracing::warn!(
                    url = %inner.url,
                    error = %e,
                    attempt = backoff.attempts(),
                    "WS connect failed, retrying in {delay:?}"
                );
                delay
            }
            Ok((ws, _)) => {
                let opened_at = Instant::now();
                match serve(&inner, ws, &mut shutdown).await {
                    ConnectionEnd::Shutdown => break,
                    ConnectionEnd::Dropped if opened_at.elapsed() >= STABLE_CONNECTION => {
                        backoff.reset();
                        tracing::warn!(url = %inner.url, "WS disconnected, reconnecting");
                        Duration::ZERO
                    }
                    ConnectionEnd::Dropped => {
                        let delay = backoff.next_delay();
                        tracing::warn!(url = %inner.url, "WS dropped shortly after opening, reconnecting in {delay:?}");
                        delay
                    }
                }
            }
        };

        if !delay.is_zero() {
            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = &mut shutdown => break,
            }
        }
    }

    inner.set_state(ConnectionState::Closed);
    tracing::info!(url = %inner.url, "WS transport stopped");
}

/// Serve one open socket until it drops or shutdown is requested.
async fn serve(
    inner: &Inner,
    ws: WsStream,
    shutdown: &mut oneshot::Receiver<()>,
) -> ConnectionEnd {
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    *lock(&inner.outbound) = Some(out_tx);
    inner.connections.fetch_add(1, Ordering::Relaxed);
    inner.set_state(ConnectionState::Open);
    inner.emit(TransportEvent::Opened);
    tracing::info!(url = %inner.url, "WS connected");

    let period = inner.config.heartbeat_interval();
    let mut heartbeat = time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let end = loop {
        tokio::select! {
            _ = &mut *shutdown => {
                let _ = sink.send(Message::Close(None)).await;
                break ConnectionEnd::Shutdown;
            }
            Some(msg) = out_rx.recv() => {
                if let Err(e) = sink.send(msg).await {
                    tracing::warn!(url = %inner.url, error = %e, "WS send failed");
                    break ConnectionEnd::Dropped;
                }
            }
            _ = heartbeat.tick() => {
                let ping = match JsonRpcRequest::keepalive().to_frame() {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                tracing::trace!(url = %inner.url, "heartbeat");
                if let Err(e) = sink.send(Message::Text(ping)).await {
                    tracing::warn!(url = %inner.url, error = %e, "heartbeat send failed");
                    break ConnectionEnd::Dropped;
                }
            }
            msg = stream.next() => {
                match msg {
                    None => break ConnectionEnd::Dropped,
                    Some(Err(e)) => {
                        tracing::warn!(url = %inner.url, error = %e, "WS receive error");
                        break ConnectionEnd::Dropped;
                    }
                    Some(Ok(Message::Text(text))) => inner.handle_frame(&text),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => inner.handle_frame(text),
                        Err(_) => tracing::warn!(url = %inner.url, "dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(url = %inner.url, ?frame, "WS closed by server");
                        break ConnectionEnd::Dropped;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    };

    // Writer goes first so no send can succeed once `Closed` is published.
    lock(&inner.outbound).take();
    inner.set_state(ConnectionState::Closed);
    inner.emit(TransportEvent::Closed);
    end
}
