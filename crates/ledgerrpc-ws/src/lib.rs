//! ledgerrpc-ws — one persistent WebSocket connection multiplexing
//! correlated requests and server subscriptions.
//!
//! # Features
//! - Auto-reconnect on unclean close (immediate, then exponential backoff)
//! - Request/response correlation by unique id, in any order
//! - Shared subscriptions per (resource, kind, commitment)
//! - Auto-resubscribe after reconnect, transparent to stream consumers
//! - JSON-RPC keepalive heartbeat

use std::sync::{Mutex, MutexGuard};

pub mod correlation;
pub mod session;
pub mod subscriptions;
pub mod transport;

pub use correlation::CorrelationRegistry;
pub use session::WsSession;
pub use subscriptions::{
    Subscription, SubscriptionKey, SubscriptionKind, SubscriptionManager, SubscriptionState,
};
pub use transport::{ConnectionState, Transport, TransportEvent};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
