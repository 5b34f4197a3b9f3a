//! ledgerrpc-tracker — follows submitted transactions through the
//! commitment levels until they are finalized or fail.
//!
//! ```no_run
//! # async fn demo() -> Result<(), ledgerrpc_core::RpcError> {
//! use std::sync::Arc;
//! use ledgerrpc_core::{TrackerConfig, WsConfig};
//! use ledgerrpc_tracker::TransactionTracker;
//! use ledgerrpc_ws::WsSession;
//!
//! let session = WsSession::connect("ws://127.0.0.1:8900", WsConfig::default()).await?;
//! let tracker = TransactionTracker::new(
//!     Arc::new(session.clone()),
//!     Arc::new(session.client()),
//!     TrackerConfig::default(),
//! );
//! tracker.track("5VERv8NMvzbJMEkV8xnrLkEaWRtSz9CosKDYjCJjBRnbJLgp8uirBgmQpjKhoR4tjF3ZpRzrFmBV6UjKdiSZkQUW", None);
//! let mut updates = tracker.subscribe_updates();
//! while let Ok(update) = updates.recv().await {
//!     println!("{} -> {}", update.signature, update.state);
//! }
//! # Ok(())
//! # }
//! ```

pub mod record;
pub mod source;
pub mod tracker;

pub use record::{TransactionRecord, TransactionState};
pub use source::{SignatureFeed, StatusSource};
pub use tracker::{TrackerUpdate, TransactionTracker};
