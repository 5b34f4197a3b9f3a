//! ledgerrpc-core — foundation types for LedgerRPC.
//!
//! # Overview
//!
//! LedgerRPC is the real-time RPC layer for a Solana-style ledger node: a
//! persistent WebSocket multiplexer (`ledgerrpc-ws`), an HTTP transport
//! (`ledgerrpc-http`) and a transaction confirmation tracker
//! (`ledgerrpc-tracker`). The core crate defines:
//!
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`] / [`InboundMessage`] — wire types and framing
//! - [`RpcTransport`] — the async request/response trait every transport implements
//! - [`RpcClient`] — typed facade (blockhash, signature status, send, submit)
//! - [`RpcError`] — structured error type
//! - [`Commitment`] — `processed` < `confirmed` < `finalized`
//! - [`policy`] — retry and reconnect backoff
//! - [`config`] — YAML-loadable configuration

pub mod client;
pub mod commitment;
pub mod config;
pub mod error;
pub mod policy;
pub mod request;
pub mod transport;
pub mod types;
pub mod wallet;

pub use client::{RpcClient, Submission};
pub use commitment::Commitment;
pub use config::{ConfigError, HttpConfig, LedgerRpcConfig, LogConfig, TrackerConfig, WsConfig};
pub use error::RpcError;
pub use request::{
    InboundMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    NotificationPayload, RpcId, RpcParam,
};
pub use transport::{HealthStatus, RpcTransport};
pub use types::{AccountInfo, LatestBlockhash, SignatureResult, SignatureStatus};
pub use wallet::{SignedTransaction, TransactionDraft, TransactionSigner};
