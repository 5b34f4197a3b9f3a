//! ledgerrpc-http — one-shot JSON-RPC calls over HTTP POST.
//!
//! [`HttpRpcClient`] implements [`ledgerrpc_core::RpcTransport`], so it can back
//! a [`ledgerrpc_core::RpcClient`] for calls that do not need the persistent
//! WebSocket session.

pub mod client;

pub use client::HttpRpcClient;
