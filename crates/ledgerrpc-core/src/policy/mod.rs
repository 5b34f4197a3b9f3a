//! Retry and reconnect policies.

pub mod retry;

pub use retry::{Backoff, RetryConfig, RetryPolicy};
