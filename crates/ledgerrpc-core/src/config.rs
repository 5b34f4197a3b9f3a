//! Configuration for every LedgerRPC component.
//!
//! All fields are defaulted, so an empty YAML document is a valid config.
//!
//! ```yaml
//! http_url: https://api.devnet.solana.com
//! ws_url: wss://api.devnet.solana.com
//! ws:
//!   heartbeat_interval_ms: 30000
//!   reconnect: { initial_backoff_ms: 500, max_backoff_ms: 30000 }
//! tracker:
//!   poll_interval_ms: 1000
//! log:
//!   level: debug
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::commitment::Commitment;
use crate::policy::RetryConfig;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Persistent WebSocket settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsConfig {
    /// Keepalive frame interval while the socket is open.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Backoff between failed connection attempts.
    #[serde(default = "RetryConfig::reconnect")]
    pub reconnect: RetryConfig,
    /// How long a correlated request may wait for its response.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Capacity of the inbound event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_heartbeat_interval_ms() -> u64 { 30_000 }
fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_event_capacity() -> usize { 1_024 }

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reconnect: RetryConfig::reconnect(),
            request_timeout_ms: default_request_timeout_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl WsConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Transaction tracker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Signature status poll interval once a transaction is confirmed.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Capacity of the tracker update broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub update_capacity: usize,
    /// Backoff between attempts to open a signature subscription.
    #[serde(default = "RetryConfig::reconnect")]
    pub resubscribe: RetryConfig,
}

fn default_poll_interval_ms() -> u64 { 1_000 }

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            update_capacity: default_event_capacity(),
            resubscribe: RetryConfig::reconnect(),
        }
    }
}

impl TrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Logging settings, consumed by the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRpcConfig {
    #[serde(default = "default_http_url")]
    pub http_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Commitment used when a caller does not specify one.
    #[serde(default)]
    pub commitment: Commitment,
    #[serde(default)]
    pub ws: WsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_http_url() -> String {
    "http://127.0.0.1:8899".into()
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:8900".into()
}

impl Default for LedgerRpcConfig {
    fn default() -> Self {
        Self {
            http_url: default_http_url(),
            ws_url: default_ws_url(),
            commitment: Commitment::default(),
            ws: WsConfig::default(),
            http: HttpConfig::default(),
            tracker: TrackerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl LedgerRpcConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let config = LedgerRpcConfig::from_yaml_str("").unwrap();
        assert_eq!(config, LedgerRpcConfig::default());
        assert_eq!(config.ws.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.tracker.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.commitment, Commitment::Confirmed);
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config = LedgerRpcConfig::from_yaml_str(
            "ws_url: wss://node.example\nws:\n  heartbeat_interval_ms: 5000\n  reconnect:\n    max_backoff_ms: 2000\ntracker:\n  poll_interval_ms: 250\n",
        )
        .unwrap();
        assert_eq!(config.ws_url, "wss://node.example");
        assert_eq!(config.ws.heartbeat_interval_ms, 5_000);
        assert_eq!(config.ws.reconnect.max_backoff_ms, 2_000);
        assert_eq!(config.ws.reconnect.initial_backoff_ms, 100);
        assert_eq!(config.ws.request_timeout_ms, 30_000);
        assert_eq!(config.tracker.poll_interval_ms, 250);
        assert_eq!(config.tracker.resubscribe, RetryConfig::reconnect());
        assert_eq!(config.http_url, "http://127.0.0.1:8899");
    }

    #[test]
    fn missing_file_reports_path() {
        let err = LedgerRpcConfig::from_path("/nonexistent/ledgerrpc.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ledgerrpc.yaml"));
    }

    #[test]
    fn invalid_yaml_is_parse_error() {
        let err = LedgerRpcConfig::from_yaml_str("ws: [1, 2").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
