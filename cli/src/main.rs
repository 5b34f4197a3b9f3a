//! ledgerrpc CLI — talk to a ledger node from the terminal.
//!
//! # Commands
//! ```bash
//! ledgerrpc call      --method getSlot [--params '[{"commitment":"finalized"}]'] [--ws]
//! ledgerrpc subscribe --kind account --resource <pubkey> [--commitment processed]
//! ledgerrpc track     --signature <sig>
//! ledgerrpc version
//! ```

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;

use ledgerrpc_core::{Commitment, LedgerRpcConfig, RpcClient};
use ledgerrpc_http::HttpRpcClient;
use ledgerrpc_tracker::{TrackerUpdate, TransactionRecord, TransactionTracker};
use ledgerrpc_ws::{SubscriptionKey, SubscriptionKind, WsSession};

mod logging;

#[derive(Parser)]
#[command(
    name = "ledgerrpc",
    about = "Real-time ledger RPC client",
    long_about = "
LedgerRPC CLI: one-shot JSON-RPC calls, live subscriptions that survive
reconnects, and transaction confirmation tracking.

ENVIRONMENT VARIABLES:
  LEDGERRPC_CONFIG     Path to a YAML config file
  LEDGERRPC_HTTP_URL   HTTP JSON-RPC endpoint
  LEDGERRPC_WS_URL     WebSocket JSON-RPC endpoint
  RUST_LOG             Log filter (overrides the configured level)
",
    version
)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, env = "LEDGERRPC_CONFIG")]
    config: Option<String>,

    /// HTTP endpoint (overrides config)
    #[arg(long, global = true, env = "LEDGERRPC_HTTP_URL")]
    http_url: Option<String>,

    /// WebSocket endpoint (overrides config)
    #[arg(long, global = true, env = "LEDGERRPC_WS_URL")]
    ws_url: Option<String>,

    /// Emit JSON logs
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one JSON-RPC request and print the result
    Call {
        /// Method name, e.g. getSlot
        #[arg(long)]
        method: String,
        /// JSON array of positional params
        #[arg(long, default_value = "[]")]
        params: String,
        /// Send over the WebSocket session instead of HTTP
        #[arg(long)]
        ws: bool,
    },

    /// Print notifications for a subscription until Ctrl-C
    Subscribe {
        /// account | signature | program | logs
        #[arg(long)]
        kind: String,
        /// Address, signature, or log filter ("all" for every log)
        #[arg(long)]
        resource: String,
        /// processed | confirmed | finalized (default: config commitment)
        #[arg(long)]
        commitment: Option<String>,
    },

    /// Follow a submitted transaction until it is finalized or fails
    Track {
        /// Transaction signature (base58)
        #[arg(long)]
        signature: String,
    },

    /// Print version information
    Version,
}

impl Cli {
    /// File config (if any) with command-line overrides applied.
    fn load_config(&self) -> Result<LedgerRpcConfig> {
        let mut config = match &self.config {
            Some(path) => LedgerRpcConfig::from_path(path)
                .with_context(|| format!("loading config from {path}"))?,
            None => LedgerRpcConfig::default(),
        };
        if let Some(url) = &self.http_url {
            config.http_url = url.clone();
        }
        if let Some(url) = &self.ws_url {
            config.ws_url = url.clone();
        }
        if self.json_logs {
            config.log.json = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    logging::init_tracing(&config.log);

    match cli.command {
        Commands::Call { method, params, ws } => cmd_call(&config, &method, &params, ws).await,
        Commands::Subscribe {
            kind,
            resource,
            commitment,
        } => cmd_subscribe(&config, &kind, &resource, commitment.as_deref()).await,
        Commands::Track { signature } => cmd_track(&config, &signature).await,
        Commands::Version => {
            println!("ledgerrpc {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn parse_params(raw: &str) -> Result<Vec<Value>> {
    match serde_json::from_str(raw).context("--params is not valid JSON")? {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => bail!("--params must be a JSON array, got {other}"),
    }
}

fn parse_commitment(raw: Option<&str>, fallback: Commitment) -> Result<Commitment> {
    match raw {
        Some(s) => s.parse().map_err(anyhow::Error::msg),
        None => Ok(fallback),
    }
}

async fn connect_ws(config: &LedgerRpcConfig) -> Result<WsSession> {
    WsSession::connect(&config.ws_url, config.ws.clone())
        .await
        .with_context(|| format!("connecting to {}", config.ws_url))
}

async fn cmd_call(config: &LedgerRpcConfig, method: &str, params: &str, ws: bool) -> Result<()> {
    let params = parse_params(params)?;
    let (client, session) = if ws {
        let session = connect_ws(config).await?;
        (session.client(), Some(session))
    } else {
        let http = HttpRpcClient::new(&config.http_url, config.http.clone())?;
        (RpcClient::new(Arc::new(http)), None)
    };

    let result: Value = client
        .call(method, params)
        .await
        .with_context(|| format!("{method} via {}", client.transport().url()))?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if let Some(session) = session {
        session.disconnect().await;
    }
    Ok(())
}

async fn cmd_subscribe(
    config: &LedgerRpcConfig,
    kind: &str,
    resource: &str,
    commitment: Option<&str>,
) -> Result<()> {
    let kind: SubscriptionKind = kind.parse()?;
    let commitment = parse_commitment(commitment, config.commitment)?;
    let key = SubscriptionKey::new(kind, resource, commitment);

    let session = connect_ws(config).await?;
    let mut subscription = session
        .subscribe(key.clone())
        .await
        .with_context(|| format!("subscribing to {key}"))?;
    eprintln!("subscribed to {key}, Ctrl-C to stop");

    loop {
        tokio::select! {
            next = subscription.next() => match next {
                Some(payload) => println!("{}", serde_json::to_string(&payload)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Err(e) = subscription.unsubscribe().await {
        tracing::warn!(error = %e, "unsubscribe failed");
    }
    session.disconnect().await;
    Ok(())
}

/// What `track` does with one item of the update stream.
struct TrackStep {
    line: Option<String>,
    done: bool,
}

/// After a lag the skipped transitions are gone; the stored record says where
/// the transaction stands.
fn track_step(
    received: Result<TrackerUpdate, broadcast::error::RecvError>,
    current: impl FnOnce() -> Option<TransactionRecord>,
) -> Result<TrackStep> {
    match received {
        Ok(update) => Ok(TrackStep {
            line: Some(format!("{} {} -> {}", update.signature, update.previous, update.state)),
            done: update.state.is_terminal(),
        }),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            tracing::debug!(skipped, "tracker updates skipped");
            Ok(match current() {
                Some(record) => TrackStep {
                    line: Some(format!("{} -> {}", record.signature, record.state)),
                    done: record.state.is_terminal(),
                },
                None => TrackStep { line: None, done: false },
            })
        }
        Err(broadcast::error::RecvError::Closed) => bail!("tracker update stream ended"),
    }
}

async fn cmd_track(config: &LedgerRpcConfig, signature: &str) -> Result<()> {
    let session = connect_ws(config).await?;
    let tracker = TransactionTracker::new(
        Arc::new(session.clone()),
        Arc::new(session.client()),
        config.tracker.clone(),
    );
    let mut updates = tracker.subscribe_updates();
    tracker.track(signature, None);

    loop {
        tokio::select! {
            received = updates.recv() => {
                let step = track_step(received, || tracker.record(signature))?;
                if let Some(line) = step.line {
                    println!("{line}");
                }
                if step.done {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Some(record) = tracker.record(signature) {
        if let Some(err) = &record.error {
            println!("error: {err}");
        }
        // Details are fetched right after finalization; give them a moment.
        for _ in 0..20 {
            if tracker.record(signature).is_some_and(|r| r.details.is_some()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        if let Some(details) = tracker.record(signature).and_then(|r| r.details) {
            println!("{}", serde_json::to_string_pretty(&details)?);
        }
    }
    session.disconnect().await;
    Ok(())
}
