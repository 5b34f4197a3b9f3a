//! `TransactionTracker` — drives each tracked signature from `submitted`
//! to `finalized` (or `failed`).
//!
//! Three one-shot signature subscriptions (processed, confirmed, finalized)
//! feed the state machine. Once confirmed, a poll loop records the
//! signature status every `poll_interval` until the node reports it
//! finalized; a polled transaction error fails the record, otherwise only
//! notifications move the stage. Finalization stops the loop and fetches
//! the transaction details exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use ledgerrpc_core::client::{RpcClient, Submission};
use ledgerrpc_core::commitment::Commitment;
use ledgerrpc_core::config::TrackerConfig;
use ledgerrpc_core::error::RpcError;
use ledgerrpc_core::policy::{Backoff, RetryConfig};
use ledgerrpc_core::types::SignatureStatus;
use ledgerrpc_core::wallet::{SignedTransaction, TransactionDraft, TransactionSigner};

use crate::record::{Effects, Observation, Progress, TransactionRecord, TransactionState};
use crate::source::{SignatureFeed, StatusSource};

/// A stage transition, broadcast to [`TransactionTracker::subscribe_updates`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerUpdate {
    pub signature: String,
    pub previous: TransactionState,
    pub state: TransactionState,
}

struct Entry {
    progress: Progress,
    watchers: Vec<JoinHandle<()>>,
    poll: Option<JoinHandle<()>>,
}

impl Entry {
    fn abort_tasks(&mut self) {
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
        if let Some(poll) = self.poll.take() {
            poll.abort();
        }
    }
}

struct TrackerInner {
    feed: Arc<dyn SignatureFeed>,
    status: Arc<dyn StatusSource>,
    config: TrackerConfig,
    entries: Mutex<HashMap<String, Entry>>,
    updates: broadcast::Sender<TrackerUpdate>,
}

impl Drop for TrackerInner {
    fn drop(&mut self) {
        let entries = self.entries.get_mut().unwrap_or_else(|e| e.into_inner());
        for entry in entries.values_mut() {
            entry.abort_tasks();
        }
    }
}

/// Tracks confirmation of submitted transactions. Cheap to clone.
///
/// Background tasks only hold weak references: dropping the last clone
/// stops all tracking.
#[derive(Clone)]
pub struct TransactionTracker {
    inner: Arc<TrackerInner>,
}

impl TransactionTracker {
    pub fn new(
        feed: Arc<dyn SignatureFeed>,
        status: Arc<dyn StatusSource>,
        config: TrackerConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(config.update_capacity.max(1));
        Self {
            inner: Arc::new(TrackerInner {
                feed,
                status,
                config,
                entries: Mutex::new(HashMap::new()),
                updates,
            }),
        }
    }

    /// Start tracking `signature`. Returns `false` if it is already tracked.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn track(&self, signature: impl Into<String>, transaction: Option<SignedTransaction>) -> bool {
        let signature = signature.into();
        let mut entries = self.inner.lock();
        if entries.contains_key(&signature) {
            return false;
        }

        let watchers = Commitment::ALL
            .into_iter()
            .map(|level| {
                tokio::spawn(watch_level(
                    Arc::downgrade(&self.inner),
                    Arc::clone(&self.inner.feed),
                    signature.clone(),
                    level,
                    self.inner.config.resubscribe.clone(),
                ))
            })
            .collect();
        entries.insert(
            signature.clone(),
            Entry {
                progress: Progress::new(TransactionRecord::new(signature.clone(), transaction)),
                watchers,
                poll: None,
            },
        );
        tracing::info!(signature = %signature, "tracking transaction");
        true
    }

    /// Submit a transaction through `client` and track its signature with
    /// the signed transaction attached to the record.
    pub async fn submit<F>(
        &self,
        client: &RpcClient,
        signer: Option<&dyn TransactionSigner>,
        fee_payer: &str,
        builder: F,
    ) -> Result<Submission, RpcError>
    where
        F: FnOnce(TransactionDraft) -> TransactionDraft + Send,
    {
        let submission = client.submit_transaction(signer, fee_payer, builder).await?;
        self.track(submission.signature.clone(), Some(submission.transaction.clone()));
        Ok(submission)
    }

    /// Snapshot of one record.
    pub fn record(&self, signature: &str) -> Option<TransactionRecord> {
        self.inner
            .lock()
            .get(signature)
            .map(|e| e.progress.record.clone())
    }

    /// Snapshot of every record.
    pub fn records(&self) -> Vec<TransactionRecord> {
        self.inner
            .lock()
            .values()
            .map(|e| e.progress.record.clone())
            .collect()
    }

    /// `true` while any tracked transaction has not reached a terminal state.
    pub fn is_processing(&self) -> bool {
        self.inner
            .lock()
            .values()
            .any(|e| !e.progress.record.state.is_terminal())
    }

    /// Stop tracking `signature` and return its final record.
    pub fn prune(&self, signature: &str) -> Option<TransactionRecord> {
        let mut entry = self.inner.lock().remove(signature)?;
        entry.abort_tasks();
        tracing::debug!(signature, "record pruned");
        Some(entry.progress.record)
    }

    /// Stage transitions of every tracked signature, from now on.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<TrackerUpdate> {
        self.inner.updates.subscribe()
    }
}

impl TrackerInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Feed an observation into the state machine and carry out its effects.
    fn observe(self: &Arc<Self>, signature: &str, observation: Observation) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(signature) else {
            return;
        };
        let previous = entry.progress.record.state;
        let effects = entry.progress.apply(observation);
        let state = entry.progress.record.state;
        self.run_effects(signature, entry, effects);
        drop(entries);

        if state != previous {
            match state {
                TransactionState::Failed => {
                    tracing::warn!(signature, from = %previous, "transaction failed");
                }
                _ => tracing::info!(signature, from = %previous, to = %state, "transaction advanced"),
            }
            // No receivers is fine.
            let _ = self.updates.send(TrackerUpdate {
                signature: signature.to_string(),
                previous,
                state,
            });
        }
    }

    fn run_effects(self: &Arc<Self>, signature: &str, entry: &mut Entry, effects: Effects) {
        if effects.stop_poll {
            if let Some(poll) = entry.poll.take() {
                poll.abort();
            }
        }
        if effects.start_poll {
            self.start_poll(signature, entry);
        }
        if effects.fetch_details {
            tokio::spawn(fetch_details(
                Arc::downgrade(self),
                Arc::clone(&self.status),
                signature.to_string(),
            ));
        }
    }

    fn start_poll(self: &Arc<Self>, signature: &str, entry: &mut Entry) {
        tracing::debug!(signature, "starting status poll");
        entry.poll = Some(tokio::spawn(poll_status(
            Arc::downgrade(self),
            Arc::clone(&self.status),
            signature.to_string(),
            self.config.poll_interval(),
        )));
    }

    /// `true` while `signature` is tracked and not yet terminal.
    fn is_open(&self, signature: &str) -> bool {
        self.lock()
            .get(signature)
            .is_some_and(|e| !e.progress.record.state.is_terminal())
    }

    /// Record a polled status. Returns `false` once polling should stop.
    ///
    /// The stage only changes here when the status carries an error.
    fn record_status(self: &Arc<Self>, signature: &str, status: SignatureStatus) -> bool {
        let observation = Observation::from_status(&status);
        let finalized = status.is_finalized();
        {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(signature) else {
                return false;
            };
            entry.progress.record.latest_status = Some(status);
        }
        if let Some(observation) = observation {
            self.observe(signature, observation);
        }
        let terminal = self
            .lock()
            .get(signature)
            .map_or(true, |e| e.progress.record.state.is_terminal());
        !(finalized || terminal)
    }

    fn store_details(&self, signature: &str, details: serde_json::Value) {
        if let Some(entry) = self.lock().get_mut(signature) {
            entry.progress.record.details = Some(details);
        }
    }
}

/// Wait for the first notification at `level`, then release the subscription.
/// A subscription that cannot be opened is retried with backoff while the
/// record is still open.
async fn watch_level(
    tracker: Weak<TrackerInner>,
    feed: Arc<dyn SignatureFeed>,
    signature: String,
    level: Commitment,
    retry: RetryConfig,
) {
    let mut backoff = Backoff::new(retry);
    let mut updates = loop {
        match feed.signature_updates(&signature, level).await {
            Ok(updates) => break updates,
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    signature = %signature,
                    commitment = %level,
                    error = %e,
                    "signature subscribe failed, retrying in {delay:?}"
                );
                time::sleep(delay).await;
                match tracker.upgrade() {
                    Some(tracker) if tracker.is_open(&signature) => {}
                    _ => return,
                }
            }
        }
    };
    let Some(payload) = updates.next().await else {
        return;
    };
    drop(updates);

    tracing::debug!(signature = %signature, commitment = %level, slot = payload.slot(), "signature notification");
    if let Some(tracker) = tracker.upgrade() {
        tracker.observe(&signature, Observation::from_notification(level, &payload.value));
    }
}

async fn poll_status(
    tracker: Weak<TrackerInner>,
    status: Arc<dyn StatusSource>,
    signature: String,
    period: std::time::Duration,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let result = status.signature_status(&signature).await;
        let Some(tracker) = tracker.upgrade() else {
            return;
        };
        match result {
            Ok(Some(current)) => {
                tracing::trace!(signature = %signature, status = ?current.confirmation_status, "polled status");
                if !tracker.record_status(&signature, current) {
                    tracing::debug!(signature = %signature, "status poll finished");
                    return;
                }
            }
            Ok(None) => tracing::trace!(signature = %signature, "signature not yet known"),
            Err(e) => tracing::warn!(signature = %signature, error = %e, "status poll failed"),
        }
    }
}

async fn fetch_details(tracker: Weak<TrackerInner>, status: Arc<dyn StatusSource>, signature: String) {
    let result = status.transaction_details(&signature).await;
    let Some(tracker) = tracker.upgrade() else {
        return;
    };
    match result {
        Ok(Some(details)) => tracker.store_details(&signature, details),
        Ok(None) => tracing::warn!(signature = %signature, "finalized transaction not found"),
        Err(e) => tracing::warn!(signature = %signature, error = %e, "getTransaction failed"),
    }
}
