//! Per-signature record and its confirmation state machine.

use serde::Serialize;
use serde_json::Value;

use ledgerrpc_core::commitment::Commitment;
use ledgerrpc_core::types::SignatureStatus;
use ledgerrpc_core::wallet::SignedTransaction;

/// Confirmation stage of a tracked transaction.
///
/// `Submitted < Processed < Confirmed < Finalized`; `Failed` is terminal and
/// outside that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Submitted,
    Processed,
    Confirmed,
    Finalized,
    Failed,
}

impl TransactionState {
    fn rank(&self) -> u8 {
        match self {
            Self::Submitted => 0,
            Self::Processed => 1,
            Self::Confirmed => 2,
            Self::Finalized => 3,
            Self::Failed => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Failed)
    }
}

impl From<Commitment> for TransactionState {
    fn from(level: Commitment) -> Self {
        match level {
            Commitment::Processed => Self::Processed,
            Commitment::Confirmed => Self::Confirmed,
            Commitment::Finalized => Self::Finalized,
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Processed => "processed",
            Self::Confirmed => "confirmed",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Everything known about one tracked signature.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionRecord {
    pub signature: String,
    /// The signed transaction, when this process submitted it.
    #[serde(skip)]
    pub transaction: Option<SignedTransaction>,
    pub state: TransactionState,
    /// Last status returned by the poll loop. Recorded only; stages follow
    /// notifications.
    pub latest_status: Option<SignatureStatus>,
    /// `getTransaction` result, fetched once after finalization.
    pub details: Option<Value>,
    /// Transaction error reported by the node.
    pub error: Option<Value>,
}

impl TransactionRecord {
    pub fn new(signature: impl Into<String>, transaction: Option<SignedTransaction>) -> Self {
        Self {
            signature: signature.into(),
            transaction,
            state: TransactionState::Submitted,
            latest_status: None,
            details: None,
            error: None,
        }
    }
}

/// Something the node told us about a signature.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Observation {
    Reached(Commitment),
    Errored(Value),
}

impl Observation {
    /// Interpret a `signatureNotification` value received at `level`.
    pub(crate) fn from_notification(level: Commitment, value: &Value) -> Self {
        match value.get("err") {
            Some(err) if !err.is_null() => Self::Errored(err.clone()),
            _ => Self::Reached(level),
        }
    }

    /// A polled status only matters to the stage when it reports a
    /// transaction error.
    pub(crate) fn from_status(status: &SignatureStatus) -> Option<Self> {
        status.err.as_ref().map(|err| Self::Errored(err.clone()))
    }
}

/// Side effects the tracker must carry out after an observation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Effects {
    pub start_poll: bool,
    pub stop_poll: bool,
    pub fetch_details: bool,
}

/// A record plus the bookkeeping that keeps handlers idempotent.
#[derive(Debug)]
pub(crate) struct Progress {
    pub record: TransactionRecord,
    pub polling: bool,
    pub details_requested: bool,
}

impl Progress {
    pub(crate) fn new(record: TransactionRecord) -> Self {
        Self {
            record,
            polling: false,
            details_requested: false,
        }
    }

    /// Apply an observation. Stages only move forward; anything at or below
    /// the current stage, or after a terminal state, changes nothing.
    pub(crate) fn apply(&mut self, observation: Observation) -> Effects {
        let mut effects = Effects::default();
        if self.record.state.is_terminal() {
            return effects;
        }

        let target = match observation {
            Observation::Errored(err) => {
                self.record.error = Some(err);
                TransactionState::Failed
            }
            Observation::Reached(level) => TransactionState::from(level),
        };
        if target.rank() <= self.record.state.rank() {
            return effects;
        }
        self.record.state = target;

        match target {
            TransactionState::Confirmed if !self.polling => {
                self.polling = true;
                effects.start_poll = true;
            }
            TransactionState::Finalized => {
                effects.stop_poll = self.polling;
                self.polling = false;
                if !self.details_requested {
                    self.details_requested = true;
                    effects.fetch_details = true;
                }
            }
            TransactionState::Failed => {
                effects.stop_poll = self.polling;
                self.polling = false;
            }
            _ => {}
        }
        effects
    }
}
