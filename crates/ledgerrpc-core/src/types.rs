//! Typed results of the ledger RPC methods this workspace uses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::commitment::Commitment;

/// `context` wrapper returned by most ledger RPC methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcContext {
    pub slot: u64,
}

/// `{context, value}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse<T> {
    pub context: RpcContext,
    pub value: T,
}

/// Result of `getLatestBlockhash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestBlockhash {
    pub blockhash: String,
    #[serde(default)]
    pub last_valid_block_height: u64,
}

/// One entry of `getSignatureStatuses`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureStatus {
    pub slot: u64,
    /// `None` once the transaction is rooted.
    #[serde(default)]
    pub confirmations: Option<u64>,
    /// Transaction error, if execution failed.
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub confirmation_status: Option<Commitment>,
}

impl SignatureStatus {
    pub fn is_finalized(&self) -> bool {
        self.confirmation_status == Some(Commitment::Finalized)
    }

    pub fn is_failed(&self) -> bool {
        self.err.is_some()
    }
}

/// Value of a `signatureNotification`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureResult {
    #[serde(default)]
    pub err: Option<Value>,
}

/// Result of `getAccountInfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub lamports: u64,
    pub owner: String,
    /// `[data, encoding]` pair as returned by the node.
    pub data: Value,
    pub executable: bool,
    #[serde(default)]
    pub rent_epoch: u64,
    #[serde(default)]
    pub space: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_status_from_node_json() {
        let status: SignatureStatus = serde_json::from_value(json!({
            "slot": 72,
            "confirmations": 10,
            "err": null,
            "status": {"Ok": null},
            "confirmationStatus": "confirmed"
        }))
        .unwrap();
        assert_eq!(status.confirmations, Some(10));
        assert!(!status.is_finalized());
        assert!(!status.is_failed());

        let rooted: SignatureStatus = serde_json::from_value(json!({
            "slot": 80,
            "confirmations": null,
            "err": {"InstructionError": [0, "Custom"]},
            "confirmationStatus": "finalized"
        }))
        .unwrap();
        assert!(rooted.is_finalized());
        assert!(rooted.is_failed());
    }

    #[test]
    fn latest_blockhash_envelope() {
        let resp: RpcResponse<LatestBlockhash> = serde_json::from_value(json!({
            "context": {"slot": 2792},
            "value": {"blockhash": "EkSnNWid2cvwEVnVx9aBqawnmiCNiDgp3gUdkDPTKN1N", "lastValidBlockHeight": 3090}
        }))
        .unwrap();
        assert_eq!(resp.context.slot, 2792);
        assert_eq!(resp.value.last_valid_block_height, 3090);
    }
}
