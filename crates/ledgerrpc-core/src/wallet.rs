//! Transaction drafts and the wallet signing capability.
//!
//! The ledger's transaction format is opaque here: a wallet turns a
//! [`TransactionDraft`] into serialized wire bytes. Nothing in this crate
//! validates what the draft contains.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// An account referenced by an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMeta {
    pub pubkey: String,
    pub is_signer: bool,
    pub is_writable: bool,
}

/// A single program instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub program_id: String,
    pub accounts: Vec<AccountMeta>,
    pub data: Vec<u8>,
}

/// An unsigned transaction with a fresh blockhash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDraft {
    pub fee_payer: String,
    pub recent_blockhash: String,
    pub last_valid_block_height: u64,
    pub instructions: Vec<Instruction>,
}

impl TransactionDraft {
    pub fn new(fee_payer: impl Into<String>, recent_blockhash: impl Into<String>) -> Self {
        Self {
            fee_payer: fee_payer.into(),
            recent_blockhash: recent_blockhash.into(),
            last_valid_block_height: 0,
            instructions: Vec::new(),
        }
    }

    /// Append an instruction (builder style).
    pub fn add(mut self, instruction: Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }
}

/// A signed transaction ready for `sendTransaction`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub draft: TransactionDraft,
    /// Serialized wire bytes produced by the wallet.
    pub wire: Vec<u8>,
}

impl SignedTransaction {
    /// Base64 wire encoding, as sent to the node.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.wire)
    }
}

/// Wallet capability: sign a draft or fail.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    async fn sign_transaction(&self, draft: TransactionDraft) -> Result<SignedTransaction, RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_builder_appends_instructions() {
        let ix = Instruction {
            program_id: "11111111111111111111111111111111".into(),
            accounts: vec![AccountMeta {
                pubkey: "payer".into(),
                is_signer: true,
                is_writable: true,
            }],
            data: vec![2, 0, 0, 0],
        };
        let draft = TransactionDraft::new("payer", "hash").add(ix.clone()).add(ix);
        assert_eq!(draft.instructions.len(), 2);
        assert_eq!(draft.fee_payer, "payer");
    }

    #[test]
    fn wire_bytes_encode_as_base64() {
        let signed = SignedTransaction {
            draft: TransactionDraft::new("payer", "hash"),
            wire: b"hello".to_vec(),
        };
        assert_eq!(signed.to_base64(), "aGVsbG8=");
    }
}
