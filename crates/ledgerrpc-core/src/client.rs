//! `RpcClient` — typed request/response facade over any [`RpcTransport`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::commitment::Commitment;
use crate::error::RpcError;
use crate::transport::{self, RpcTransport};
use crate::types::{AccountInfo, LatestBlockhash, RpcResponse, SignatureStatus};
use crate::wallet::{SignedTransaction, TransactionDraft, TransactionSigner};

/// Outcome of [`RpcClient::submit_transaction`].
#[derive(Debug, Clone)]
pub struct Submission {
    pub signature: String,
    pub transaction: SignedTransaction,
}

/// Typed ledger RPC client.
///
/// Cheap to clone; every clone shares the same transport.
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<dyn RpcTransport>,
    commitment: Commitment,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            transport,
            commitment: Commitment::default(),
        }
    }

    /// Override the commitment used by reads and preflight.
    pub fn with_commitment(mut self, commitment: Commitment) -> Self {
        self.commitment = commitment;
        self
    }

    pub fn commitment(&self) -> Commitment {
        self.commitment
    }

    pub fn transport(&self) -> &Arc<dyn RpcTransport> {
        &self.transport
    }

    /// Single request/response exchange, decoded into `T`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        tracing::debug!(method, url = %self.transport.url(), "rpc call");
        transport::call(self.transport.as_ref(), method, params).await
    }

    pub async fn get_latest_blockhash(&self) -> Result<LatestBlockhash, RpcError> {
        let resp: RpcResponse<LatestBlockhash> = self
            .call(
                "getLatestBlockhash",
                vec![json!({ "commitment": self.commitment })],
            )
            .await?;
        Ok(resp.value)
    }

    /// Status of one signature, searching the full transaction history.
    /// `None` if the node has never seen it.
    pub async fn get_signature_status(
        &self,
        signature: &str,
    ) -> Result<Option<SignatureStatus>, RpcError> {
        let resp: RpcResponse<Vec<Option<SignatureStatus>>> = self
            .call(
                "getSignatureStatuses",
                vec![json!([signature]), json!({ "searchTransactionHistory": true })],
            )
            .await?;
        Ok(resp.value.into_iter().next().flatten())
    }

    /// Full details of a finalized transaction, as raw JSON.
    pub async fn get_transaction(&self, signature: &str) -> Result<Option<Value>, RpcError> {
        self.call(
            "getTransaction",
            vec![
                json!(signature),
                json!({
                    "encoding": "json",
                    "commitment": Commitment::Finalized,
                    "maxSupportedTransactionVersion": 0,
                }),
            ],
        )
        .await
    }

    /// Submit a signed transaction; returns its signature.
    pub async fn send_transaction(&self, tx: &SignedTransaction) -> Result<String, RpcError> {
        self.call(
            "sendTransaction",
            vec![
                json!(tx.to_base64()),
                json!({ "encoding": "base64", "preflightCommitment": self.commitment }),
            ],
        )
        .await
    }

    pub async fn get_balance(&self, pubkey: &str) -> Result<u64, RpcError> {
        let resp: RpcResponse<u64> = self
            .call(
                "getBalance",
                vec![json!(pubkey), json!({ "commitment": self.commitment })],
            )
            .await?;
        Ok(resp.value)
    }

    pub async fn get_account_info(&self, pubkey: &str) -> Result<Option<AccountInfo>, RpcError> {
        let resp: RpcResponse<Option<AccountInfo>> = self
            .call(
                "getAccountInfo",
                vec![
                    json!(pubkey),
                    json!({ "encoding": "base64", "commitment": self.commitment }),
                ],
            )
            .await?;
        Ok(resp.value)
    }

    /// Fetch a blockhash, build the transaction, have the wallet sign it and
    /// send it.
    ///
    /// Fails with [`RpcError::Signing`] when `signer` is `None`.
    pub async fn submit_transaction<F>(
        &self,
        signer: Option<&dyn TransactionSigner>,
        fee_payer: &str,
        builder: F,
    ) -> Result<Submission, RpcError>
    where
        F: FnOnce(TransactionDraft) -> TransactionDraft + Send,
    {
        let blockhash = self.get_latest_blockhash().await?;
        let mut draft = TransactionDraft::new(fee_payer, blockhash.blockhash);
        draft.last_valid_block_height = blockhash.last_valid_block_height;
        let draft = builder(draft);

        let signer = signer.ok_or_else(|| RpcError::Signing("no wallet selected".into()))?;
        let transaction = signer.sign_transaction(draft).await?;

        let signature = self.send_transaction(&transaction).await?;
        tracing::info!(signature = %signature, "transaction submitted");
        Ok(Submission {
            signature,
            transaction,
        })
    }
}
