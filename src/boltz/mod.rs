pub mod status;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::swap::SwapType;
use crate::transaction::{CooperativeSigner, Output};

pub use status::{StatusClassifier, SwapUpdateEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
}

/// One status update of a swap, as polled or pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapStatusResponse {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub zero_conf_rejected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Lockup of a submarine swap as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapTransaction {
    pub transaction_hex: String,
    pub timeout_block_height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSwapLockup {
    pub transaction: TransactionInfo,
    pub timeout_block_height: u32,
}

/// Which legs of a chain swap have a known lockup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSwapTransactions {
    pub user_lock: Option<ChainSwapLockup>,
    pub server_lock: Option<ChainSwapLockup>,
}

/// Amount the server offers to lock for a chain swap whose user lockup differs from the
/// agreed amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSwapQuote {
    pub amount: u64,
}

/// Hex-encoded MuSig2 contribution of one party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialSignature {
    pub pub_nonce: String,
    pub partial_signature: String,
}

/// What the server needs from us to claim a submarine lockup cooperatively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimDetails {
    pub preimage: String,
    pub pub_nonce: String,
    pub transaction_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooperativeRequest {
    pub id: String,
    pub swap_type: SwapType,
    pub transaction: String,
    pub pub_nonce: String,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
}

/// Operations of the swap server the engine depends on.
#[async_trait]
pub trait BoltzApi: Send + Sync {
    async fn swap_status(&self, id: &str) -> Result<SwapStatusResponse>;

    /// Pushes updates of `id` into `events` until the stream breaks (error) or `stop` fires.
    async fn stream_swap_status(
        &self,
        id: &str,
        events: mpsc::Sender<SwapStatusResponse>,
        stop: watch::Receiver<bool>,
    ) -> Result<()>;

    async fn swap_transaction(&self, id: &str) -> Result<SwapTransaction>;

    async fn chain_swap_transactions(&self, id: &str) -> Result<ChainSwapTransactions>;

    /// New quote for a chain swap whose user lockup was rejected.
    async fn chain_swap_quote(&self, id: &str) -> Result<ChainSwapQuote>;

    async fn accept_chain_swap_quote(&self, id: &str, quote: &ChainSwapQuote) -> Result<()>;

    /// Server partial signature for a cooperative refund of our lockup.
    async fn refund_swap(&self, request: &CooperativeRequest) -> Result<PartialSignature>;

    /// Server partial signature for a cooperative claim of its lockup. Reveals the preimage.
    async fn claim_swap(&self, request: &CooperativeRequest) -> Result<PartialSignature>;

    async fn swap_claim_details(&self, id: &str) -> Result<ClaimDetails>;

    async fn send_swap_claim_signature(&self, id: &str, signature: &PartialSignature)
    -> Result<()>;

    /// Amount in sats the server wants invoiced for a submarine swap.
    async fn invoice_amount(&self, id: &str) -> Result<u64>;

    async fn set_invoice(&self, id: &str, invoice: &str) -> Result<()>;
}

/// Obtains the server half of cooperative signatures through [`BoltzApi`].
pub struct BoltzSigner<'a> {
    api: &'a dyn BoltzApi,
}

impl<'a> BoltzSigner<'a> {
    pub fn new(api: &'a dyn BoltzApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl CooperativeSigner for BoltzSigner<'_> {
    async fn partial_signature(
        &self,
        output: &Output,
        transaction_hex: &str,
        pub_nonce: &[u8],
        input_index: usize,
    ) -> Result<PartialSignature> {
        let request = CooperativeRequest {
            id: output.swap_id.clone(),
            swap_type: output.swap_type,
            transaction: transaction_hex.to_string(),
            pub_nonce: hex::encode(pub_nonce),
            index: input_index,
            preimage: output.preimage.map(hex::encode),
        };

        if output.is_refund() {
            self.api
                .refund_swap(&request)
                .await
                .with_context(|| format!("request refund signature for {}", output.swap_id))
        } else {
            self.api
                .claim_swap(&request)
                .await
                .with_context(|| format!("request claim signature for {}", output.swap_id))
        }
    }
}
