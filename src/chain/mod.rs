use anyhow::Result;
use async_trait::async_trait;
use bitcoin::secp256k1::SecretKey;
use tokio::sync::{mpsc, watch};

use crate::network::Currency;
use crate::transaction::{LockupTransaction, SettlementTransaction};

/// A new chain tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEpoch {
    pub currency: Currency,
    pub height: u32,
}

/// Chain access the engine needs for every supported currency.
#[async_trait]
pub trait ChainBackend: Send + Sync {
    async fn get_transaction(
        &self,
        currency: Currency,
        txid: &str,
        blinding_key: Option<SecretKey>,
    ) -> Result<LockupTransaction>;

    async fn block_height(&self, currency: Currency) -> Result<u32>;

    /// Publishes `transaction` and returns its id.
    async fn broadcast_transaction(&self, transaction: &SettlementTransaction) -> Result<String>;

    /// Fee rate in sat/vbyte.
    async fn estimate_fee(&self, currency: Currency) -> Result<f64>;

    async fn is_transaction_confirmed(&self, currency: Currency, txid: &str) -> Result<bool>;

    /// Pushes new tips of `currency` into `epochs` until `stop` fires.
    async fn register_block_listener(
        &self,
        currency: Currency,
        epochs: mpsc::Sender<BlockEpoch>,
        stop: watch::Receiver<bool>,
    ) -> Result<()>;
}
