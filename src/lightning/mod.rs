pub mod invoice;

use anyhow::Result;
use async_trait::async_trait;

/// Where an outgoing payment stands on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentResult {
    pub fee_msat: u64,
}

/// The Lightning node the swap engine settles invoices with.
#[async_trait]
pub trait LightningNode: Send + Sync {
    /// `Ok(None)` when the node does not know the invoice.
    async fn check_invoice_paid(&self, payment_hash: [u8; 32]) -> Result<Option<bool>>;

    /// Creates an invoice locked to `preimage_hash` and returns it BOLT11 encoded.
    async fn create_invoice(
        &self,
        amount_sat: u64,
        preimage_hash: [u8; 32],
        expiry_secs: u64,
        memo: &str,
    ) -> Result<String>;

    /// `Ok(None)` when the node never tried to pay `payment_hash`.
    async fn payment_status(&self, payment_hash: [u8; 32]) -> Result<Option<PaymentState>>;

    /// Pays `invoice`, spending at most `fee_limit_sat` on routing.
    async fn pay_invoice(
        &self,
        invoice: &str,
        fee_limit_sat: u64,
        timeout_secs: u64,
    ) -> Result<PaymentResult>;
}
