use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use bitcoin::hashes::Hash as _;
use lightning_invoice::Bolt11Invoice;

use crate::network::Currency;

/// The parts of a BOLT11 invoice the swap engine checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInvoice {
    pub payment_hash: [u8; 32],
    pub amount_sat: u64,
}

pub fn decode(invoice: &str) -> Result<DecodedInvoice> {
    let invoice = Bolt11Invoice::from_str(invoice)
        .map_err(|e| anyhow::anyhow!("parse BOLT11 invoice: {e:?}"))?;
    let amount_msat = invoice
        .amount_milli_satoshis()
        .context("invoice has no amount")?;
    Ok(DecodedInvoice {
        payment_hash: invoice.payment_hash().to_byte_array(),
        amount_sat: amount_msat / 1000,
    })
}

/// Invoice expiry covering the blocks left until the swap times out, plus one block.
pub fn invoice_expiry_secs(blocks_left: u32, currency: Currency) -> u64 {
    currency
        .blocks_to_duration(blocks_left.saturating_add(1))
        .as_secs()
}

const MIN_PAYMENT_FEE_SAT: u64 = 5;

/// Routing fee budget for paying `amount_sat` at `fee_limit_ppm`, never below 5 sats.
pub fn fee_limit_sat(amount_sat: u64, fee_limit_ppm: u64) -> u64 {
    let limit = (amount_sat as f64 * fee_limit_ppm as f64 / 1_000_000.0).round() as u64;
    limit.max(MIN_PAYMENT_FEE_SAT)
}
