use std::collections::HashMap;

use anyhow::{Context as _, Result};

use super::{Pair, SwapType, service_fee};
use crate::error::SwapError;
use crate::network::Currency;

/// Network fee the server may take above the estimate, whichever is larger.
pub const ABSOLUTE_FEE_TOLERANCE_SAT: u64 = 1_500;
pub const RELATIVE_FEE_TOLERANCE_PERCENT: f64 = 25.0;

/// Reference sizes in vbytes the server prices swap transactions with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSizes {
    pub normal_claim: u64,
    pub reverse_lockup: u64,
    pub reverse_claim: u64,
}

pub fn tx_sizes(currency: Currency) -> TxSizes {
    match currency {
        Currency::Btc => TxSizes {
            normal_claim: 151,
            reverse_lockup: 154,
            reverse_claim: 111,
        },
        Currency::Liquid => TxSizes {
            normal_claim: 1_337,
            reverse_lockup: 2_503,
            reverse_claim: 1_309,
        },
    }
}

/// Currencies whose fee rate is needed to price `swap_type` on `pair`.
pub fn required_estimations(swap_type: SwapType, pair: Pair) -> Vec<Currency> {
    match swap_type {
        SwapType::Submarine => vec![pair.from],
        SwapType::Reverse => vec![pair.to],
        SwapType::Chain => vec![pair.from, pair.to],
    }
}

/// Network fee the server is expected to charge, from sat/vbyte `estimations`.
pub fn network_fee(
    swap_type: SwapType,
    pair: Pair,
    estimations: &HashMap<Currency, f64>,
) -> Result<u64> {
    let rate = |currency: Currency| {
        estimations
            .get(&currency)
            .copied()
            .with_context(|| format!("no fee estimation for {currency}"))
    };
    Ok(match swap_type {
        SwapType::Submarine => {
            (tx_sizes(pair.from).normal_claim as f64 * rate(pair.from)?).ceil() as u64
        }
        SwapType::Reverse => {
            (tx_sizes(pair.to).reverse_lockup as f64 * rate(pair.to)?).ceil() as u64
        }
        SwapType::Chain => {
            network_fee(SwapType::Submarine, pair, estimations)?
                + network_fee(SwapType::Reverse, pair, estimations)?
        }
    })
}

/// Checks that the network fee implied by sending `send_amount` to receive
/// `receive_amount` stays within tolerance of the estimate.
///
/// The service fee is charged on the received amount of submarine swaps and on the sent
/// amount otherwise.
pub fn check_amounts(
    swap_type: SwapType,
    pair: Pair,
    send_amount: u64,
    receive_amount: u64,
    service_fee_percent: f64,
    estimations: &HashMap<Currency, f64>,
) -> Result<()> {
    let service = match swap_type {
        SwapType::Submarine => service_fee(receive_amount, service_fee_percent),
        SwapType::Reverse | SwapType::Chain => service_fee(send_amount, service_fee_percent),
    };
    let actual = send_amount
        .saturating_sub(receive_amount)
        .saturating_sub(service);
    let expected = network_fee(swap_type, pair, estimations)?;
    let tolerance =
        ABSOLUTE_FEE_TOLERANCE_SAT.max(service_fee(expected, RELATIVE_FEE_TOLERANCE_PERCENT));
    if actual > expected + tolerance {
        return Err(SwapError::InvalidOnchainFee {
            actual,
            expected,
            tolerance,
        }
        .into());
    }
    Ok(())
}
