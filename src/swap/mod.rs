pub mod fees;
pub mod store;

use std::fmt;

use anyhow::{Context as _, Result};
use bitcoin::secp256k1::SecretKey;
use serde::{Deserialize, Serialize};

use crate::network::Currency;
use crate::taproot::{SwapTree, TreeDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SwapType {
    Submarine,
    Reverse,
    Chain,
}

impl fmt::Display for SwapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SwapType::Submarine => "submarine",
            SwapType::Reverse => "reverse",
            SwapType::Chain => "chain",
        })
    }
}

/// Local view of where a swap stands, independent of the server's status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Pending,
    Successful,
    Refunded,
    Error,
    ServerError,
    Abandoned,
}

impl SwapState {
    /// States that never change again.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            SwapState::Successful | SwapState::Refunded | SwapState::Abandoned
        )
    }

    pub fn can_transition_to(self, next: SwapState) -> bool {
        use SwapState::*;
        match (self, next) {
            (Pending, Successful | Refunded | ServerError | Abandoned | Error) => true,
            (ServerError | Error, Successful | Refunded) => true,
            (Error, ServerError | Abandoned) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwapState::Pending => "pending",
            SwapState::Successful => "successful",
            SwapState::Refunded => "refunded",
            SwapState::Error => "error",
            SwapState::ServerError => "server_error",
            SwapState::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => SwapState::Pending,
            "successful" => SwapState::Successful,
            "refunded" => SwapState::Refunded,
            "error" => SwapState::Error,
            "server_error" => SwapState::ServerError,
            "abandoned" => SwapState::Abandoned,
            _ => return None,
        })
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service fee of `percent` on `amount`, rounded up.
pub fn service_fee(amount: u64, percent: f64) -> u64 {
    (amount as f64 * percent / 100.0).ceil() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub from: Currency,
    pub to: Currency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegSide {
    /// Funds locked by us; we hold the refund leaf.
    From,
    /// Funds locked by the server; we hold the claim leaf.
    To,
}

impl LegSide {
    pub fn as_str(self) -> &'static str {
        match self {
            LegSide::From => "from",
            LegSide::To => "to",
        }
    }
}

/// One on-chain lockup of a swap.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapLeg {
    pub currency: Currency,
    /// Lockup address declared by the server.
    pub lockup_address: String,
    pub blinding_key: Option<SecretKey>,
    pub tree: TreeDescriptor,
    pub timeout_block_height: u32,
    /// Minimum value the lockup output has to carry.
    pub expected_amount: u64,
    pub lockup_txid: Option<String>,
    pub settlement_txid: Option<String>,
    /// Where a claim or refund of this leg pays to.
    pub destination: Option<String>,
}

impl SwapLeg {
    pub fn swap_tree(&self) -> Result<SwapTree> {
        self.tree.build().context("rebuild swap tree")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwapRecord {
    pub id: String,
    pub swap_type: SwapType,
    pub pair: Pair,
    pub state: SwapState,
    pub error: Option<String>,
    /// Latest server status that was fully processed.
    pub status: String,
    pub private_key: SecretKey,
    pub preimage: Option<[u8; 32]>,
    pub preimage_hash: [u8; 32],
    pub invoice: Option<String>,
    pub accept_zero_conf: bool,
    /// The invoice of a reverse swap is paid outside of the engine.
    pub external_pay: bool,
    pub service_fee_percent: f64,
    /// Leg we fund. Absent for reverse swaps.
    pub from: Option<SwapLeg>,
    /// Leg the server funds. Absent for submarine swaps.
    pub to: Option<SwapLeg>,
    pub service_fee: Option<u64>,
    pub onchain_fee: Option<u64>,
    pub created_at: i64,
}

impl SwapRecord {
    pub fn leg(&self, side: LegSide) -> Option<&SwapLeg> {
        match side {
            LegSide::From => self.from.as_ref(),
            LegSide::To => self.to.as_ref(),
        }
    }

    pub fn require_leg(&self, side: LegSide) -> Result<&SwapLeg> {
        self.leg(side)
            .with_context(|| format!("{} swap {} has no {} leg", self.swap_type, self.id, side.as_str()))
    }
}
