use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, Result};
use lwk_wollet::elements::{AddressParams, AssetId, BlockHash};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn bitcoin(self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }

    pub fn liquid_params(self) -> &'static AddressParams {
        match self {
            Network::Mainnet => &AddressParams::LIQUID,
            Network::Testnet => &AddressParams::LIQUID_TESTNET,
            Network::Regtest => &AddressParams::ELEMENTS,
        }
    }

    /// Genesis block hash committed to by every Liquid taproot sighash.
    pub fn liquid_genesis_hash(self) -> Result<BlockHash> {
        let hex = match self {
            Network::Mainnet => "1466275836220db2944ca059a3a10ef6fd2ea684b0688d2c379296888a206003",
            Network::Testnet => "a771da8e52ee6ad581ed1e9a99825e5b3b7992225534eaa2ae23244fe26ab1c1",
            Network::Regtest => "00902a6b70c2ca83b5d9c815d96a0e2f4202179316970d14ea1847dae5b1ca21",
        };
        BlockHash::from_str(hex).context("parse liquid genesis hash")
    }

    pub fn liquid_policy_asset(self) -> Result<AssetId> {
        let hex = match self {
            Network::Mainnet => "6f0279e9ed041c3d710a9f57d0c02928416460c4b722ae3457a11eec381c526d",
            Network::Testnet => "144c654344aa716d6f3abcc1ca90e5641e4e2a7f633bc09fe3baf64585819a49",
            Network::Regtest => "5ac9f65c0efcc4775e0baec4ec03abdde22473cd3cf33c0419ca290e0751b225",
        };
        AssetId::from_str(hex).context("parse liquid policy asset")
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum Currency {
    #[serde(rename = "BTC")]
    #[value(name = "btc")]
    Btc,
    #[serde(rename = "L-BTC")]
    #[value(name = "lbtc", alias = "l-btc", alias = "liquid")]
    Liquid,
}

impl Currency {
    pub fn block_time(self) -> Duration {
        match self {
            Currency::Btc => Duration::from_secs(10 * 60),
            Currency::Liquid => Duration::from_secs(60),
        }
    }

    pub fn blocks_to_duration(self, blocks: u32) -> Duration {
        self.block_time() * blocks
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Currency::Btc => "BTC",
            Currency::Liquid => "L-BTC",
        })
    }
}

impl FromStr for Currency {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BTC" => Ok(Currency::Btc),
            "L-BTC" | "LBTC" | "LIQUID" => Ok(Currency::Liquid),
            other => anyhow::bail!("unknown currency: {other}"),
        }
    }
}
