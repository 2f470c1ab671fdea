use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use bitcoin::hashes::Hash as _;
use bitcoin::script::ScriptBuf;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};
use bitcoin::taproot::{LeafVersion, TapLeafHash, TaprootBuilder, TaprootSpendInfo};
use lwk_wollet::elements;
use lwk_wollet::elements::secp256k1_zkp::MusigKeyAggCache;
use serde::{Deserialize, Serialize};

use crate::error::SwapError;
use crate::network::{Currency, Network};
use crate::swap::SwapType;
use crate::taproot::script::{ClaimLeaf, RefundLeaf};

/// Tapscript leaf version of the Liquid namespace.
pub const LIQUID_LEAF_VERSION: u8 = 0xc4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Leaf {
    Claim,
    Refund,
}

/// Serializable parameters a [`SwapTree`] is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDescriptor {
    pub currency: Currency,
    pub swap_type: SwapType,
    /// The leaf whose key we hold.
    pub our_leaf: Leaf,
    pub our_public_key: String,
    pub counterparty_public_key: String,
    pub preimage_hash: String,
    pub timeout_block_height: u32,
}

impl TreeDescriptor {
    pub fn build(&self) -> Result<SwapTree> {
        let our_public_key =
            PublicKey::from_str(&self.our_public_key).context("parse our public key")?;
        let counterparty_public_key = PublicKey::from_str(&self.counterparty_public_key)
            .context("parse counterparty public key")?;
        let preimage_hash: [u8; 32] = hex::decode(&self.preimage_hash)
            .context("decode preimage hash")?
            .try_into()
            .map_err(|v: Vec<u8>| anyhow::anyhow!("preimage hash must be 32 bytes, got {}", v.len()))?;

        SwapTree::new(
            self.currency,
            self.swap_type,
            self.our_leaf,
            our_public_key,
            counterparty_public_key,
            preimage_hash,
            self.timeout_block_height,
        )
    }
}

#[derive(Debug, Clone)]
enum SpendInfo {
    Bitcoin(TaprootSpendInfo),
    Liquid(elements::taproot::TaprootSpendInfo),
}

/// Two-leaf taproot output of a swap, keyed by the MuSig2 aggregate of both parties.
#[derive(Debug, Clone)]
pub struct SwapTree {
    currency: Currency,
    swap_type: SwapType,
    our_leaf: Leaf,
    our_public_key: PublicKey,
    counterparty_public_key: PublicKey,
    preimage_hash: [u8; 32],
    timeout_block_height: u32,
    claim_leaf: ScriptBuf,
    refund_leaf: ScriptBuf,
    internal_key: XOnlyPublicKey,
    spend_info: SpendInfo,
}

impl SwapTree {
    pub fn new(
        currency: Currency,
        swap_type: SwapType,
        our_leaf: Leaf,
        our_public_key: PublicKey,
        counterparty_public_key: PublicKey,
        preimage_hash: [u8; 32],
        timeout_block_height: u32,
    ) -> Result<Self> {
        let (claim_key, refund_key) = match our_leaf {
            Leaf::Claim => (our_public_key, counterparty_public_key),
            Leaf::Refund => (counterparty_public_key, our_public_key),
        };

        let claim_leaf = ClaimLeaf::new(
            swap_type != SwapType::Submarine,
            &preimage_hash,
            claim_key.x_only_public_key().0,
        )
        .to_script();
        let refund_leaf = RefundLeaf {
            refund_key: refund_key.x_only_public_key().0,
            timeout_block_height,
        }
        .to_script();

        let secp = Secp256k1::new();
        let internal_key = key_agg_cache(counterparty_public_key, our_public_key).agg_pk();

        let spend_info = match currency {
            Currency::Btc => {
                let spend_info = TaprootBuilder::new()
                    .add_leaf_with_ver(1, claim_leaf.clone(), LeafVersion::TapScript)
                    .context("add claim leaf")?
                    .add_leaf_with_ver(1, refund_leaf.clone(), LeafVersion::TapScript)
                    .context("add refund leaf")?
                    .finalize(&secp, internal_key)
                    .map_err(|_| anyhow::anyhow!("finalize taproot tree"))?;
                SpendInfo::Bitcoin(spend_info)
            }
            Currency::Liquid => {
                let spend_info = elements::taproot::TaprootBuilder::new()
                    .add_leaf_with_ver(
                        1,
                        elements::Script::from(claim_leaf.to_bytes()),
                        elements::taproot::LeafVersion::default(),
                    )
                    .map_err(|e| anyhow::anyhow!("add claim leaf: {e:?}"))?
                    .add_leaf_with_ver(
                        1,
                        elements::Script::from(refund_leaf.to_bytes()),
                        elements::taproot::LeafVersion::default(),
                    )
                    .map_err(|e| anyhow::anyhow!("add refund leaf: {e:?}"))?
                    .finalize(&secp, internal_key)
                    .map_err(|e| anyhow::anyhow!("finalize taproot tree: {e:?}"))?;
                SpendInfo::Liquid(spend_info)
            }
        };

        Ok(Self {
            currency,
            swap_type,
            our_leaf,
            our_public_key,
            counterparty_public_key,
            preimage_hash,
            timeout_block_height,
            claim_leaf,
            refund_leaf,
            internal_key,
            spend_info,
        })
    }

    pub fn descriptor(&self) -> TreeDescriptor {
        TreeDescriptor {
            currency: self.currency,
            swap_type: self.swap_type,
            our_leaf: self.our_leaf,
            our_public_key: self.our_public_key.to_string(),
            counterparty_public_key: self.counterparty_public_key.to_string(),
            preimage_hash: hex::encode(self.preimage_hash),
            timeout_block_height: self.timeout_block_height,
        }
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn swap_type(&self) -> SwapType {
        self.swap_type
    }

    pub fn our_leaf(&self) -> Leaf {
        self.our_leaf
    }

    pub fn our_public_key(&self) -> PublicKey {
        self.our_public_key
    }

    pub fn counterparty_public_key(&self) -> PublicKey {
        self.counterparty_public_key
    }

    pub fn preimage_hash(&self) -> [u8; 32] {
        self.preimage_hash
    }

    pub fn timeout_block_height(&self) -> u32 {
        self.timeout_block_height
    }

    pub fn leaf_script(&self, leaf: Leaf) -> &ScriptBuf {
        match leaf {
            Leaf::Claim => &self.claim_leaf,
            Leaf::Refund => &self.refund_leaf,
        }
    }

    pub fn leaf_version(&self) -> u8 {
        match self.spend_info {
            SpendInfo::Bitcoin(_) => LeafVersion::TapScript.to_consensus(),
            SpendInfo::Liquid(_) => LIQUID_LEAF_VERSION,
        }
    }

    /// Untweaked MuSig2 aggregate of `[counterparty, ours]`.
    pub fn internal_key(&self) -> XOnlyPublicKey {
        self.internal_key
    }

    pub fn output_key(&self) -> XOnlyPublicKey {
        match &self.spend_info {
            SpendInfo::Bitcoin(info) => info.output_key().to_inner(),
            SpendInfo::Liquid(info) => info.output_key().into_inner(),
        }
    }

    /// Segwit v1 scriptPubKey, identical for both chain families.
    pub fn output_script(&self) -> Vec<u8> {
        let mut script = Vec::with_capacity(34);
        script.push(0x51);
        script.push(0x20);
        script.extend_from_slice(&self.output_key().serialize());
        script
    }

    /// Taproot address of the output. Liquid addresses are confidential and need the
    /// blinding public key.
    pub fn address(&self, network: Network, blinding_key: Option<PublicKey>) -> Result<String> {
        match &self.spend_info {
            SpendInfo::Bitcoin(info) => {
                Ok(bitcoin::Address::p2tr_tweaked(info.output_key(), network.bitcoin()).to_string())
            }
            SpendInfo::Liquid(info) => {
                let blinding_key =
                    blinding_key.context("liquid swap address requires a blinding key")?;
                Ok(elements::Address::p2tr(
                    &Secp256k1::new(),
                    info.internal_key(),
                    info.merkle_root(),
                    Some(blinding_key),
                    network.liquid_params(),
                )
                .to_string())
            }
        }
    }

    /// Checks that `expected` pays to exactly the output derived here.
    pub fn verify_address(&self, network: Network, expected: &str) -> Result<()> {
        let expected_script = match self.currency {
            Currency::Btc => bitcoin::Address::from_str(expected)
                .with_context(|| format!("parse address {expected}"))?
                .require_network(network.bitcoin())
                .with_context(|| format!("address {expected} is not for {network}"))?
                .script_pubkey()
                .to_bytes(),
            Currency::Liquid => {
                let address = elements::Address::from_str(expected)
                    .with_context(|| format!("parse address {expected}"))?;
                anyhow::ensure!(
                    address.params == network.liquid_params(),
                    "address {expected} is not for {network}"
                );
                address.script_pubkey().to_bytes()
            }
        };

        let derived = self.output_script();
        if expected_script != derived {
            return Err(SwapError::ScriptMismatch {
                expected: expected.to_string(),
                derived: hex::encode(derived),
            }
            .into());
        }
        Ok(())
    }

    /// Compares leaf scripts announced by the server with the local derivation.
    pub fn verify_leaves(&self, claim_leaf_hex: &str, refund_leaf_hex: &str) -> Result<()> {
        for (leaf, announced) in [(Leaf::Claim, claim_leaf_hex), (Leaf::Refund, refund_leaf_hex)] {
            let ours = hex::encode(self.leaf_script(leaf).as_bytes());
            if !ours.eq_ignore_ascii_case(announced) {
                return Err(SwapError::ScriptMismatch {
                    expected: announced.to_string(),
                    derived: ours,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Serialized control block for a script-path spend of `leaf`.
    pub fn control_block(&self, leaf: Leaf) -> Result<Vec<u8>> {
        let script = self.leaf_script(leaf);
        match &self.spend_info {
            SpendInfo::Bitcoin(info) => Ok(info
                .control_block(&(script.clone(), LeafVersion::TapScript))
                .context("leaf not found in taproot tree")?
                .serialize()),
            SpendInfo::Liquid(info) => Ok(info
                .control_block(&(
                    elements::Script::from(script.to_bytes()),
                    elements::taproot::LeafVersion::default(),
                ))
                .context("leaf not found in taproot tree")?
                .serialize()),
        }
    }

    pub fn bitcoin_leaf_hash(&self, leaf: Leaf) -> TapLeafHash {
        TapLeafHash::from_script(self.leaf_script(leaf), LeafVersion::TapScript)
    }

    pub fn liquid_leaf_hash(&self, leaf: Leaf) -> elements::taproot::TapLeafHash {
        elements::taproot::TapLeafHash::from_script(
            &elements::Script::from(self.leaf_script(leaf).to_bytes()),
            elements::taproot::LeafVersion::default(),
        )
    }

    /// Key aggregation context tweaked with the tree root, ready for signing the key path.
    pub fn tweaked_key_agg_cache(&self) -> Result<MusigKeyAggCache> {
        let tweak = match &self.spend_info {
            SpendInfo::Bitcoin(info) => info.tap_tweak().to_byte_array(),
            SpendInfo::Liquid(info) => info.tap_tweak().to_byte_array(),
        };
        let tweak = SecretKey::from_slice(&tweak).context("taproot tweak out of range")?;

        let mut cache = key_agg_cache(self.counterparty_public_key, self.our_public_key);
        cache
            .pubkey_xonly_tweak_add(&Secp256k1::new(), tweak)
            .map_err(|e| anyhow::anyhow!("tweak aggregate key: {e:?}"))?;
        Ok(cache)
    }
}

fn key_agg_cache(counterparty: PublicKey, ours: PublicKey) -> MusigKeyAggCache {
    MusigKeyAggCache::new(&Secp256k1::new(), &[counterparty, ours])
}
