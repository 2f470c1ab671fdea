use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use clap::Parser as _;
use ln_taproot_swap::network::{Currency, Network};
use ln_taproot_swap::swap::SwapType;
use ln_taproot_swap::taproot::{Leaf, TreeDescriptor};
use serde_json::json;

/// Derives the taproot output of a swap offline and prints it as JSON.
#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, value_enum, default_value_t = Network::Mainnet)]
    network: Network,

    #[arg(long, value_enum)]
    currency: Currency,

    #[arg(long, value_enum)]
    swap_type: SwapType,

    /// Leaf whose key is ours.
    #[arg(long, value_enum)]
    our_leaf: Leaf,

    #[arg(long)]
    our_public_key: String,

    #[arg(long)]
    counterparty_public_key: String,

    /// SHA256 of the preimage, hex.
    #[arg(long)]
    preimage_hash: String,

    #[arg(long)]
    timeout_block_height: u32,

    /// Blinding private key, hex. Required for Liquid.
    #[arg(long)]
    blinding_key: Option<String>,

    /// Fails unless the derived address pays to the same output.
    #[arg(long)]
    expected_address: Option<String>,
}

fn main() -> Result<()> {
    ln_taproot_swap::logging::init().ok();
    let args = Args::parse();

    let tree = TreeDescriptor {
        currency: args.currency,
        swap_type: args.swap_type,
        our_leaf: args.our_leaf,
        our_public_key: args.our_public_key,
        counterparty_public_key: args.counterparty_public_key,
        preimage_hash: args.preimage_hash,
        timeout_block_height: args.timeout_block_height,
    }
    .build()?;

    let blinding_public_key = args
        .blinding_key
        .as_deref()
        .map(|key| {
            SecretKey::from_str(key)
                .context("parse blinding key")
                .map(|key| PublicKey::from_secret_key(&Secp256k1::new(), &key))
        })
        .transpose()?;
    let address = tree.address(args.network, blinding_public_key)?;

    if let Some(expected) = &args.expected_address {
        tree.verify_address(args.network, expected)?;
        tracing::info!(address = %expected, "expected address matches");
    }

    let leaf = |leaf: Leaf| -> Result<serde_json::Value> {
        let script = tree.leaf_script(leaf);
        Ok(json!({
          "asm": script.to_asm_string(),
          "hex": hex::encode(script.as_bytes()),
          "control_block": hex::encode(tree.control_block(leaf)?),
        }))
    };

    let out = json!({
      "address": address,
      "output_script": hex::encode(tree.output_script()),
      "internal_key": tree.internal_key().to_string(),
      "output_key": tree.output_key().to_string(),
      "leaf_version": tree.leaf_version(),
      "claim_leaf": leaf(Leaf::Claim)?,
      "refund_leaf": leaf(Leaf::Refund)?,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
