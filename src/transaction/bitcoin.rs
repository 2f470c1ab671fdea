use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::TapLeafHash;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use super::{LockupTransaction, Output};
use crate::network::Network;

pub(super) fn parse_address(network: Network, address: &str) -> Result<Address> {
    Address::from_str(address)
        .with_context(|| format!("parse address {address}"))?
        .require_network(network.bitcoin())
        .with_context(|| format!("address {address} is not for {network}"))
}

/// Unsigned settlement with one input per output and a single payout to `destination`.
pub(super) fn draft(
    network: Network,
    outputs: &[Output],
    destination: &str,
    fee: u64,
    lock_time: u32,
) -> Result<(Transaction, Vec<TxOut>)> {
    let destination = parse_address(network, destination)?;

    let mut inputs = Vec::with_capacity(outputs.len());
    let mut prevouts = Vec::with_capacity(outputs.len());
    let mut total = 0u64;
    for output in outputs {
        let LockupTransaction::Bitcoin(lockup) = &output.lockup else {
            anyhow::bail!("lockup of {} is not a bitcoin transaction", output.swap_id);
        };
        let prevout = lockup
            .output
            .get(output.vout as usize)
            .with_context(|| format!("lockup of {} has no output {}", output.swap_id, output.vout))?;

        total = total
            .checked_add(prevout.value.to_sat())
            .context("input value overflow")?;
        inputs.push(TxIn {
            previous_output: OutPoint::new(lockup.compute_txid(), output.vout),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
            witness: Witness::new(),
        });
        prevouts.push(prevout.clone());
    }

    anyhow::ensure!(
        total > fee,
        "inputs worth {total} sat cannot pay a fee of {fee} sat"
    );

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(lock_time),
        input: inputs,
        output: vec![TxOut {
            value: Amount::from_sat(total - fee),
            script_pubkey: destination.script_pubkey(),
        }],
    };
    Ok((tx, prevouts))
}

/// BIP341 key-path sighash of input `index` with `SIGHASH_DEFAULT`.
pub fn bitcoin_key_spend_sighash(
    tx: &Transaction,
    prevouts: &[TxOut],
    index: usize,
) -> Result<[u8; 32]> {
    let sighash = SighashCache::new(tx)
        .taproot_key_spend_signature_hash(index, &Prevouts::All(prevouts), TapSighashType::Default)
        .map_err(|e| anyhow::anyhow!("compute key spend sighash: {e}"))?;
    Ok(sighash.to_byte_array())
}

pub(super) fn script_spend_sighash(
    tx: &Transaction,
    prevouts: &[TxOut],
    index: usize,
    leaf_hash: TapLeafHash,
) -> Result<[u8; 32]> {
    let sighash = SighashCache::new(tx)
        .taproot_script_spend_signature_hash(
            index,
            &Prevouts::All(prevouts),
            leaf_hash,
            TapSighashType::Default,
        )
        .map_err(|e| anyhow::anyhow!("compute script spend sighash: {e}"))?;
    Ok(sighash.to_byte_array())
}
