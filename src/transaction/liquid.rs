use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use bitcoin::secp256k1::rand::thread_rng;
use lwk_wollet::elements::confidential::{
    Asset, AssetBlindingFactor, Nonce, Value, ValueBlindingFactor,
};
use lwk_wollet::elements::hashes::Hash as _;
use lwk_wollet::elements::opcodes::all::OP_RETURN;
use lwk_wollet::elements::script::Builder;
use lwk_wollet::elements::secp256k1_zkp::{PublicKey, Secp256k1, SecretKey};
use lwk_wollet::elements::sighash::{Prevouts, SighashCache};
use lwk_wollet::elements::taproot::TapLeafHash;
use lwk_wollet::elements::{
    Address, AssetId, AssetIssuance, BlockHash, LockTime, OutPoint, RangeProofMessage, SchnorrSighashType,
    Script, Sequence, Transaction, TxIn, TxInWitness, TxOut, TxOutSecrets, TxOutWitness,
};

use super::{LockupTransaction, Output};
use crate::network::Network;

pub(super) fn parse_address(network: Network, address: &str) -> Result<Address> {
    let parsed = Address::from_str(address).with_context(|| format!("parse address {address}"))?;
    anyhow::ensure!(
        parsed.params == network.liquid_params(),
        "address {address} is not for {network}"
    );
    Ok(parsed)
}

/// Asset, value and blinding factors of `out`, unblinding it when it is confidential.
pub(super) fn output_secrets(out: &TxOut, blinding_key: Option<SecretKey>) -> Result<TxOutSecrets> {
    if let (Asset::Explicit(asset), Value::Explicit(value)) = (out.asset, out.value) {
        return Ok(TxOutSecrets {
            asset,
            asset_bf: AssetBlindingFactor::zero(),
            value,
            value_bf: ValueBlindingFactor::zero(),
        });
    }

    let blinding_key = blinding_key.context("confidential output needs a blinding key")?;
    out.unblind(&Secp256k1::new(), blinding_key)
        .map_err(|e| anyhow::anyhow!("unblind lockup output: {e}"))
}

/// Unsigned settlement paying everything but the fee to `destination`.
///
/// Confidential destinations get a blinded output. When blinded inputs pay an explicit
/// destination, an empty OP_RETURN output blinded to a throwaway key balances the
/// commitments.
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
    let mut secrets = Vec::with_capacity(outputs.len());
    for output in outputs {
        let LockupTransaction::Liquid {
            transaction,
            blinding_key,
        } = &output.lockup
        else {
            anyhow::bail!("lockup of {} is not a liquid transaction", output.swap_id);
        };
        let prevout = transaction
            .output
            .get(output.vout as usize)
            .with_context(|| format!("lockup of {} has no output {}", output.swap_id, output.vout))?;

        secrets.push(
            output_secrets(prevout, *blinding_key)
                .with_context(|| format!("read lockup output of {}", output.swap_id))?,
        );
        inputs.push(TxIn {
            previous_output: OutPoint::new(transaction.txid(), output.vout),
            is_pegin: false,
            script_sig: Script::new(),
            sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
            asset_issuance: AssetIssuance::default(),
            witness: TxInWitness::default(),
        });
        prevouts.push(prevout.clone());
    }

    let asset = secrets.first().map(|s| s.asset).context("no inputs")?;
    anyhow::ensure!(
        secrets.iter().all(|s| s.asset == asset),
        "lockup outputs carry different assets"
    );
    let total = secrets
        .iter()
        .try_fold(0u64, |acc, s| acc.checked_add(s.value))
        .context("input value overflow")?;
    anyhow::ensure!(
        total > fee,
        "inputs worth {total} sat cannot pay a fee of {fee} sat"
    );
    let payout = total - fee;

    let has_blinded_input = prevouts
        .iter()
        .any(|out| out.asset.is_confidential() || out.value.is_confidential());

    let mut tx_outputs = Vec::with_capacity(3);
    match destination.blinding_pubkey {
        Some(blinding_pubkey) => {
            tx_outputs.push(blind(
                asset,
                payout,
                destination.script_pubkey(),
                blinding_pubkey,
                &secrets,
                &[explicit(fee)],
            )?);
        }
        None => {
            tx_outputs.push(TxOut {
                asset: Asset::Explicit(asset),
                value: Value::Explicit(payout),
                nonce: Nonce::Null,
                script_pubkey: destination.script_pubkey(),
                witness: TxOutWitness::default(),
            });
            if has_blinded_input {
                let secp = Secp256k1::new();
                let throwaway =
                    PublicKey::from_secret_key(&secp, &SecretKey::new(&mut thread_rng()));
                tx_outputs.push(blind(
                    asset,
                    0,
                    Builder::new().push_opcode(OP_RETURN).into_script(),
                    throwaway,
                    &secrets,
                    &[explicit(payout), explicit(fee)],
                )?);
            }
        }
    }
    tx_outputs.push(TxOut::new_fee(fee, asset));

    let lock_time = if lock_time == 0 {
        LockTime::ZERO
    } else {
        LockTime::from_height(lock_time).context("invalid refund locktime")?
    };

    let tx = Transaction {
        version: 2,
        lock_time,
        input: inputs,
        output: tx_outputs,
    };
    Ok((tx, prevouts))
}

fn explicit(value: u64) -> (u64, AssetBlindingFactor, ValueBlindingFactor) {
    (value, AssetBlindingFactor::zero(), ValueBlindingFactor::zero())
}

/// Confidential output whose value blinding factor balances `inputs` against the
/// explicit `others`.
fn blind(
    asset: AssetId,
    value: u64,
    script_pubkey: Script,
    blinding_pubkey: PublicKey,
    inputs: &[TxOutSecrets],
    others: &[(u64, AssetBlindingFactor, ValueBlindingFactor)],
) -> Result<TxOut> {
    let secp = Secp256k1::new();
    let out_abf = AssetBlindingFactor::new(&mut thread_rng());
    let (blinded_asset, surjection_proof) = Asset::Explicit(asset)
        .blind(&mut thread_rng(), &secp, out_abf, inputs)
        .map_err(|e| anyhow::anyhow!("blind output asset: {e}"))?;

    let input_factors: Vec<_> = inputs
        .iter()
        .map(|s| (s.value, s.asset_bf, s.value_bf))
        .collect();
    let out_vbf = ValueBlindingFactor::last(&secp, value, out_abf, &input_factors, others);

    let ephemeral_sk = SecretKey::new(&mut thread_rng());
    let message = RangeProofMessage { asset, bf: out_abf };
    let (blinded_value, nonce, rangeproof) = Value::Explicit(value)
        .blind(
            &secp,
            out_vbf,
            blinding_pubkey,
            ephemeral_sk,
            &script_pubkey,
            &message,
        )
        .map_err(|e| anyhow::anyhow!("blind output value: {e}"))?;

    Ok(TxOut {
        asset: blinded_asset,
        value: blinded_value,
        nonce,
        script_pubkey,
        witness: TxOutWitness {
            surjection_proof: Some(Box::new(surjection_proof)),
            rangeproof: Some(Box::new(rangeproof)),
        },
    })
}

pub fn liquid_key_spend_sighash(
    tx: &Transaction,
    prevouts: &[TxOut],
    index: usize,
    genesis_hash: BlockHash,
) -> Result<[u8; 32]> {
    let sighash = SighashCache::new(tx)
        .taproot_key_spend_signature_hash(
            index,
            &Prevouts::All(prevouts),
            SchnorrSighashType::Default,
            genesis_hash,
        )
        .map_err(|e| anyhow::anyhow!("compute key spend sighash: {e}"))?;
    Ok(sighash.to_byte_array())
}

pub(super) fn script_spend_sighash(
    tx: &Transaction,
    prevouts: &[TxOut],
    index: usize,
    leaf_hash: TapLeafHash,
    genesis_hash: BlockHash,
) -> Result<[u8; 32]> {
    let sighash = SighashCache::new(tx)
        .taproot_script_spend_signature_hash(
            index,
            &Prevouts::All(prevouts),
            leaf_hash,
            SchnorrSighashType::Default,
            genesis_hash,
        )
        .map_err(|e| anyhow::anyhow!("compute script spend sighash: {e}"))?;
    Ok(sighash.to_byte_array())
}
