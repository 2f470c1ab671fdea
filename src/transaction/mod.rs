mod bitcoin;
mod liquid;

use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use ::bitcoin::secp256k1::{Keypair, Message, Secp256k1, SecretKey};
use lwk_wollet::elements;

use crate::boltz::PartialSignature;
use crate::error::SwapError;
use crate::network::{Currency, Network};
use crate::swap::{LegSide, SwapType};
use crate::taproot::{Leaf, SigningSession, SwapTree};

pub use self::bitcoin::bitcoin_key_spend_sighash;
pub use self::liquid::liquid_key_spend_sighash;

/// Size of a schnorr signature without sighash flag.
const SIGNATURE_LEN: usize = 64;

/// One lockup output slated for a claim or refund. Rebuilt from the swap record on demand.
#[derive(Debug, Clone)]
pub struct Output {
    pub swap_id: String,
    pub swap_type: SwapType,
    pub side: LegSide,
    pub currency: Currency,
    pub lockup: LockupTransaction,
    pub vout: u32,
    pub value: u64,
    pub private_key: SecretKey,
    /// Present for claims, absent for refunds.
    pub preimage: Option<[u8; 32]>,
    pub tree: SwapTree,
    pub cooperative: bool,
    pub destination: String,
    pub timeout_block_height: u32,
}

impl Output {
    pub fn is_refund(&self) -> bool {
        self.preimage.is_none()
    }

    pub fn leaf(&self) -> Leaf {
        if self.is_refund() {
            Leaf::Refund
        } else {
            Leaf::Claim
        }
    }

    /// Re-evaluates the cooperative flag at `height`.
    pub fn refresh_cooperative(&mut self, height: u32) {
        self.cooperative = is_cooperative(height, self.timeout_block_height);
    }
}

/// The key path is only worth trying while the server can still sign, i.e. before timeout.
pub fn is_cooperative(current_height: u32, timeout_block_height: u32) -> bool {
    current_height < timeout_block_height
}

/// Splits `total` evenly over `count` swaps; the remainder goes to the last one.
pub fn attribute_fees(total: u64, count: usize) -> Vec<u64> {
    if count == 0 {
        return Vec::new();
    }
    let count_u64 = count as u64;
    let share = total / count_u64;
    let mut fees = vec![share; count];
    if let Some(last) = fees.last_mut() {
        *last += total % count_u64;
    }
    fees
}

#[derive(Debug, Clone)]
pub enum LockupTransaction {
    Bitcoin(::bitcoin::Transaction),
    Liquid {
        transaction: elements::Transaction,
        blinding_key: Option<SecretKey>,
    },
}

impl LockupTransaction {
    pub fn from_hex(currency: Currency, tx_hex: &str, blinding_key: Option<SecretKey>) -> Result<Self> {
        let bytes = hex::decode(tx_hex).context("decode lockup transaction hex")?;
        Ok(match currency {
            Currency::Btc => LockupTransaction::Bitcoin(
                ::bitcoin::consensus::deserialize(&bytes).context("parse bitcoin transaction")?,
            ),
            Currency::Liquid => LockupTransaction::Liquid {
                transaction: elements::encode::deserialize(&bytes)
                    .context("parse liquid transaction")?,
                blinding_key,
            },
        })
    }

    pub fn currency(&self) -> Currency {
        match self {
            LockupTransaction::Bitcoin(_) => Currency::Btc,
            LockupTransaction::Liquid { .. } => Currency::Liquid,
        }
    }

    pub fn txid(&self) -> String {
        match self {
            LockupTransaction::Bitcoin(tx) => tx.compute_txid().to_string(),
            LockupTransaction::Liquid { transaction, .. } => transaction.txid().to_string(),
        }
    }

    /// Index and value of the first output paying to `address`.
    pub fn find_vout(&self, network: Network, address: &str) -> Result<(u32, u64)> {
        match self {
            LockupTransaction::Bitcoin(tx) => {
                let script = self::bitcoin::parse_address(network, address)?.script_pubkey();
                let (vout, out) = tx
                    .output
                    .iter()
                    .enumerate()
                    .find(|(_, out)| out.script_pubkey == script)
                    .with_context(|| format!("no output pays to {address}"))?;
                Ok((u32::try_from(vout)?, out.value.to_sat()))
            }
            LockupTransaction::Liquid {
                transaction,
                blinding_key,
            } => {
                let script = self::liquid::parse_address(network, address)?.script_pubkey();
                let (vout, out) = transaction
                    .output
                    .iter()
                    .enumerate()
                    .find(|(_, out)| out.script_pubkey == script)
                    .with_context(|| format!("no output pays to {address}"))?;
                let secrets = self::liquid::output_secrets(out, *blinding_key)?;
                Ok((u32::try_from(vout)?, secrets.value))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum SettlementTransaction {
    Bitcoin(::bitcoin::Transaction),
    Liquid(elements::Transaction),
}

impl SettlementTransaction {
    pub fn currency(&self) -> Currency {
        match self {
            SettlementTransaction::Bitcoin(_) => Currency::Btc,
            SettlementTransaction::Liquid(_) => Currency::Liquid,
        }
    }

    pub fn txid(&self) -> String {
        match self {
            SettlementTransaction::Bitcoin(tx) => tx.compute_txid().to_string(),
            SettlementTransaction::Liquid(tx) => tx.txid().to_string(),
        }
    }

    pub fn to_hex(&self) -> String {
        match self {
            SettlementTransaction::Bitcoin(tx) => hex::encode(::bitcoin::consensus::serialize(tx)),
            SettlementTransaction::Liquid(tx) => hex::encode(elements::encode::serialize(tx)),
        }
    }

    /// Size fees are paid on. Liquid counts confidential outputs at their explicit size.
    pub fn vsize(&self) -> usize {
        match self {
            SettlementTransaction::Bitcoin(tx) => tx.vsize(),
            SettlementTransaction::Liquid(tx) => tx.discount_vsize(),
        }
    }

    /// Witness stack of input `index`.
    pub fn witness(&self, index: usize) -> Option<Vec<Vec<u8>>> {
        match self {
            SettlementTransaction::Bitcoin(tx) => {
                tx.input.get(index).map(|input| input.witness.to_vec())
            }
            SettlementTransaction::Liquid(tx) => tx
                .input
                .get(index)
                .map(|input| input.witness.script_witness.clone()),
        }
    }

    pub fn lock_time(&self) -> u32 {
        match self {
            SettlementTransaction::Bitcoin(tx) => tx.lock_time.to_consensus_u32(),
            SettlementTransaction::Liquid(tx) => tx.lock_time.to_consensus_u32(),
        }
    }
}

/// Source of the server half of a cooperative signature.
#[async_trait]
pub trait CooperativeSigner: Send + Sync {
    async fn partial_signature(
        &self,
        output: &Output,
        transaction_hex: &str,
        pub_nonce: &[u8],
        input_index: usize,
    ) -> Result<PartialSignature>;
}

#[derive(Debug, Clone)]
pub struct ConstructedTransaction {
    pub transaction: SettlementTransaction,
    pub fee: u64,
}

/// Builds, signs and returns a settlement spending every output to their shared destination.
///
/// Inputs whose cooperative round fails are flipped to the script path and the transaction
/// is rebuilt, since the locktime may change. Any other failure aborts the whole batch.
pub async fn construct_transaction(
    network: Network,
    outputs: &mut [Output],
    fee_rate: f64,
    signer: &dyn CooperativeSigner,
    round_timeout: Duration,
) -> Result<ConstructedTransaction> {
    let first = outputs.first().context("no outputs to settle")?;
    let currency = first.currency;
    let destination = first.destination.clone();
    for output in outputs.iter() {
        anyhow::ensure!(
            output.currency == currency,
            "outputs of different currencies cannot share a transaction: {} and {}",
            currency,
            output.currency
        );
        anyhow::ensure!(
            output.destination == destination,
            "outputs with different destinations cannot share a transaction"
        );
        anyhow::ensure!(
            output.lockup.currency() == currency,
            "lockup of {} is not a {currency} transaction",
            output.swap_id
        );
    }

    'attempt: loop {
        let mut sizing = Draft::new(network, outputs, &destination, 0)?;
        for index in 0..outputs.len() {
            let witness = placeholder_witness(&outputs[index])?;
            sizing.set_witness(index, witness);
        }
        let fee = (sizing.vsize() as f64 * fee_rate).ceil() as u64;

        let mut draft = Draft::new(network, outputs, &destination, fee)?;
        for index in 0..outputs.len() {
            if !outputs[index].cooperative {
                let witness = script_path_witness(&draft, &outputs[index], index)?;
                draft.set_witness(index, witness);
            }
        }

        for index in 0..outputs.len() {
            if !outputs[index].cooperative {
                continue;
            }
            match cooperative_witness(&draft, &outputs[index], index, signer, round_timeout).await {
                Ok(witness) => draft.set_witness(index, witness),
                Err(err) => {
                    tracing::warn!(
                        swap_id = %outputs[index].swap_id,
                        error = %format!("{err:#}"),
                        "cooperative signing failed, falling back to script path"
                    );
                    outputs[index].cooperative = false;
                    continue 'attempt;
                }
            }
        }

        return Ok(ConstructedTransaction {
            transaction: draft.into_settlement(),
            fee,
        });
    }
}

/// Unsigned settlement under construction, with the prevouts its sighashes commit to.
enum Draft {
    Bitcoin {
        tx: ::bitcoin::Transaction,
        prevouts: Vec<::bitcoin::TxOut>,
    },
    Liquid {
        tx: elements::Transaction,
        prevouts: Vec<elements::TxOut>,
        genesis_hash: elements::BlockHash,
    },
}

impl Draft {
    fn new(network: Network, outputs: &[Output], destination: &str, fee: u64) -> Result<Self> {
        let lock_time = lock_time(outputs);
        match outputs.first().map(|o| o.currency) {
            Some(Currency::Btc) => {
                let (tx, prevouts) =
                    self::bitcoin::draft(network, outputs, destination, fee, lock_time)?;
                Ok(Draft::Bitcoin { tx, prevouts })
            }
            Some(Currency::Liquid) => {
                let (tx, prevouts) =
                    self::liquid::draft(network, outputs, destination, fee, lock_time)?;
                Ok(Draft::Liquid {
                    tx,
                    prevouts,
                    genesis_hash: network.liquid_genesis_hash()?,
                })
            }
            None => anyhow::bail!("no outputs to settle"),
        }
    }

    fn vsize(&self) -> usize {
        match self {
            Draft::Bitcoin { tx, .. } => tx.vsize(),
            Draft::Liquid { tx, .. } => tx.discount_vsize(),
        }
    }

    fn to_hex(&self) -> String {
        match self {
            Draft::Bitcoin { tx, .. } => hex::encode(::bitcoin::consensus::serialize(tx)),
            Draft::Liquid { tx, .. } => hex::encode(elements::encode::serialize(tx)),
        }
    }

    fn set_witness(&mut self, index: usize, witness: Vec<Vec<u8>>) {
        match self {
            Draft::Bitcoin { tx, .. } => {
                tx.input[index].witness = ::bitcoin::Witness::from_slice(&witness);
            }
            Draft::Liquid { tx, .. } => {
                tx.input[index].witness.script_witness = witness;
            }
        }
    }

    fn key_spend_sighash(&self, index: usize) -> Result<[u8; 32]> {
        match self {
            Draft::Bitcoin { tx, prevouts } => bitcoin_key_spend_sighash(tx, prevouts, index),
            Draft::Liquid {
                tx,
                prevouts,
                genesis_hash,
            } => liquid_key_spend_sighash(tx, prevouts, index, *genesis_hash),
        }
    }

    fn script_spend_sighash(&self, index: usize, tree: &SwapTree, leaf: Leaf) -> Result<[u8; 32]> {
        match self {
            Draft::Bitcoin { tx, prevouts } => {
                self::bitcoin::script_spend_sighash(tx, prevouts, index, tree.bitcoin_leaf_hash(leaf))
            }
            Draft::Liquid {
                tx,
                prevouts,
                genesis_hash,
            } => self::liquid::script_spend_sighash(
                tx,
                prevouts,
                index,
                tree.liquid_leaf_hash(leaf),
                *genesis_hash,
            ),
        }
    }

    fn into_settlement(self) -> SettlementTransaction {
        match self {
            Draft::Bitcoin { tx, .. } => SettlementTransaction::Bitcoin(tx),
            Draft::Liquid { tx, .. } => SettlementTransaction::Liquid(tx),
        }
    }
}

/// Highest timeout among inputs refunded through the script path, zero otherwise.
fn lock_time(outputs: &[Output]) -> u32 {
    outputs
        .iter()
        .filter(|output| output.is_refund() && !output.cooperative)
        .map(|output| output.timeout_block_height)
        .max()
        .unwrap_or(0)
}

fn placeholder_witness(output: &Output) -> Result<Vec<Vec<u8>>> {
    if output.cooperative {
        return Ok(vec![vec![0u8; SIGNATURE_LEN]]);
    }
    script_path_stack(output, vec![0u8; SIGNATURE_LEN])
}

fn script_path_witness(draft: &Draft, output: &Output, index: usize) -> Result<Vec<Vec<u8>>> {
    let sighash = draft
        .script_spend_sighash(index, &output.tree, output.leaf())
        .with_context(|| format!("script path sighash of input {index}"))?;

    let secp = Secp256k1::new();
    let keypair = Keypair::from_secret_key(&secp, &output.private_key);
    let signature = secp.sign_schnorr(&Message::from_digest(sighash), &keypair);
    script_path_stack(output, signature.serialize().to_vec())
}

fn script_path_stack(output: &Output, signature: Vec<u8>) -> Result<Vec<Vec<u8>>> {
    let leaf = output.leaf();
    let mut stack = vec![signature];
    if let Some(preimage) = output.preimage {
        stack.push(preimage.to_vec());
    }
    stack.push(output.tree.leaf_script(leaf).to_bytes());
    stack.push(output.tree.control_block(leaf)?);
    Ok(stack)
}

async fn cooperative_witness(
    draft: &Draft,
    output: &Output,
    index: usize,
    signer: &dyn CooperativeSigner,
    round_timeout: Duration,
) -> Result<Vec<Vec<u8>>> {
    let sighash = draft
        .key_spend_sighash(index)
        .with_context(|| format!("key path sighash of input {index}"))?;
    let session = SigningSession::new(&output.tree, &output.private_key, sighash)?;

    let response = tokio::time::timeout(
        round_timeout,
        signer.partial_signature(output, &draft.to_hex(), &session.public_nonce(), index),
    )
    .await
    .map_err(|_| SwapError::SigningProtocol("cooperative round timed out".to_string()))??;

    let nonce = hex::decode(&response.pub_nonce)
        .map_err(|e| SwapError::SigningProtocol(format!("decode server nonce: {e}")))?;
    let partial = hex::decode(&response.partial_signature)
        .map_err(|e| SwapError::SigningProtocol(format!("decode server partial signature: {e}")))?;

    let signature = session.finalize(&nonce, &partial)?;
    Ok(vec![signature.serialize().to_vec()])
}
