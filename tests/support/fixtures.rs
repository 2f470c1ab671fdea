use anyhow::{Context as _, Result};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use lightning_invoice::{InvoiceBuilder, PaymentSecret};

use ln_taproot_swap::network::{Currency, Network};
use ln_taproot_swap::swap::{LegSide, Pair, SwapLeg, SwapRecord, SwapState, SwapType};
use ln_taproot_swap::taproot::{Leaf, SwapTree};
use ln_taproot_swap::transaction::{LockupTransaction, Output};

pub const NETWORK: Network = Network::Regtest;

pub fn our_key() -> Result<SecretKey> {
    SecretKey::from_slice(&[0x11; 32]).context("our key")
}

pub fn server_key() -> Result<SecretKey> {
    SecretKey::from_slice(&[0x22; 32]).context("server key")
}

/// Preimage unique to `swap_id`.
pub fn preimage(swap_id: &str) -> [u8; 32] {
    sha256::Hash::hash(swap_id.as_bytes()).to_byte_array()
}

pub fn preimage_hash(preimage: &[u8; 32]) -> [u8; 32] {
    sha256::Hash::hash(preimage).to_byte_array()
}

pub fn bitcoin_tree(
    swap_type: SwapType,
    our_leaf: Leaf,
    preimage_hash: [u8; 32],
    timeout_block_height: u32,
) -> Result<SwapTree> {
    let secp = Secp256k1::new();
    SwapTree::new(
        Currency::Btc,
        swap_type,
        our_leaf,
        our_key()?.public_key(&secp),
        server_key()?.public_key(&secp),
        preimage_hash,
        timeout_block_height,
    )
}

/// Regtest key-path address owned by neither party.
pub fn destination(seed: u8) -> Result<String> {
    let secp = Secp256k1::new();
    let key = SecretKey::from_slice(&[seed; 32]).context("destination key")?;
    let (xonly, _) = key.x_only_public_key(&secp);
    Ok(bitcoin::Address::p2tr(&secp, xonly, None, NETWORK.bitcoin()).to_string())
}

/// Funding transaction paying `value` to `script_pubkey` at output 1.
pub fn lockup_transaction(script_pubkey: Vec<u8>, value: u64, seed: u8) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array([seed; 32]), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![
            TxOut {
                value: Amount::from_sat(50_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x6a, 0x01, seed]),
            },
            TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::from_bytes(script_pubkey),
            },
        ],
    }
}

/// Signed regtest BOLT11 invoice for `payment_hash`.
pub fn invoice(payment_hash: [u8; 32], amount_sat: u64) -> Result<String> {
    let node_key = SecretKey::from_slice(&[0x44; 32]).context("node key")?;
    let invoice = InvoiceBuilder::new(lightning_invoice::Currency::Regtest)
        .description("swap".to_string())
        .payment_hash(sha256::Hash::from_byte_array(payment_hash))
        .payment_secret(PaymentSecret([0x55; 32]))
        .current_timestamp()
        .min_final_cltv_expiry_delta(144)
        .amount_milli_satoshis(amount_sat * 1000)
        .build_signed(|hash| Secp256k1::new().sign_ecdsa_recoverable(hash, &node_key))
        .map_err(|e| anyhow::anyhow!("build invoice: {e:?}"))?;
    Ok(invoice.to_string())
}

/// A swap record together with its derived tree and the lockup funding it.
pub struct SwapFixture {
    pub record: SwapRecord,
    pub tree: SwapTree,
    pub lockup: Transaction,
}

impl SwapFixture {
    pub fn lockup_txid(&self) -> String {
        self.lockup.compute_txid().to_string()
    }

    pub fn lockup_hex(&self) -> String {
        hex::encode(bitcoin::consensus::serialize(&self.lockup))
    }

    /// Output of our leg as the engine would rebuild it.
    pub fn output(&self, side: LegSide, cooperative: bool) -> Result<Output> {
        let leg = self.record.require_leg(side)?;
        Ok(Output {
            swap_id: self.record.id.clone(),
            swap_type: self.record.swap_type,
            side,
            currency: Currency::Btc,
            lockup: LockupTransaction::Bitcoin(self.lockup.clone()),
            vout: 1,
            value: self.lockup.output[1].value.to_sat(),
            private_key: self.record.private_key,
            preimage: match side {
                LegSide::To => self.record.preimage,
                LegSide::From => None,
            },
            tree: self.tree.clone(),
            cooperative,
            destination: leg.destination.clone().context("destination")?,
            timeout_block_height: leg.timeout_block_height,
        })
    }
}

fn leg(tree: &SwapTree, timeout_block_height: u32, amount: u64, seed: u8) -> Result<SwapLeg> {
    Ok(SwapLeg {
        currency: Currency::Btc,
        lockup_address: tree.address(NETWORK, None)?,
        blinding_key: None,
        tree: tree.descriptor(),
        timeout_block_height,
        expected_amount: amount,
        lockup_txid: None,
        settlement_txid: None,
        destination: Some(destination(seed)?),
    })
}

fn record(id: &str, swap_type: SwapType, preimage: Option<[u8; 32]>, hash: [u8; 32]) -> Result<SwapRecord> {
    Ok(SwapRecord {
        id: id.to_string(),
        swap_type,
        pair: Pair {
            from: Currency::Btc,
            to: Currency::Btc,
        },
        state: SwapState::Pending,
        error: None,
        status: "swap.created".to_string(),
        private_key: our_key()?,
        preimage,
        preimage_hash: hash,
        invoice: None,
        accept_zero_conf: true,
        external_pay: false,
        service_fee_percent: 0.1,
        from: None,
        to: None,
        service_fee: None,
        onchain_fee: None,
        created_at: 1_700_000_000,
    })
}

/// Reverse swap whose server lockup of `amount` pays our claim address.
pub fn reverse_swap(id: &str, timeout_block_height: u32, amount: u64) -> Result<SwapFixture> {
    let preimage = preimage(id);
    let hash = preimage_hash(&preimage);
    let tree = bitcoin_tree(SwapType::Reverse, Leaf::Claim, hash, timeout_block_height)?;

    let mut record = record(id, SwapType::Reverse, Some(preimage), hash)?;
    record.invoice = Some(invoice(hash, amount + 1_000)?);
    record.to = Some(leg(&tree, timeout_block_height, amount, 0x66)?);

    let lockup = lockup_transaction(tree.output_script(), amount, id.len() as u8);
    Ok(SwapFixture {
        record,
        tree,
        lockup,
    })
}

/// Submarine swap whose lockup of `amount` we funded.
pub fn submarine_swap(id: &str, timeout_block_height: u32, amount: u64) -> Result<SwapFixture> {
    let hash = preimage_hash(&preimage(id));
    let tree = bitcoin_tree(SwapType::Submarine, Leaf::Refund, hash, timeout_block_height)?;

    let mut record = record(id, SwapType::Submarine, None, hash)?;
    record.from = Some(leg(&tree, timeout_block_height, amount, 0x77)?);

    let lockup = lockup_transaction(tree.output_script(), amount, id.len() as u8 + 100);
    Ok(SwapFixture {
        record,
        tree,
        lockup,
    })
}

/// Chain swap with both lockups on bitcoin.
pub struct ChainFixture {
    pub record: SwapRecord,
    pub from_tree: SwapTree,
    pub to_tree: SwapTree,
    pub user_lockup: Transaction,
    pub server_lockup: Transaction,
}

pub fn chain_swap(id: &str, timeout_block_height: u32, amount: u64) -> Result<ChainFixture> {
    let preimage = preimage(id);
    let hash = preimage_hash(&preimage);
    let from_tree = bitcoin_tree(SwapType::Chain, Leaf::Refund, hash, timeout_block_height + 100)?;
    let to_tree = bitcoin_tree(SwapType::Chain, Leaf::Claim, hash, timeout_block_height)?;

    let mut record = record(id, SwapType::Chain, Some(preimage), hash)?;
    record.from = Some(leg(&from_tree, timeout_block_height + 100, amount, 0x77)?);
    record.to = Some(leg(&to_tree, timeout_block_height, amount - 1_000, 0x66)?);

    let user_lockup = lockup_transaction(from_tree.output_script(), amount, id.len() as u8 + 150);
    let server_lockup = lockup_transaction(to_tree.output_script(), amount - 1_000, id.len() as u8 + 200);
    Ok(ChainFixture {
        record,
        from_tree,
        to_tree,
        user_lockup,
        server_lockup,
    })
}
