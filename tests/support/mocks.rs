use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::secp256k1::rand::{RngCore as _, thread_rng};
use bitcoin::secp256k1::{Keypair, Message, Secp256k1, SecretKey};
use lwk_wollet::elements::secp256k1_zkp::{
    MusigAggNonce, MusigPubNonce, MusigSecNonce, MusigSession, MusigSessionId,
};
use tokio::sync::{mpsc, oneshot, watch};

use ln_taproot_swap::boltz::{
    BoltzApi, ChainSwapQuote, ChainSwapTransactions, ClaimDetails, CooperativeRequest,
    PartialSignature, SwapStatusResponse, SwapTransaction,
};
use ln_taproot_swap::chain::{BlockEpoch, ChainBackend};
use ln_taproot_swap::error::SwapError;
use ln_taproot_swap::lightning::{LightningNode, PaymentResult, PaymentState};
use ln_taproot_swap::network::Currency;
use ln_taproot_swap::taproot::SwapTree;
use ln_taproot_swap::transaction::{
    LockupTransaction, SettlementTransaction, bitcoin_key_spend_sighash,
};

use super::fixtures;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn status(id: &str, status: &str) -> SwapStatusResponse {
    SwapStatusResponse {
        id: id.to_string(),
        status: status.to_string(),
        zero_conf_rejected: false,
        transaction: None,
        failure_reason: None,
    }
}

struct Stream {
    events: mpsc::Sender<SwapStatusResponse>,
    broken: oneshot::Sender<()>,
}

#[derive(Default)]
struct BoltzState {
    statuses: HashMap<String, SwapStatusResponse>,
    streams: HashMap<String, Stream>,
    connects: HashMap<String, usize>,
    trees: HashMap<String, SwapTree>,
    prevouts: HashMap<bitcoin::OutPoint, bitcoin::TxOut>,
    swap_transactions: HashMap<String, SwapTransaction>,
    chain_transactions: HashMap<String, ChainSwapTransactions>,
    quotes: HashMap<String, ChainSwapQuote>,
    accepted_quotes: HashMap<String, ChainSwapQuote>,
    invoice_amounts: HashMap<String, u64>,
    invoices: HashMap<String, String>,
    claim_details: HashMap<String, (ClaimDetails, [u8; 32])>,
    claim_signatures: HashMap<String, PartialSignature>,
    refuse_signing: bool,
    bad_nonce: bool,
    signing_requests: usize,
    status_polls: usize,
}

/// In-memory swap server that signs cooperatively with [`fixtures::server_key`].
#[derive(Default)]
pub struct MockBoltz {
    state: Mutex<BoltzState>,
}

impl MockBoltz {
    /// Makes the server able to co-sign spends of `tree`'s output.
    pub fn add_swap(&self, id: &str, tree: &SwapTree, lockup: &bitcoin::Transaction) {
        let mut state = lock(&self.state);
        state.trees.insert(id.to_string(), tree.clone());
        let txid = lockup.compute_txid();
        for (vout, out) in lockup.output.iter().enumerate() {
            state
                .prevouts
                .insert(bitcoin::OutPoint::new(txid, vout as u32), out.clone());
        }
    }

    pub fn set_status(&self, response: SwapStatusResponse) {
        lock(&self.state)
            .statuses
            .insert(response.id.clone(), response);
    }

    /// Records `response` as the latest status and pushes it to an open stream.
    pub async fn push(&self, response: SwapStatusResponse) -> Result<()> {
        let events = {
            let mut state = lock(&self.state);
            state
                .statuses
                .insert(response.id.clone(), response.clone());
            state
                .streams
                .get(&response.id)
                .map(|stream| stream.events.clone())
        };
        let events = events.with_context(|| format!("no stream open for {}", response.id))?;
        events.send(response).await.context("push status")
    }

    /// Ends the open stream of `id` with an error.
    pub fn break_stream(&self, id: &str) -> bool {
        match lock(&self.state).streams.remove(id) {
            Some(stream) => stream.broken.send(()).is_ok(),
            None => false,
        }
    }

    pub fn is_streaming(&self, id: &str) -> bool {
        lock(&self.state)
            .streams
            .get(id)
            .is_some_and(|stream| !stream.events.is_closed())
    }

    pub fn connects(&self, id: &str) -> usize {
        lock(&self.state).connects.get(id).copied().unwrap_or(0)
    }

    pub fn status_polls(&self) -> usize {
        lock(&self.state).status_polls
    }

    pub fn set_swap_transaction(&self, id: &str, transaction: SwapTransaction) {
        lock(&self.state)
            .swap_transactions
            .insert(id.to_string(), transaction);
    }

    pub fn set_chain_transactions(&self, id: &str, transactions: ChainSwapTransactions) {
        lock(&self.state)
            .chain_transactions
            .insert(id.to_string(), transactions);
    }

    pub fn set_chain_quote(&self, id: &str, amount: u64) {
        lock(&self.state)
            .quotes
            .insert(id.to_string(), ChainSwapQuote { amount });
    }

    pub fn accepted_quote(&self, id: &str) -> Option<ChainSwapQuote> {
        lock(&self.state).accepted_quotes.get(id).copied()
    }

    pub fn set_invoice_amount(&self, id: &str, amount: u64) {
        lock(&self.state)
            .invoice_amounts
            .insert(id.to_string(), amount);
    }

    pub fn invoice(&self, id: &str) -> Option<String> {
        lock(&self.state).invoices.get(id).cloned()
    }

    /// Prepares claim details revealing `preimage` for a cooperative submarine claim.
    pub fn set_claim_details(&self, id: &str, preimage: [u8; 32]) -> Result<()> {
        let mut state = lock(&self.state);
        let tree = state.trees.get(id).context("unknown swap")?.clone();
        let mut transaction_hash = [0u8; 32];
        thread_rng().fill_bytes(&mut transaction_hash);
        let (_, pub_nonce) = server_nonce(&tree, Message::from_digest(transaction_hash))?;
        state.claim_details.insert(
            id.to_string(),
            (
                ClaimDetails {
                    preimage: hex::encode(preimage),
                    pub_nonce: hex::encode(pub_nonce.serialize()),
                    transaction_hash: hex::encode(transaction_hash),
                },
                transaction_hash,
            ),
        );
        Ok(())
    }

    pub fn claim_signature(&self, id: &str) -> Option<PartialSignature> {
        lock(&self.state).claim_signatures.get(id).cloned()
    }

    pub fn refuse_signing(&self, refuse: bool) {
        lock(&self.state).refuse_signing = refuse;
    }

    /// Answers signing requests with a truncated 65-byte nonce.
    pub fn send_bad_nonce(&self, bad: bool) {
        lock(&self.state).bad_nonce = bad;
    }

    pub fn signing_requests(&self) -> usize {
        lock(&self.state).signing_requests
    }

    fn co_sign(&self, request: &CooperativeRequest) -> Result<PartialSignature> {
        let (tree, prevouts, bad_nonce) = {
            let mut state = lock(&self.state);
            state.signing_requests += 1;
            if state.refuse_signing {
                anyhow::bail!("server refuses to sign {}", request.id);
            }
            let tree = state.trees.get(&request.id).context("unknown swap")?.clone();
            (tree, state.prevouts.clone(), state.bad_nonce)
        };

        let bytes = hex::decode(&request.transaction).context("decode transaction")?;
        let tx: bitcoin::Transaction =
            bitcoin::consensus::deserialize(&bytes).context("parse transaction")?;
        let spent = tx
            .input
            .iter()
            .map(|input| {
                prevouts
                    .get(&input.previous_output)
                    .cloned()
                    .context("unknown prevout")
            })
            .collect::<Result<Vec<_>>>()?;
        let message = Message::from_digest(bitcoin_key_spend_sighash(&tx, &spent, request.index)?);

        let client_nonce = hex::decode(&request.pub_nonce).context("decode client nonce")?;
        let (pub_nonce, partial) = server_partial_signature(&tree, message, &client_nonce)?;

        let mut nonce = pub_nonce.to_vec();
        if bad_nonce {
            nonce.pop();
        }
        Ok(PartialSignature {
            pub_nonce: hex::encode(nonce),
            partial_signature: hex::encode(partial),
        })
    }
}

/// Server half of a key-path signature over `message`: its public nonce and partial
/// signature.
pub fn server_partial_signature(
    tree: &SwapTree,
    message: Message,
    client_nonce: &[u8],
) -> Result<([u8; 66], [u8; 32])> {
    let client_nonce = MusigPubNonce::from_slice(client_nonce)
        .map_err(|e| anyhow::anyhow!("parse client nonce: {e:?}"))?;
    let (sec_nonce, pub_nonce) = server_nonce(tree, message)?;

    let secp = Secp256k1::new();
    let keypair = Keypair::from_secret_key(&secp, &fixtures::server_key()?);
    let key_agg_cache = tree.tweaked_key_agg_cache()?;
    let agg_nonce = MusigAggNonce::new(&secp, &[client_nonce, pub_nonce]);
    let session = MusigSession::new(&secp, &key_agg_cache, agg_nonce, message);
    let partial = session
        .partial_sign(&secp, sec_nonce, &keypair, &key_agg_cache)
        .map_err(|e| anyhow::anyhow!("partial sign: {e:?}"))?;
    Ok((pub_nonce.serialize(), partial.serialize()))
}

fn server_nonce(tree: &SwapTree, message: Message) -> Result<(MusigSecNonce, MusigPubNonce)> {
    let secp = Secp256k1::new();
    let server_key: SecretKey = fixtures::server_key()?;
    tree.tweaked_key_agg_cache()?
        .nonce_gen(
            &secp,
            MusigSessionId::new(&mut thread_rng()),
            server_key.public_key(&secp),
            message,
            None,
        )
        .map_err(|e| anyhow::anyhow!("server nonce: {e:?}"))
}

#[async_trait]
impl BoltzApi for MockBoltz {
    async fn swap_status(&self, id: &str) -> Result<SwapStatusResponse> {
        let mut state = lock(&self.state);
        state.status_polls += 1;
        state
            .statuses
            .get(id)
            .cloned()
            .with_context(|| format!("no status for {id}"))
    }

    async fn stream_swap_status(
        &self,
        id: &str,
        events: mpsc::Sender<SwapStatusResponse>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        let (broken, mut on_broken) = oneshot::channel();
        {
            let mut state = lock(&self.state);
            state
                .streams
                .insert(id.to_string(), Stream { events, broken });
            *state.connects.entry(id.to_string()).or_default() += 1;
        }

        tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => Ok(()),
            _ = &mut on_broken => {
                Err(SwapError::TransientNetwork(format!("stream of {id} broke")).into())
            }
        }
    }

    async fn swap_transaction(&self, id: &str) -> Result<SwapTransaction> {
        lock(&self.state)
            .swap_transactions
            .get(id)
            .cloned()
            .with_context(|| format!("no lockup transaction for {id}"))
    }

    async fn chain_swap_transactions(&self, id: &str) -> Result<ChainSwapTransactions> {
        Ok(lock(&self.state)
            .chain_transactions
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn chain_swap_quote(&self, id: &str) -> Result<ChainSwapQuote> {
        lock(&self.state)
            .quotes
            .get(id)
            .copied()
            .with_context(|| format!("no quote for {id}"))
    }

    async fn accept_chain_swap_quote(&self, id: &str, quote: &ChainSwapQuote) -> Result<()> {
        let mut state = lock(&self.state);
        anyhow::ensure!(state.quotes.get(id) == Some(quote), "quote of {id} changed");
        state.accepted_quotes.insert(id.to_string(), *quote);
        Ok(())
    }

    async fn refund_swap(&self, request: &CooperativeRequest) -> Result<PartialSignature> {
        self.co_sign(request)
    }

    async fn claim_swap(&self, request: &CooperativeRequest) -> Result<PartialSignature> {
        anyhow::ensure!(request.preimage.is_some(), "claim request without preimage");
        self.co_sign(request)
    }

    async fn swap_claim_details(&self, id: &str) -> Result<ClaimDetails> {
        lock(&self.state)
            .claim_details
            .get(id)
            .map(|(details, _)| details.clone())
            .with_context(|| format!("no claim details for {id}"))
    }

    async fn send_swap_claim_signature(
        &self,
        id: &str,
        signature: &PartialSignature,
    ) -> Result<()> {
        lock(&self.state)
            .claim_signatures
            .insert(id.to_string(), signature.clone());
        Ok(())
    }

    async fn invoice_amount(&self, id: &str) -> Result<u64> {
        lock(&self.state)
            .invoice_amounts
            .get(id)
            .copied()
            .with_context(|| format!("no invoice amount for {id}"))
    }

    async fn set_invoice(&self, id: &str, invoice: &str) -> Result<()> {
        lock(&self.state)
            .invoices
            .insert(id.to_string(), invoice.to_string());
        Ok(())
    }
}

struct ChainState {
    heights: HashMap<Currency, u32>,
    transactions: HashMap<String, LockupTransaction>,
    confirmed: HashSet<String>,
    broadcasts: Vec<SettlementTransaction>,
    failing_broadcasts: usize,
    broadcast_attempts: usize,
    fee_rate: f64,
    listeners: HashMap<Currency, mpsc::Sender<BlockEpoch>>,
}

/// Chain backend over in-memory transactions and heights.
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new(height: u32) -> Self {
        Self {
            state: Mutex::new(ChainState {
                heights: HashMap::from([(Currency::Btc, height), (Currency::Liquid, height)]),
                transactions: HashMap::new(),
                confirmed: HashSet::new(),
                broadcasts: Vec::new(),
                failing_broadcasts: 0,
                broadcast_attempts: 0,
                fee_rate: 2.0,
                listeners: HashMap::new(),
            }),
        }
    }

    pub fn add_transaction(&self, tx: &bitcoin::Transaction, confirmed: bool) {
        let txid = tx.compute_txid().to_string();
        let mut state = lock(&self.state);
        if confirmed {
            state.confirmed.insert(txid.clone());
        }
        state
            .transactions
            .insert(txid, LockupTransaction::Bitcoin(tx.clone()));
    }

    pub fn broadcasts(&self) -> Vec<SettlementTransaction> {
        lock(&self.state).broadcasts.clone()
    }

    /// Rejects the next `count` broadcasts.
    pub fn fail_broadcasts(&self, count: usize) {
        lock(&self.state).failing_broadcasts = count;
    }

    pub fn broadcast_attempts(&self) -> usize {
        lock(&self.state).broadcast_attempts
    }

    pub fn has_block_listener(&self, currency: Currency) -> bool {
        lock(&self.state)
            .listeners
            .get(&currency)
            .is_some_and(|listener| !listener.is_closed())
    }

    /// Moves the tip of `currency` to `height` and notifies its listener.
    pub async fn mine(&self, currency: Currency, height: u32) -> Result<()> {
        let listener = {
            let mut state = lock(&self.state);
            state.heights.insert(currency, height);
            state.listeners.get(&currency).cloned()
        };
        if let Some(listener) = listener {
            listener
                .send(BlockEpoch { currency, height })
                .await
                .context("notify block")?;
        }
        Ok(())
    }
}

#[async_trait]
impl ChainBackend for MockChain {
    async fn get_transaction(
        &self,
        _currency: Currency,
        txid: &str,
        _blinding_key: Option<SecretKey>,
    ) -> Result<LockupTransaction> {
        lock(&self.state)
            .transactions
            .get(txid)
            .cloned()
            .with_context(|| format!("unknown transaction {txid}"))
    }

    async fn block_height(&self, currency: Currency) -> Result<u32> {
        lock(&self.state)
            .heights
            .get(&currency)
            .copied()
            .context("unknown currency")
    }

    async fn broadcast_transaction(&self, transaction: &SettlementTransaction) -> Result<String> {
        let mut state = lock(&self.state);
        state.broadcast_attempts += 1;
        if state.failing_broadcasts > 0 {
            state.failing_broadcasts -= 1;
            anyhow::bail!("node rejected {}", transaction.txid());
        }
        state.broadcasts.push(transaction.clone());
        Ok(transaction.txid())
    }

    async fn estimate_fee(&self, _currency: Currency) -> Result<f64> {
        Ok(lock(&self.state).fee_rate)
    }

    async fn is_transaction_confirmed(&self, _currency: Currency, txid: &str) -> Result<bool> {
        Ok(lock(&self.state).confirmed.contains(txid))
    }

    async fn register_block_listener(
        &self,
        currency: Currency,
        epochs: mpsc::Sender<BlockEpoch>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        lock(&self.state).listeners.insert(currency, epochs);
        let _ = stop.wait_for(|stopped| *stopped).await;
        Ok(())
    }
}

/// Lightning node that knows the invoices it was told about.
#[derive(Default)]
pub struct MockLightning {
    paid: Mutex<HashMap<[u8; 32], bool>>,
    created: Mutex<Vec<(u64, u64, String)>>,
    payment_states: Mutex<HashMap<[u8; 32], PaymentState>>,
    payments: Mutex<Vec<(String, u64)>>,
    fail_payments: Mutex<bool>,
}

impl MockLightning {
    pub fn set_payment_state(&self, payment_hash: [u8; 32], state: PaymentState) {
        lock(&self.payment_states).insert(payment_hash, state);
    }

    pub fn fail_payments(&self, fail: bool) {
        *lock(&self.fail_payments) = fail;
    }

    /// `(invoice, fee limit)` of every payment attempt.
    pub fn payments(&self) -> Vec<(String, u64)> {
        lock(&self.payments).clone()
    }

    pub fn set_paid(&self, payment_hash: [u8; 32], paid: bool) {
        lock(&self.paid).insert(payment_hash, paid);
    }

    /// `(amount, expiry, memo)` of every created invoice.
    pub fn created(&self) -> Vec<(u64, u64, String)> {
        lock(&self.created).clone()
    }
}

#[async_trait]
impl LightningNode for MockLightning {
    async fn check_invoice_paid(&self, payment_hash: [u8; 32]) -> Result<Option<bool>> {
        Ok(lock(&self.paid).get(&payment_hash).copied())
    }

    async fn create_invoice(
        &self,
        amount_sat: u64,
        preimage_hash: [u8; 32],
        expiry_secs: u64,
        memo: &str,
    ) -> Result<String> {
        lock(&self.created).push((amount_sat, expiry_secs, memo.to_string()));
        fixtures::invoice(preimage_hash, amount_sat)
    }

    async fn payment_status(&self, payment_hash: [u8; 32]) -> Result<Option<PaymentState>> {
        Ok(lock(&self.payment_states).get(&payment_hash).copied())
    }

    async fn pay_invoice(
        &self,
        invoice: &str,
        fee_limit_sat: u64,
        _timeout_secs: u64,
    ) -> Result<PaymentResult> {
        lock(&self.payments).push((invoice.to_string(), fee_limit_sat));
        if *lock(&self.fail_payments) {
            anyhow::bail!("no route found");
        }
        Ok(PaymentResult { fee_msat: 1_000 })
    }
}
