use anyhow::{Context as _, Result};

use super::{Nursery, SweepReason};
use crate::boltz::BoltzSigner;
use crate::error::SwapError;
use crate::network::Currency;
use crate::swap::{LegSide, SwapRecord, SwapState, SwapType};
use crate::taproot::SwapTree;
use crate::transaction::{LockupTransaction, Output, attribute_fees, construct_transaction};

/// A lockup output matched against the leg's derived address.
pub(super) struct VerifiedLockup {
    pub lockup: LockupTransaction,
    pub vout: u32,
    pub value: u64,
    pub tree: SwapTree,
}

impl Nursery {
    /// Checks that every leg's declared lockup address is the one derived locally.
    pub(super) fn verify_outputs(&self, record: &SwapRecord) -> Result<()> {
        for (side, leg) in [(LegSide::From, &record.from), (LegSide::To, &record.to)] {
            let Some(leg) = leg else { continue };
            leg.swap_tree()?
                .verify_address(self.inner.config.network, &leg.lockup_address)
                .with_context(|| format!("verify {} lockup address of {}", side.as_str(), record.id))?;
        }
        Ok(())
    }

    /// Output spending the server's lockup through our claim leaf.
    pub(super) async fn claim_output(
        &self,
        record: &SwapRecord,
        lockup: Option<LockupTransaction>,
    ) -> Result<Output> {
        let output = self.lockup_output(record, LegSide::To, lockup).await?;
        if !record.accept_zero_conf || !self.inner.config.accept_zero_conf {
            let txid = output.lockup.txid();
            let confirmed = self
                .inner
                .chain
                .is_transaction_confirmed(output.currency, &txid)
                .await
                .context("check lockup confirmation")?;
            anyhow::ensure!(confirmed, "lockup transaction {txid} is not confirmed");
        }
        Ok(output)
    }

    /// Output spending our own lockup through the refund leaf.
    pub(super) async fn refund_output(
        &self,
        record: &SwapRecord,
        lockup: Option<LockupTransaction>,
    ) -> Result<Output> {
        self.lockup_output(record, LegSide::From, lockup).await
    }

    /// Verifies a newly seen lockup of `side` and records its id.
    pub(super) async fn observe_lockup(
        &self,
        record: &SwapRecord,
        side: LegSide,
        lockup: LockupTransaction,
    ) -> Result<()> {
        let verified = self.verify_lockup(record, side, Some(lockup)).await?;
        let txid = verified.lockup.txid();
        if self.set_lockup_txid(&record.id, side, &txid).await? {
            tracing::info!(
                swap_id = %record.id,
                side = side.as_str(),
                txid = %txid,
                vout = verified.vout,
                value = verified.value,
                "found lockup transaction"
            );
        }
        Ok(())
    }

    /// Locates the lockup output of `side`, fetching the transaction when none is given.
    ///
    /// Only the server's lockup is held to the expected amount; our own lockup stays
    /// refundable whatever it carries.
    pub(super) async fn verify_lockup(
        &self,
        record: &SwapRecord,
        side: LegSide,
        lockup: Option<LockupTransaction>,
    ) -> Result<VerifiedLockup> {
        let network = self.inner.config.network;
        let leg = record.require_leg(side)?;
        let tree = leg.swap_tree()?;
        tree.verify_address(network, &leg.lockup_address)?;

        let lockup = match lockup {
            Some(lockup) => lockup,
            None => {
                let txid = leg
                    .lockup_txid
                    .as_deref()
                    .with_context(|| format!("no lockup transaction known for {}", record.id))?;
                self.inner
                    .chain
                    .get_transaction(leg.currency, txid, leg.blinding_key)
                    .await
                    .with_context(|| format!("fetch lockup transaction {txid}"))?
            }
        };

        let (vout, value) = lockup
            .find_vout(network, &leg.lockup_address)
            .context("find lockup output")?;
        if side == LegSide::To && value < leg.expected_amount {
            return Err(SwapError::InsufficientAmount {
                expected: leg.expected_amount,
                actual: value,
            }
            .into());
        }

        Ok(VerifiedLockup {
            lockup,
            vout,
            value,
            tree,
        })
    }

    async fn lockup_output(
        &self,
        record: &SwapRecord,
        side: LegSide,
        lockup: Option<LockupTransaction>,
    ) -> Result<Output> {
        let verified = self.verify_lockup(record, side, lockup).await?;
        let leg = record.require_leg(side)?;

        let preimage = match side {
            LegSide::To => Some(
                record
                    .preimage
                    .with_context(|| format!("no preimage for {}", record.id))?,
            ),
            LegSide::From => None,
        };
        let verb = if preimage.is_some() { "claim" } else { "refund" };
        let destination = leg
            .destination
            .clone()
            .with_context(|| format!("no {verb} address set for {}", record.id))?;

        Ok(Output {
            swap_id: record.id.clone(),
            swap_type: record.swap_type,
            side,
            currency: leg.currency,
            lockup: verified.lockup,
            vout: verified.vout,
            value: verified.value,
            private_key: record.private_key,
            preimage,
            tree: verified.tree,
            cooperative: true,
            destination,
            timeout_block_height: leg.timeout_block_height,
        })
    }

    /// Queues `output` and sweeps its currency if the policy asks for it.
    pub(super) async fn queue_output(&self, output: Output) -> Result<()> {
        let currency = output.currency;
        let height = match self.inner.chain.block_height(currency).await {
            Ok(height) => Some(height),
            Err(err) => {
                tracing::warn!(%currency, error = %format!("{err:#}"), "could not get block height, forcing sweep");
                None
            }
        };

        let reason = self.inner.claimer.lock().await.queue(output, height);
        if reason == SweepReason::None {
            tracing::debug!(%currency, "deferring output");
            return Ok(());
        }
        self.sweep(reason, currency).await.map(|_| ())
    }

    async fn settle(&self, currency: Currency, mut outputs: Vec<Output>) -> Result<String> {
        let fee_rate = self
            .inner
            .chain
            .estimate_fee(currency)
            .await
            .context("estimate fee")?;
        tracing::info!(%currency, fee_rate, "using fee rate for settlement");

        let signer = BoltzSigner::new(self.inner.boltz.as_ref());
        let constructed = construct_transaction(
            self.inner.config.network,
            &mut outputs,
            fee_rate,
            &signer,
            self.inner.config.nonce_timeout(),
        )
        .await
        .context("construct settlement")?;

        let txid = self
            .inner
            .chain
            .broadcast_transaction(&constructed.transaction)
            .await
            .map_err(|e| SwapError::TransientNetwork(format!("broadcast settlement: {e:#}")))?;
        tracing::info!(%currency, txid = %txid, fee = constructed.fee, inputs = outputs.len(), "broadcast settlement");

        let fees = attribute_fees(constructed.fee, outputs.len());
        for (output, fee) in outputs.iter().zip(fees) {
            let id = output.swap_id.clone();
            let side = output.side;
            let settlement = txid.clone();
            let recorded = self
                .with_store(move |store| store.set_settlement(&id, side, &settlement, fee))
                .await?;
            if !recorded {
                tracing::warn!(swap_id = %output.swap_id, "settlement already recorded");
                continue;
            }

            if output.is_refund() {
                self.update_state(&output.swap_id, SwapState::Refunded).await?;
                tracing::info!(swap_id = %output.swap_id, txid = %txid, "refunded swap");
            } else {
                tracing::info!(swap_id = %output.swap_id, txid = %txid, "claimed swap");
            }
            self.publish(&output.swap_id).await;
        }
        Ok(txid)
    }

    /// Drops queued outputs whose leg was settled since queueing.
    ///
    /// Claims outlive the swap turning successful; they only close when a chain swap was
    /// refunded instead. Refunds close with the swap.
    async fn still_open(&self, output: &Output) -> Result<bool> {
        let Some(record) = self.db_get(&output.swap_id).await? else {
            return Ok(false);
        };
        let Some(leg) = record.leg(output.side) else {
            return Ok(false);
        };
        if leg.settlement_txid.is_some() {
            return Ok(false);
        }
        Ok(match output.side {
            LegSide::To => {
                !(record.swap_type == SwapType::Chain && record.state == SwapState::Refunded)
            }
            LegSide::From => !record.state.is_final(),
        })
    }
}

pub(super) async fn sweep(
    nursery: &Nursery,
    reason: SweepReason,
    currency: Currency,
) -> Result<Vec<String>> {
    let queued = {
        let mut claimer = nursery.inner.claimer.lock().await;
        claimer.take_retry(currency);
        claimer.take(currency)
    };
    if queued.is_empty() {
        return Ok(Vec::new());
    }
    tracing::info!(%currency, count = queued.len(), %reason, "sweeping outputs");

    let height = match nursery.inner.chain.block_height(currency).await {
        Ok(height) => Some(height),
        Err(err) => {
            tracing::warn!(%currency, error = %format!("{err:#}"), "could not get block height, assuming outputs are not cooperative");
            None
        }
    };

    let mut batches: Vec<Vec<Output>> = Vec::new();
    for mut output in queued {
        if !nursery.still_open(&output).await? {
            tracing::debug!(swap_id = %output.swap_id, "dropping settled output");
            continue;
        }
        match height {
            Some(height) => output.refresh_cooperative(height),
            None => output.cooperative = false,
        }
        match batches
            .iter_mut()
            .find(|batch| batch.first().is_some_and(|first| first.destination == output.destination))
        {
            Some(batch) => batch.push(output),
            None => batches.push(vec![output]),
        }
    }

    let mut txids = Vec::new();
    let mut failure = None;
    for batch in batches {
        let ids: Vec<String> = batch.iter().map(|output| output.swap_id.clone()).collect();
        match nursery.settle(currency, batch.clone()).await {
            Ok(txid) => txids.push(txid),
            Err(err) => {
                tracing::error!(%currency, swaps = ?ids, error = %format!("{err:#}"), "could not settle outputs");
                nursery.inner.claimer.lock().await.restore(batch);
                failure.get_or_insert(err);
            }
        }
    }

    match failure {
        Some(err) => {
            if nursery.inner.claimer.lock().await.mark_retry(currency) {
                nursery.schedule_retry(currency);
            }
            Err(err)
        }
        None => Ok(txids),
    }
}
