use std::collections::HashMap;

use anyhow::{Context as _, Result};

use super::Nursery;
use crate::boltz::{ChainSwapLockup, SwapStatusResponse, SwapUpdateEvent};
use crate::error::SwapError;
use crate::swap::{LegSide, SwapRecord, SwapState, fees, service_fee};
use crate::transaction::LockupTransaction;

impl Nursery {
    pub(super) async fn handle_chain(
        &self,
        record: SwapRecord,
        response: &SwapStatusResponse,
    ) -> Result<()> {
        let from = record.require_leg(LegSide::From)?;
        let to = record.require_leg(LegSide::To)?;

        let mut server_lockup = None;
        if from.lockup_txid.is_none() || to.lockup_txid.is_none() {
            match self.inner.boltz.chain_swap_transactions(&record.id).await {
                Ok(transactions) => {
                    if let Some(user_lock) = &transactions.user_lock
                        && from.lockup_txid.is_none()
                    {
                        let lockup = self.chain_lockup(&record, LegSide::From, user_lock).await?;
                        self.observe_lockup(&record, LegSide::From, lockup).await?;
                    }
                    if let Some(server_lock) = &transactions.server_lock
                        && to.lockup_txid.is_none()
                    {
                        let lockup = self.chain_lockup(&record, LegSide::To, server_lock).await?;
                        self.observe_lockup(&record, LegSide::To, lockup.clone())
                            .await?;
                        server_lockup = Some(lockup);
                    }
                }
                Err(err) if matches!(SwapError::find(&err), Some(SwapError::TransientNetwork(_))) => {
                    return Err(err.context("get chain swap transactions"));
                }
                Err(err) => {
                    tracing::debug!(swap_id = %record.id, error = %format!("{err:#}"), "no chain swap lockups yet");
                }
            }
        }

        let event = SwapUpdateEvent::parse(&response.status);
        let wants_quote = match event {
            Some(SwapUpdateEvent::TransactionLockupFailed) => true,
            Some(SwapUpdateEvent::TransactionMempool) => from.expected_amount == 0,
            _ => false,
        };
        let requoted = wants_quote && self.renegotiate_quote(&record.id).await?;

        let claimable = match event {
            Some(SwapUpdateEvent::TransactionServerMempool) => {
                self.zero_conf_allowed(&record, response)
            }
            Some(SwapUpdateEvent::TransactionServerConfirmed) => true,
            _ => false,
        };
        if claimable && to.settlement_txid.is_none() {
            let lockup = match server_lockup {
                Some(lockup) => lockup,
                None => self.server_lockup(&record, response).await?,
            };
            self.claim_lockup(&record.id, lockup).await?;
        }

        self.update_status(&record.id, &response.status).await?;

        if self.inner.classifier.is_completed(&response.status) {
            let record = self.reload(&record.id).await?;
            let amount = record.require_leg(LegSide::From)?.expected_amount;
            let service = service_fee(amount, record.service_fee_percent);
            tracing::info!(swap_id = %record.id, service_fee = service, "swap fees");

            let id = record.id.clone();
            self.with_store(move |store| store.set_completion_fees(&id, service, 0))
                .await?;
            self.update_state(&record.id, SwapState::Successful).await?;
        } else if self.inner.classifier.is_failed(&response.status) && !requoted {
            self.handle_failure(&record.id, response).await?;
        }
        Ok(())
    }

    /// Accepts a new server quote for the amount we actually locked up.
    ///
    /// Returns `false` when the server has no quote for the swap, which leaves it to the
    /// failure path.
    async fn renegotiate_quote(&self, swap_id: &str) -> Result<bool> {
        let quote = match self.inner.boltz.chain_swap_quote(swap_id).await {
            Ok(quote) => quote,
            Err(err) if matches!(SwapError::find(&err), Some(SwapError::TransientNetwork(_))) => {
                return Err(err.context("get chain swap quote"));
            }
            Err(err) => {
                tracing::warn!(swap_id = %swap_id, error = %format!("{err:#}"), "server did not give us a new quote");
                return Ok(false);
            }
        };

        let record = self.reload(swap_id).await?;
        let lockup = self
            .verify_lockup(&record, LegSide::From, None)
            .await
            .context("find user lockup")?;
        self.check_quote(&record, lockup.value, quote.amount)
            .await
            .context("quote amounts not correct")?;
        self.inner
            .boltz
            .accept_chain_swap_quote(swap_id, &quote)
            .await
            .context("accept quote")?;

        let id = swap_id.to_string();
        let sent = lockup.value;
        self.with_store(move |store| {
            store.set_expected_amount(&id, LegSide::To, quote.amount)?;
            store.set_expected_amount(&id, LegSide::From, sent)
        })
        .await?;
        tracing::info!(swap_id = %swap_id, sent, receive = quote.amount, "accepted new chain swap quote");
        Ok(true)
    }

    async fn check_quote(&self, record: &SwapRecord, send_amount: u64, receive_amount: u64) -> Result<()> {
        let mut estimations = HashMap::new();
        for currency in fees::required_estimations(record.swap_type, record.pair) {
            let rate = self
                .inner
                .chain
                .estimate_fee(currency)
                .await
                .with_context(|| format!("estimate {currency} fee"))?;
            estimations.insert(currency, rate);
        }
        fees::check_amounts(
            record.swap_type,
            record.pair,
            send_amount,
            receive_amount,
            record.service_fee_percent,
            &estimations,
        )
    }

    async fn chain_lockup(
        &self,
        record: &SwapRecord,
        side: LegSide,
        lock: &ChainSwapLockup,
    ) -> Result<LockupTransaction> {
        let leg = record.require_leg(side)?;
        match &lock.transaction.hex {
            Some(hex) => LockupTransaction::from_hex(leg.currency, hex, leg.blinding_key)
                .with_context(|| format!("decode {} lockup transaction", side.as_str())),
            None => self
                .inner
                .chain
                .get_transaction(leg.currency, &lock.transaction.id, leg.blinding_key)
                .await
                .with_context(|| format!("fetch lockup transaction {}", lock.transaction.id)),
        }
    }

    /// Server lockup of the `to` leg, from the status update or the chain.
    async fn server_lockup(
        &self,
        record: &SwapRecord,
        response: &SwapStatusResponse,
    ) -> Result<LockupTransaction> {
        let leg = record.require_leg(LegSide::To)?;
        if let Some(hex) = response.transaction.as_ref().and_then(|tx| tx.hex.as_deref()) {
            return LockupTransaction::from_hex(leg.currency, hex, leg.blinding_key)
                .context("decode server lockup transaction");
        }

        let current = self.reload(&record.id).await?;
        let txid = response
            .transaction
            .as_ref()
            .map(|tx| tx.id.clone())
            .or_else(|| current.to.as_ref().and_then(|leg| leg.lockup_txid.clone()))
            .with_context(|| format!("no server lockup transaction for {}", record.id))?;
        self.inner
            .chain
            .get_transaction(leg.currency, &txid, leg.blinding_key)
            .await
            .with_context(|| format!("fetch lockup transaction {txid}"))
    }
}
