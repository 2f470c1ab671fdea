use anyhow::{Context as _, Result};

use super::{Nursery, wait_stopped};
use crate::boltz::{SwapStatusResponse, SwapUpdateEvent};
use crate::lightning::{PaymentState, invoice};
use crate::swap::{LegSide, SwapRecord, SwapState, service_fee};
use crate::transaction::LockupTransaction;

const PAYMENT_TIMEOUT_SECS: u64 = 30;

impl Nursery {
    pub(super) async fn handle_reverse(
        &self,
        record: SwapRecord,
        response: &SwapStatusResponse,
    ) -> Result<()> {
        let leg = record.require_leg(LegSide::To)?;
        let claimable = match SwapUpdateEvent::parse(&response.status) {
            Some(SwapUpdateEvent::TransactionMempool) => {
                self.zero_conf_allowed(&record, response)
            }
            Some(SwapUpdateEvent::TransactionConfirmed) => true,
            _ => false,
        };

        if claimable && leg.settlement_txid.is_none() {
            let lockup = match response.transaction.as_ref().and_then(|tx| tx.hex.as_deref()) {
                Some(hex) => LockupTransaction::from_hex(leg.currency, hex, leg.blinding_key)
                    .context("decode lockup transaction")?,
                None => {
                    let txid = response
                        .transaction
                        .as_ref()
                        .map(|tx| tx.id.as_str())
                        .or(leg.lockup_txid.as_deref())
                        .with_context(|| format!("no lockup transaction for {}", record.id))?;
                    self.inner
                        .chain
                        .get_transaction(leg.currency, txid, leg.blinding_key)
                        .await
                        .with_context(|| format!("fetch lockup transaction {txid}"))?
                }
            };
            self.claim_lockup(&record.id, lockup).await?;
        }

        self.update_status(&record.id, &response.status).await?;

        if self.inner.classifier.is_completed(&response.status) {
            let record = self.reload(&record.id).await?;
            let invoice = record
                .invoice
                .as_deref()
                .context("completed reverse swap has no invoice")?;
            let invoice_amount = invoice::decode(invoice)?.amount_sat;
            let service = service_fee(invoice_amount, record.service_fee_percent);
            let lockup_amount = record.require_leg(LegSide::To)?.expected_amount;
            let server_onchain = invoice_amount
                .checked_sub(service)
                .and_then(|rest| rest.checked_sub(lockup_amount))
                .unwrap_or_else(|| {
                    tracing::warn!(swap_id = %record.id, "server onchain fee seems to be negative");
                    0
                });
            tracing::info!(swap_id = %record.id, service_fee = service, onchain_fee = server_onchain, "swap fees");

            let id = record.id.clone();
            self.with_store(move |store| store.set_completion_fees(&id, service, server_onchain))
                .await?;
            self.update_state(&record.id, SwapState::Successful).await?;
        } else if self.inner.classifier.is_failed(&response.status) {
            let record = self.reload(&record.id).await?;
            if record.state == SwapState::Pending {
                let reason = response
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| response.status.clone());
                tracing::info!(swap_id = %record.id, %reason, "swap failed");
                let id = record.id.clone();
                self.with_store(move |store| store.update_state(&id, SwapState::ServerError, Some(&reason)))
                    .await?;
            }
        }
        Ok(())
    }

    /// Starts paying the invoice of a reverse swap unless it is paid externally or a
    /// payment is already in flight. A failed payment moves the swap to `Error`.
    pub(super) async fn pay_reverse_swap(&self, swap_id: &str) -> Result<()> {
        let record = self.reload(swap_id).await?;
        if record.external_pay {
            tracing::debug!(swap_id = %swap_id, "invoice is paid externally");
            return Ok(());
        }
        let lightning = self
            .inner
            .lightning
            .clone()
            .context("no lightning node available to pay invoice")?;
        let invoice = record
            .invoice
            .clone()
            .with_context(|| format!("reverse swap {swap_id} has no invoice"))?;
        let decoded = invoice::decode(&invoice)?;
        let fee_limit = invoice::fee_limit_sat(decoded.amount_sat, self.inner.config.max_routing_fee_ppm);

        match lightning.payment_status(decoded.payment_hash).await {
            Ok(Some(state)) if state != PaymentState::Failed => {
                tracing::debug!(swap_id = %swap_id, ?state, "invoice is already being paid");
                return Ok(());
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(swap_id = %swap_id, error = %format!("{err:#}"), "no payment status")
            }
        }

        let nursery = self.clone();
        let id = record.id.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        self.spawn(async move {
            tracing::debug!(swap_id = %id, fee_limit, "paying invoice");
            let paid = tokio::select! {
                paid = lightning.pay_invoice(&invoice, fee_limit, PAYMENT_TIMEOUT_SECS) => paid,
                _ = wait_stopped(&mut shutdown) => return,
            };
            match paid {
                Ok(payment) => {
                    tracing::info!(swap_id = %id, fee_msat = payment.fee_msat, "paid invoice");
                }
                Err(err) => {
                    if let Err(err) = nursery.fail_swap(&id, err.context("pay invoice")).await {
                        tracing::error!(swap_id = %id, error = %format!("{err:#}"), "could not record failed payment");
                    }
                }
            }
        });
        Ok(())
    }

    /// Records the server's lockup of a swap and claims it right away.
    ///
    /// Only verification failures propagate; a failed claim leaves the output claimable
    /// for the next sweep.
    pub(super) async fn claim_lockup(&self, swap_id: &str, lockup: LockupTransaction) -> Result<()> {
        let record = self.reload(swap_id).await?;
        self.observe_lockup(&record, LegSide::To, lockup.clone())
            .await?;

        let record = self.reload(swap_id).await?;
        let output = match self.claim_output(&record, Some(lockup)).await {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(swap_id = %swap_id, error = %format!("{err:#}"), "lockup not claimable yet");
                return Ok(());
            }
        };
        if let Err(err) = self.queue_output(output).await {
            tracing::warn!(swap_id = %swap_id, error = %format!("{err:#}"), "claim failed, swap stays claimable");
        }
        Ok(())
    }

    /// Whether a lockup that is still in the mempool may be claimed.
    pub(super) fn zero_conf_allowed(&self, record: &SwapRecord, response: &SwapStatusResponse) -> bool {
        if !record.accept_zero_conf || !self.inner.config.accept_zero_conf {
            tracing::info!(swap_id = %record.id, "not claiming unconfirmed lockup");
            return false;
        }
        if response.zero_conf_rejected {
            tracing::info!(swap_id = %record.id, "server rejected zero-conf for this swap");
            return false;
        }
        true
    }
}
