use anyhow::{Context as _, Result};
use bitcoin::hashes::{Hash as _, sha256};

use super::Nursery;
use crate::boltz::{PartialSignature, SwapStatusResponse, SwapUpdateEvent};
use crate::error::SwapError;
use crate::lightning::invoice;
use crate::swap::{LegSide, SwapRecord, SwapState, service_fee};
use crate::taproot::SigningSession;
use crate::transaction::LockupTransaction;

impl Nursery {
    pub(super) async fn handle_submarine(
        &self,
        record: SwapRecord,
        response: &SwapStatusResponse,
    ) -> Result<()> {
        let event = SwapUpdateEvent::parse(&response.status);
        let leg = record.require_leg(LegSide::From)?;

        if event != Some(SwapUpdateEvent::InvoiceSet) && leg.lockup_txid.is_none() {
            match self.inner.boltz.swap_transaction(&record.id).await {
                Ok(lockup) => {
                    let transaction =
                        LockupTransaction::from_hex(leg.currency, &lockup.transaction_hex, leg.blinding_key)
                            .context("decode lockup transaction")?;
                    self.observe_lockup(&record, LegSide::From, transaction).await?;
                }
                Err(err) if matches!(SwapError::find(&err), Some(SwapError::TransientNetwork(_))) => {
                    return Err(err.context("get lockup transaction"));
                }
                Err(err) => {
                    tracing::debug!(swap_id = %record.id, error = %format!("{err:#}"), "no lockup transaction yet");
                }
            }
        }

        match event {
            Some(SwapUpdateEvent::TransactionMempool | SwapUpdateEvent::TransactionConfirmed)
                if record.invoice.is_none() =>
            {
                self.set_submarine_invoice(&record).await?;
            }
            Some(SwapUpdateEvent::TransactionClaimPending | SwapUpdateEvent::TransactionClaimed) => {
                if !self.submarine_invoice_paid(&record).await? {
                    tracing::warn!(
                        swap_id = %record.id,
                        refund_height = leg.timeout_block_height,
                        "swap was not actually paid, refunding at timeout"
                    );
                    return Ok(());
                }
                tracing::info!(swap_id = %record.id, "swap succeeded");

                if event == Some(SwapUpdateEvent::TransactionClaimPending)
                    && let Err(err) = self.cooperative_submarine_claim(&record).await
                {
                    tracing::warn!(swap_id = %record.id, error = %format!("{err:#}"), "could not help server claim cooperatively");
                }
            }
            _ => {}
        }

        self.update_status(&record.id, &response.status).await?;

        if self.inner.classifier.is_completed(&response.status) {
            let record = self.reload(&record.id).await?;
            let invoice = record
                .invoice
                .as_deref()
                .context("completed swap has no invoice")?;
            let invoice_amount = invoice::decode(invoice)?.amount_sat;
            let service = service_fee(invoice_amount, record.service_fee_percent);
            let expected = record.require_leg(LegSide::From)?.expected_amount;
            let server_onchain = expected
                .checked_sub(invoice_amount)
                .and_then(|rest| rest.checked_sub(service))
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
            self.handle_failure(&record.id, response).await?;
        }
        Ok(())
    }

    /// Moves a pending swap to `ServerError` and tries a cooperative refund of our lockup.
    pub(super) async fn handle_failure(
        &self,
        swap_id: &str,
        response: &SwapStatusResponse,
    ) -> Result<()> {
        let record = self.reload(swap_id).await?;
        let reason = response
            .failure_reason
            .clone()
            .unwrap_or_else(|| response.status.clone());
        tracing::info!(swap_id = %swap_id, %reason, "swap failed");
        if record.state == SwapState::Pending {
            let id = swap_id.to_string();
            self.with_store(move |store| {
                store.update_state(&id, SwapState::ServerError, Some(&reason))
            })
            .await?;
        }

        let has_lockup = record
            .from
            .as_ref()
            .is_some_and(|leg| leg.lockup_txid.is_some() && leg.settlement_txid.is_none());
        if !has_lockup {
            return Ok(());
        }

        let output = self.refund_output(&record, None).await?;
        if let Err(err) = self.queue_output(output).await {
            tracing::warn!(swap_id = %swap_id, error = %format!("{err:#}"), "refund failed, swap stays refundable");
        }
        Ok(())
    }

    async fn set_submarine_invoice(&self, record: &SwapRecord) -> Result<()> {
        let leg = record.require_leg(LegSide::From)?;
        let invoice_amount = self
            .inner
            .boltz
            .invoice_amount(&record.id)
            .await
            .context("get invoice amount")?;

        let service = service_fee(invoice_amount, record.service_fee_percent);
        anyhow::ensure!(
            invoice_amount.saturating_add(service) <= leg.expected_amount,
            "not accepting invoice amount {invoice_amount}: with a service fee of {service} it exceeds the lockup of {}",
            leg.expected_amount
        );

        let lightning = self
            .inner
            .lightning
            .as_ref()
            .with_context(|| format!("no lightning node to create an invoice for {}", record.id))?;
        let height = self
            .inner
            .chain
            .block_height(leg.currency)
            .await
            .context("get block height")?;
        let expiry = invoice::invoice_expiry_secs(
            leg.timeout_block_height.saturating_sub(height),
            leg.currency,
        );

        let invoice = lightning
            .create_invoice(
                invoice_amount,
                record.preimage_hash,
                expiry,
                &format!("Send to {} address", leg.currency),
            )
            .await
            .context("create invoice")?;
        tracing::info!(swap_id = %record.id, amount = invoice_amount, "generated invoice");

        self.inner
            .boltz
            .set_invoice(&record.id, &invoice)
            .await
            .context("set invoice")?;
        let id = record.id.clone();
        self.with_store(move |store| store.set_invoice(&id, &invoice))
            .await
    }

    /// `false` only when the node knows the invoice and reports it unpaid.
    async fn submarine_invoice_paid(&self, record: &SwapRecord) -> Result<bool> {
        let invoice = record
            .invoice
            .as_deref()
            .context("swap has no invoice")?;
        let decoded = invoice::decode(invoice)?;

        let Some(lightning) = &self.inner.lightning else {
            return Ok(true);
        };
        match lightning
            .check_invoice_paid(decoded.payment_hash)
            .await
            .context("check invoice")?
        {
            Some(paid) => Ok(paid),
            None => Ok(true),
        }
    }

    /// Lets the server claim our lockup with the key path once it proves payment.
    async fn cooperative_submarine_claim(&self, record: &SwapRecord) -> Result<()> {
        tracing::debug!(swap_id = %record.id, "claiming cooperatively");
        let details = self
            .inner
            .boltz
            .swap_claim_details(&record.id)
            .await
            .context("get claim details")?;

        let invoice = record
            .invoice
            .as_deref()
            .context("swap has no invoice")?;
        let payment_hash = invoice::decode(invoice)?.payment_hash;
        let preimage = hex::decode(&details.preimage).context("decode preimage")?;
        anyhow::ensure!(
            sha256::Hash::hash(&preimage).to_byte_array() == payment_hash,
            "server returned wrong preimage: {}",
            details.preimage
        );

        let transaction_hash: [u8; 32] = hex::decode(&details.transaction_hash)
            .context("decode transaction hash")?
            .try_into()
            .map_err(|_| SwapError::SigningProtocol("transaction hash must be 32 bytes".to_string()))?;
        let server_nonce = hex::decode(&details.pub_nonce).context("decode server nonce")?;

        let tree = record.require_leg(LegSide::From)?.swap_tree()?;
        let session = SigningSession::new(&tree, &record.private_key, transaction_hash)?;
        let pub_nonce = session.public_nonce();
        let partial = session.sign(&server_nonce)?;

        self.inner
            .boltz
            .send_swap_claim_signature(
                &record.id,
                &PartialSignature {
                    pub_nonce: hex::encode(pub_nonce),
                    partial_signature: hex::encode(partial),
                },
            )
            .await
            .context("send partial signature")
    }

    pub(super) async fn reload(&self, swap_id: &str) -> Result<SwapRecord> {
        self.db_get(swap_id)
            .await?
            .with_context(|| format!("swap not found: {swap_id}"))
    }
}
