//! Posting stage: reviewed invoices go to the external ledger.
//!
//! Transient ledger failures are retried locally with exponential backoff
//! inside one delivery, never by requeueing the message; once the budget
//! is spent the invoice lands in `POSTING_FAILED` and the message is
//! acknowledged. Redelivering a posting message risks paying an invoice
//! twice, so every path out of the handler is an ack.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::broker::{
    publish_event, HandleOutcome, MessageBroker, MessageHandler,
};
use crate::config::PostingConfig;
use crate::event::{ApprovedEvent, PostedEvent, PostedStatus};
use crate::invoice::{InvoiceRecord, InvoiceStatus, PostingOutcome};
use crate::retry::BackoffPolicy;
use crate::store::InvoiceStore;

pub mod ledger;

pub use ledger::{
    HttpLedgerClient, LedgerClient, LedgerError, LedgerPosting, LedgerReceipt,
};

pub struct PostingWorker {
    invoices: Arc<dyn InvoiceStore>,
    ledger: Arc<dyn LedgerClient>,
    broker: Arc<dyn MessageBroker>,
    max_retries: u32,
    backoff: BackoffPolicy,
}

impl PostingWorker {
    pub fn new(
        invoices: Arc<dyn InvoiceStore>,
        ledger: Arc<dyn LedgerClient>,
        broker: Arc<dyn MessageBroker>,
        config: &PostingConfig,
    ) -> Self {
        Self {
            invoices,
            ledger,
            broker,
            max_retries: config.max_retries,
            backoff: BackoffPolicy::new(
                config.backoff_base_ms,
                config.backoff_cap_ms,
            ),
        }
    }

    fn posting_for(record: &InvoiceRecord) -> anyhow::Result<LedgerPosting> {
        let fields = record
            .fields
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("reviewed invoice has no fields"))?;
        let amount = fields
            .total_amount
            .ok_or_else(|| anyhow::anyhow!("reviewed invoice has no amount"))?;
        Ok(LedgerPosting {
            id: record.correlation_id,
            vendor: fields.vendor_name.clone(),
            invoice_number: fields.invoice_number.clone(),
            amount,
        })
    }

    async fn settle_posted(
        &self,
        correlation_id: uuid::Uuid,
        reference: String,
    ) -> anyhow::Result<HandleOutcome> {
        let outcome = PostingOutcome {
            external_reference: Some(reference.clone()),
            error: None,
            posted_at: Utc::now(),
        };
        if !self.invoices.record_posted(correlation_id, &outcome).await? {
            info!("posting already recorded, skipping publish");
            return Ok(HandleOutcome::Success);
        }
        publish_event(
            self.broker.as_ref(),
            &PostedEvent {
                correlation_id,
                status: PostedStatus::Posted,
                external_reference: Some(reference),
                error: None,
            },
        )
        .await?;
        info!("invoice posted to ledger");
        #[cfg(feature = "metrics")]
        crate::metrics::record_posting(PostedStatus::Posted.as_str());
        Ok(HandleOutcome::Success)
    }

    async fn settle_failed(
        &self,
        correlation_id: uuid::Uuid,
        error: String,
    ) -> anyhow::Result<HandleOutcome> {
        let outcome = PostingOutcome {
            external_reference: None,
            error: Some(error.clone()),
            posted_at: Utc::now(),
        };
        if !self
            .invoices
            .record_posting_failed(correlation_id, &outcome)
            .await?
        {
            info!("posting outcome already recorded, skipping publish");
            return Ok(HandleOutcome::Success);
        }
        publish_event(
            self.broker.as_ref(),
            &PostedEvent {
                correlation_id,
                status: PostedStatus::PostingFailed,
                external_reference: None,
                error: Some(error),
            },
        )
        .await?;
        warn!("invoice parked as POSTING_FAILED");
        #[cfg(feature = "metrics")]
        crate::metrics::record_posting(PostedStatus::PostingFailed.as_str());
        Ok(HandleOutcome::Success)
    }

    async fn process(
        &self,
        event: ApprovedEvent,
    ) -> anyhow::Result<HandleOutcome> {
        let id = event.correlation_id;

        let Some(record) = self.invoices.fetch(id).await? else {
            return Ok(HandleOutcome::permanent(format!(
                "approved event for unknown invoice {id}"
            )));
        };

        match record.status {
            InvoiceStatus::Reviewed => {
                // Only an approval publishes the event that brings us here,
                // but a rejected record must never be paid regardless.
                let approved =
                    record.review.as_ref().map(|r| r.approved).unwrap_or(false);
                if !approved {
                    warn!("approved event for unapproved invoice, ignoring");
                    return Ok(HandleOutcome::Success);
                }
            }
            InvoiceStatus::Posted | InvoiceStatus::PostingFailed => {
                // Duplicate delivery after the outcome was settled.
                info!(status = %record.status, "posting already settled");
                return Ok(HandleOutcome::Success);
            }
            other => {
                return Ok(HandleOutcome::retryable(format!(
                    "invoice not reviewed yet (status {other})"
                )))
            }
        }

        let posting = match Self::posting_for(&record) {
            Ok(posting) => posting,
            Err(err) => return self.settle_failed(id, err.to_string()).await,
        };

        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt))
                    .await;
            }
            match self.ledger.post_invoice(&posting).await {
                Ok(receipt) => {
                    return self.settle_posted(id, receipt.reference).await
                }
                Err(LedgerError::Transient(err)) => {
                    warn!(
                        attempt = attempt + 1,
                        budget = self.max_retries + 1,
                        error = %err,
                        "transient ledger failure"
                    );
                    last_error = err;
                }
                Err(LedgerError::Rejected(err)) => {
                    return self.settle_failed(id, err).await
                }
            }
        }

        self.settle_failed(
            id,
            format!("retry budget exhausted: {last_error}"),
        )
        .await
    }
}

#[async_trait]
impl MessageHandler for PostingWorker {
    type Message = ApprovedEvent;

    async fn handle(&self, message: ApprovedEvent) -> HandleOutcome {
        match self.process(message).await {
            Ok(outcome) => outcome,
            Err(err) => HandleOutcome::retryable(err),
        }
    }
}
