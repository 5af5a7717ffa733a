//! Review bookkeeping.
//!
//! There is no HTTP surface here; this is the store-and-publish seam a
//! review frontend calls. Approval is the only thing that emits an
//! `approved` event, so rejected invoices never reach the posting stage
//! even though both decisions land the record in `REVIEWED`.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::broker::{publish_event, MessageBroker};
use crate::event::ApprovedEvent;
use crate::invoice::ReviewRecord;
use crate::store::InvoiceStore;

pub struct ReviewService {
    invoices: Arc<dyn InvoiceStore>,
    broker: Arc<dyn MessageBroker>,
}

impl ReviewService {
    pub fn new(
        invoices: Arc<dyn InvoiceStore>,
        broker: Arc<dyn MessageBroker>,
    ) -> Self {
        Self { invoices, broker }
    }

    /// Approve an invoice awaiting review. Returns false when the invoice
    /// was not in a reviewable state, in which case nothing is published.
    /// `AUTO_APPROVED` invoices pass through here too; auto-approval is a
    /// matching verdict, not an authorization to pay.
    pub async fn approve(
        &self,
        correlation_id: Uuid,
        reviewed_by: impl Into<String>,
        notes: Option<String>,
    ) -> anyhow::Result<bool> {
        let reviewed_by = reviewed_by.into();
        let review = ReviewRecord {
            reviewed_by: reviewed_by.clone(),
            approved: true,
            notes,
            reviewed_at: Utc::now(),
        };
        if !self
            .invoices
            .record_review(correlation_id, &review)
            .await?
        {
            return Ok(false);
        }

        publish_event(
            self.broker.as_ref(),
            &ApprovedEvent {
                correlation_id,
                approved_by: reviewed_by,
            },
        )
        .await?;
        info!(%correlation_id, "invoice approved for posting");
        Ok(true)
    }

    /// Reject an invoice awaiting review. The record locks in `REVIEWED`
    /// with the rejection on file; no event is published.
    pub async fn reject(
        &self,
        correlation_id: Uuid,
        reviewed_by: impl Into<String>,
        notes: Option<String>,
    ) -> anyhow::Result<bool> {
        let review = ReviewRecord {
            reviewed_by: reviewed_by.into(),
            approved: false,
            notes,
            reviewed_at: Utc::now(),
        };
        let changed = self
            .invoices
            .record_review(correlation_id, &review)
            .await?;
        if changed {
            info!(%correlation_id, "invoice rejected");
        }
        Ok(changed)
    }
}
