//! Tolerance-based purchase order matching.
//!
//! The decision arithmetic lives in free functions over fixed-point
//! decimals so it can be tested without a store. The worker wires them to
//! the extracted-event queue and applies the fail-safe rule: anything
//! unexpected parks the invoice for human review rather than approving it
//! or silently dropping it.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::broker::{
    publish_event, HandleOutcome, MessageBroker, MessageHandler,
};
use crate::config::MatchingConfig;
use crate::event::{ExtractedEvent, MatchedEvent};
use crate::invoice::{normalize_po_number, MatchDecision, MatchDetail};
use crate::store::{InvoiceStore, PurchaseOrderStore};

/// Signed variance of the invoice amount against the purchase order
/// amount, as a fraction of the order amount. A zero-amount order can
/// never meaningfully match, so it reports a variance of 1 (100%).
pub fn variance_fraction(
    invoice_amount: Decimal,
    po_amount: Decimal,
) -> Decimal {
    if po_amount.is_zero() {
        Decimal::ONE
    } else {
        (invoice_amount - po_amount) / po_amount
    }
}

/// Symmetric tolerance check: within tolerance either way auto-approves.
pub fn decide(variance: Decimal, tolerance: Decimal) -> MatchDecision {
    if variance.abs() <= tolerance {
        MatchDecision::AutoApproved
    } else {
        MatchDecision::NeedsReview
    }
}

pub struct MatchingWorker {
    invoices: Arc<dyn InvoiceStore>,
    purchase_orders: Arc<dyn PurchaseOrderStore>,
    broker: Arc<dyn MessageBroker>,
    tolerance: Decimal,
}

impl MatchingWorker {
    pub fn new(
        invoices: Arc<dyn InvoiceStore>,
        purchase_orders: Arc<dyn PurchaseOrderStore>,
        broker: Arc<dyn MessageBroker>,
        config: &MatchingConfig,
    ) -> Self {
        Self {
            invoices,
            purchase_orders,
            broker,
            tolerance: config.tolerance_fraction,
        }
    }

    /// Walk the invoice's PO references in order; the first one present in
    /// the procurement store decides. References that resolve to nothing
    /// are skipped, not errors.
    async fn match_candidates(
        &self,
        invoice_amount: Decimal,
        po_numbers: &[String],
    ) -> anyhow::Result<(MatchDecision, MatchDetail)> {
        for raw in po_numbers {
            let Some(number) = normalize_po_number(raw) else {
                continue;
            };
            let Some(po) =
                self.purchase_orders.find_by_number(&number).await?
            else {
                continue;
            };
            let variance = variance_fraction(invoice_amount, po.total_amount);
            let decision = decide(variance, self.tolerance);
            return Ok((
                decision,
                MatchDetail {
                    po_number: Some(po.po_number),
                    po_amount: Some(po.total_amount),
                    invoice_amount,
                    variance_pct: Some(variance),
                },
            ));
        }
        Ok((
            MatchDecision::NeedsReview,
            MatchDetail::unmatched(invoice_amount),
        ))
    }

    async fn settle(
        &self,
        correlation_id: uuid::Uuid,
        decision: MatchDecision,
        detail: MatchDetail,
        error: Option<String>,
    ) -> anyhow::Result<HandleOutcome> {
        let changed = self
            .invoices
            .record_match_decision(
                correlation_id,
                decision,
                &detail,
                error.as_deref(),
            )
            .await?;
        if !changed {
            info!("match decision already recorded, skipping publish");
            return Ok(HandleOutcome::Success);
        }

        publish_event(
            self.broker.as_ref(),
            &MatchedEvent {
                correlation_id,
                status: decision,
                details: detail,
                error,
            },
        )
        .await?;

        info!(decision = decision.as_str(), "match decision recorded");
        #[cfg(feature = "metrics")]
        crate::metrics::record_match_decision(decision.as_str());
        Ok(HandleOutcome::Success)
    }

    async fn process(
        &self,
        event: ExtractedEvent,
    ) -> anyhow::Result<HandleOutcome> {
        let id = event.correlation_id;

        let Some(invoice_amount) = event.fields.total_amount else {
            // Without an amount there is nothing to match against and
            // redelivery cannot help.
            self.invoices
                .mark_failed(id, "extracted without total_amount")
                .await?;
            return Ok(HandleOutcome::permanent(
                "extracted message without total_amount",
            ));
        };

        match self
            .match_candidates(invoice_amount, &event.fields.po_numbers)
            .await
        {
            Ok((decision, detail)) => {
                self.settle(id, decision, detail, None).await
            }
            Err(err) => {
                // Fail safe: a broken lookup must park the invoice for a
                // human, visibly, not approve it.
                warn!(error = %err, "matching failed, parking for review");
                self.settle(
                    id,
                    MatchDecision::NeedsReview,
                    MatchDetail::unmatched(invoice_amount),
                    Some(err.to_string()),
                )
                .await
            }
        }
    }
}

#[async_trait]
impl MessageHandler for MatchingWorker {
    type Message = ExtractedEvent;

    async fn handle(&self, message: ExtractedEvent) -> HandleOutcome {
        match self.process(message).await {
            Ok(outcome) => outcome,
            Err(err) => HandleOutcome::retryable(err),
        }
    }
}
