//! Relational source of truth for invoices and purchase orders.
//!
//! Every status-changing operation is a conditional update guarded on the
//! status the caller expects, and returns whether a row actually changed.
//! `false` means another delivery of the same message got there first (or
//! the record is in an unexpected state); callers treat that as the
//! idempotent no-op it is.

use async_trait::async_trait;
use uuid::Uuid;

use crate::invoice::{
    ExtractionOutcome, InvoiceFields, InvoiceRecord, MatchDecision,
    MatchDetail, PostingOutcome, PurchaseOrder, ReviewRecord,
};

pub mod postgres;

pub use postgres::{PostgresInvoiceStore, PostgresPurchaseOrderStore};

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Insert a freshly ingested invoice in `PENDING`. Idempotent: an
    /// existing record with the same correlation id is left untouched.
    async fn create_pending(
        &self,
        record: &InvoiceRecord,
    ) -> anyhow::Result<()>;

    async fn fetch(
        &self,
        correlation_id: Uuid,
    ) -> anyhow::Result<Option<InvoiceRecord>>;

    /// `PENDING` -> `PROCESSING`. Returns false if the record already left
    /// `PENDING`, which is how duplicate ingestion deliveries are absorbed.
    async fn begin_processing(
        &self,
        correlation_id: Uuid,
    ) -> anyhow::Result<bool>;

    /// Persist extraction results. The invoice stays in `PROCESSING`;
    /// extraction completion is recorded in the extraction columns, not as
    /// a status of its own, so the matching guard still holds.
    async fn complete_extraction(
        &self,
        correlation_id: Uuid,
        fields: &InvoiceFields,
        extraction: &ExtractionOutcome,
    ) -> anyhow::Result<bool>;

    /// `PROCESSING` -> `FAILED` with a reason. Terminal.
    async fn mark_failed(
        &self,
        correlation_id: Uuid,
        reason: &str,
    ) -> anyhow::Result<bool>;

    /// `PROCESSING` -> `NEEDS_REVIEW` or `AUTO_APPROVED` with the match
    /// detail. Guarded on `PROCESSING` so a redelivered extraction event
    /// cannot re-decide an invoice.
    async fn record_match_decision(
        &self,
        correlation_id: Uuid,
        decision: MatchDecision,
        detail: &MatchDetail,
        error: Option<&str>,
    ) -> anyhow::Result<bool>;

    /// `NEEDS_REVIEW` or `AUTO_APPROVED` -> `REVIEWED`. After this the
    /// financial fields are locked.
    async fn record_review(
        &self,
        correlation_id: Uuid,
        review: &ReviewRecord,
    ) -> anyhow::Result<bool>;

    /// `REVIEWED` -> `POSTED` with the ledger reference.
    async fn record_posted(
        &self,
        correlation_id: Uuid,
        posting: &PostingOutcome,
    ) -> anyhow::Result<bool>;

    /// `REVIEWED` -> `POSTING_FAILED` once the retry budget is spent.
    async fn record_posting_failed(
        &self,
        correlation_id: Uuid,
        posting: &PostingOutcome,
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait PurchaseOrderStore: Send + Sync {
    /// Look up a purchase order by its normalized number.
    async fn find_by_number(
        &self,
        po_number: &str,
    ) -> anyhow::Result<Option<PurchaseOrder>>;

    /// Upsert a purchase order, keyed on its number.
    async fn upsert(&self, po: &PurchaseOrder) -> anyhow::Result<()>;
}
