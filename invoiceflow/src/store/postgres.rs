//! sqlx-backed implementations of the store traits.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::PersistenceConfig;
use crate::invoice::{
    ExtractionOutcome, InvoiceFields, InvoiceRecord, InvoiceStatus,
    MatchDecision, MatchDetail, PostingOutcome, PurchaseOrder, ReviewRecord,
};

use super::{InvoiceStore, PurchaseOrderStore};

/// Build a connection pool from configuration. Shared by the broker and
/// both stores so a stage process holds one pool.
pub async fn connect_pool(config: &PersistenceConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
        .connect(&config.connection_string)
        .await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct PostgresInvoiceStore {
    pool: PgPool,
}

impl PostgresInvoiceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn from_json<T: serde::de::DeserializeOwned>(
    value: Option<serde_json::Value>,
) -> anyhow::Result<Option<T>> {
    match value {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

fn row_to_record(row: &PgRow) -> anyhow::Result<InvoiceRecord> {
    let status: String = row.try_get("status")?;
    let match_decision: Option<String> = row.try_get("match_decision")?;
    let match_decision = match match_decision.as_deref() {
        Some("AUTO_APPROVED") => Some(MatchDecision::AutoApproved),
        Some("NEEDS_REVIEW") => Some(MatchDecision::NeedsReview),
        Some(other) => {
            return Err(anyhow::anyhow!("unknown match decision: {}", other))
        }
        None => None,
    };
    Ok(InvoiceRecord {
        correlation_id: row.try_get("correlation_id")?,
        document_key: row.try_get("document_key")?,
        filename: row.try_get("filename")?,
        status: InvoiceStatus::parse(&status)?,
        fields: from_json::<InvoiceFields>(row.try_get("fields")?)?,
        extraction: from_json::<ExtractionOutcome>(row.try_get("extraction")?)?,
        failure_reason: row.try_get("failure_reason")?,
        match_decision,
        match_detail: from_json::<MatchDetail>(row.try_get("match_detail")?)?,
        review: from_json::<ReviewRecord>(row.try_get("review")?)?,
        posting: from_json::<PostingOutcome>(row.try_get("posting")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl InvoiceStore for PostgresInvoiceStore {
    async fn create_pending(
        &self,
        record: &InvoiceRecord,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO invoices \
             (correlation_id, document_key, filename, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (correlation_id) DO NOTHING",
        )
        .bind(record.correlation_id)
        .bind(&record.document_key)
        .bind(&record.filename)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch(
        &self,
        correlation_id: Uuid,
    ) -> anyhow::Result<Option<InvoiceRecord>> {
        let row = sqlx::query(
            "SELECT correlation_id, document_key, filename, status, fields, \
                    extraction, failure_reason, match_decision, match_detail, \
                    review, posting, created_at, updated_at \
             FROM invoices WHERE correlation_id = $1",
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn begin_processing(
        &self,
        correlation_id: Uuid,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE invoices SET status = $1, updated_at = NOW() \
             WHERE correlation_id = $2 AND status = $3",
        )
        .bind(InvoiceStatus::Processing.as_str())
        .bind(correlation_id)
        .bind(InvoiceStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_extraction(
        &self,
        correlation_id: Uuid,
        fields: &InvoiceFields,
        extraction: &ExtractionOutcome,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE invoices SET fields = $1, extraction = $2, updated_at = NOW() \
             WHERE correlation_id = $3 AND status = $4",
        )
        .bind(serde_json::to_value(fields)?)
        .bind(serde_json::to_value(extraction)?)
        .bind(correlation_id)
        .bind(InvoiceStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(
        &self,
        correlation_id: Uuid,
        reason: &str,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE invoices SET status = $1, failure_reason = $2, updated_at = NOW() \
             WHERE correlation_id = $3 AND status = $4",
        )
        .bind(InvoiceStatus::Failed.as_str())
        .bind(reason)
        .bind(correlation_id)
        .bind(InvoiceStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_match_decision(
        &self,
        correlation_id: Uuid,
        decision: MatchDecision,
        detail: &MatchDetail,
        error: Option<&str>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE invoices SET status = $1, match_decision = $2, \
                    match_detail = $3, failure_reason = COALESCE($4, failure_reason), \
                    updated_at = NOW() \
             WHERE correlation_id = $5 AND status = $6",
        )
        .bind(decision.as_status().as_str())
        .bind(decision.as_str())
        .bind(serde_json::to_value(detail)?)
        .bind(error)
        .bind(correlation_id)
        .bind(InvoiceStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_review(
        &self,
        correlation_id: Uuid,
        review: &ReviewRecord,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE invoices SET status = $1, review = $2, updated_at = NOW() \
             WHERE correlation_id = $3 AND status IN ($4, $5)",
        )
        .bind(InvoiceStatus::Reviewed.as_str())
        .bind(serde_json::to_value(review)?)
        .bind(correlation_id)
        .bind(InvoiceStatus::NeedsReview.as_str())
        .bind(InvoiceStatus::AutoApproved.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_posted(
        &self,
        correlation_id: Uuid,
        posting: &PostingOutcome,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE invoices SET status = $1, posting = $2, updated_at = NOW() \
             WHERE correlation_id = $3 AND status = $4",
        )
        .bind(InvoiceStatus::Posted.as_str())
        .bind(serde_json::to_value(posting)?)
        .bind(correlation_id)
        .bind(InvoiceStatus::Reviewed.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_posting_failed(
        &self,
        correlation_id: Uuid,
        posting: &PostingOutcome,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE invoices SET status = $1, posting = $2, updated_at = NOW() \
             WHERE correlation_id = $3 AND status = $4",
        )
        .bind(InvoiceStatus::PostingFailed.as_str())
        .bind(serde_json::to_value(posting)?)
        .bind(correlation_id)
        .bind(InvoiceStatus::Reviewed.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Clone)]
pub struct PostgresPurchaseOrderStore {
    pool: PgPool,
}

impl PostgresPurchaseOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PurchaseOrderStore for PostgresPurchaseOrderStore {
    async fn find_by_number(
        &self,
        po_number: &str,
    ) -> anyhow::Result<Option<PurchaseOrder>> {
        let row = sqlx::query(
            "SELECT id, po_number, total_amount, order_date \
             FROM purchase_orders WHERE po_number = $1",
        )
        .bind(po_number)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(PurchaseOrder {
                id: row.try_get("id")?,
                po_number: row.try_get("po_number")?,
                total_amount: row.try_get("total_amount")?,
                order_date: row.try_get("order_date")?,
            })),
            None => Ok(None),
        }
    }

    async fn upsert(&self, po: &PurchaseOrder) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO purchase_orders (id, po_number, total_amount, order_date) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (po_number) DO UPDATE \
             SET total_amount = EXCLUDED.total_amount, \
                 order_date = EXCLUDED.order_date",
        )
        .bind(po.id)
        .bind(&po.po_number)
        .bind(po.total_amount)
        .bind(po.order_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
