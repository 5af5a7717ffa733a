use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an invoice. Transitions are forward-only and every
/// persisted transition is a conditional update guarded on the expected
/// current status; see [`InvoiceStatus::can_transition_to`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Pending,
    Processing,
    NeedsReview,
    AutoApproved,
    Reviewed,
    Failed,
    Posted,
    PostingFailed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "PENDING",
            InvoiceStatus::Processing => "PROCESSING",
            InvoiceStatus::NeedsReview => "NEEDS_REVIEW",
            InvoiceStatus::AutoApproved => "AUTO_APPROVED",
            InvoiceStatus::Reviewed => "REVIEWED",
            InvoiceStatus::Failed => "FAILED",
            InvoiceStatus::Posted => "POSTED",
            InvoiceStatus::PostingFailed => "POSTING_FAILED",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "PENDING" => Ok(InvoiceStatus::Pending),
            "PROCESSING" => Ok(InvoiceStatus::Processing),
            "NEEDS_REVIEW" => Ok(InvoiceStatus::NeedsReview),
            "AUTO_APPROVED" => Ok(InvoiceStatus::AutoApproved),
            "REVIEWED" => Ok(InvoiceStatus::Reviewed),
            "FAILED" => Ok(InvoiceStatus::Failed),
            "POSTED" => Ok(InvoiceStatus::Posted),
            "POSTING_FAILED" => Ok(InvoiceStatus::PostingFailed),
            other => Err(anyhow::anyhow!("unknown invoice status: {}", other)),
        }
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    ///
    /// `FAILED` is terminal and only reachable from `PROCESSING` on an
    /// unrecoverable extraction error. `AUTO_APPROVED` still requires the
    /// explicit review step before posting, so both decision states feed
    /// into `REVIEWED` and nothing else.
    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, NeedsReview)
                | (Processing, AutoApproved)
                | (Processing, Failed)
                | (NeedsReview, Reviewed)
                | (AutoApproved, Reviewed)
                | (Reviewed, Posted)
                | (Reviewed, PostingFailed)
        )
    }

    /// True once the financial fields (amount, vendor, PO references) must
    /// no longer be mutated.
    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Reviewed
                | InvoiceStatus::Posted
                | InvoiceStatus::PostingFailed
        )
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured fields produced by the language-model extractor.
///
/// Everything is optional except that downstream matching refuses messages
/// without a `total_amount`. Amounts are fixed-point decimals, never floats.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceFields {
    #[serde(default)]
    pub vendor_name: Option<String>,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub invoice_date: Option<NaiveDate>,
    #[serde(default)]
    pub total_amount: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub po_numbers: Vec<String>,
}

impl InvoiceFields {
    /// An empty-fields result, used when the extractor degrades rather than
    /// failing the whole pipeline.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Outcome of the extraction stage, persisted alongside the invoice for
/// audit. `truncated` records that the OCR text was cut to the prompt
/// budget before the model saw it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub raw_ocr_key: String,
    pub ocr_engine: String,
    pub confidence: f32,
    pub truncated: bool,
}

/// The matching decision for an invoice.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchDecision {
    AutoApproved,
    NeedsReview,
}

impl MatchDecision {
    pub fn as_status(&self) -> InvoiceStatus {
        match self {
            MatchDecision::AutoApproved => InvoiceStatus::AutoApproved,
            MatchDecision::NeedsReview => InvoiceStatus::NeedsReview,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.as_status().as_str()
    }
}

/// Detail attached to a matching decision. PO fields are `None` when no
/// candidate purchase order was found; `variance_pct` is a signed fraction
/// so the direction of the discrepancy stays visible to reviewers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchDetail {
    pub po_number: Option<String>,
    pub po_amount: Option<Decimal>,
    pub invoice_amount: Decimal,
    pub variance_pct: Option<Decimal>,
}

impl MatchDetail {
    /// Detail for a decision that found no purchase order at all.
    pub fn unmatched(invoice_amount: Decimal) -> Self {
        Self {
            po_number: None,
            po_amount: None,
            invoice_amount,
            variance_pct: None,
        }
    }
}

/// Who reviewed the invoice, what they decided, and why.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub reviewed_by: String,
    pub approved: bool,
    pub notes: Option<String>,
    pub reviewed_at: DateTime<Utc>,
}

/// Result of pushing the invoice to the external ledger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostingOutcome {
    pub external_reference: Option<String>,
    pub error: Option<String>,
    pub posted_at: DateTime<Utc>,
}

/// One invoice threading through the pipeline, identified by the immutable
/// correlation id assigned at ingestion. The relational store is the single
/// source of truth for `status`; each pipeline stage mutates only the
/// records whose current status it owns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub correlation_id: Uuid,
    pub document_key: String,
    pub filename: Option<String>,
    pub status: InvoiceStatus,
    pub fields: Option<InvoiceFields>,
    pub extraction: Option<ExtractionOutcome>,
    pub failure_reason: Option<String>,
    pub match_decision: Option<MatchDecision>,
    pub match_detail: Option<MatchDetail>,
    pub review: Option<ReviewRecord>,
    pub posting: Option<PostingOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InvoiceRecord {
    /// A freshly ingested invoice awaiting extraction.
    pub fn pending(
        correlation_id: Uuid,
        document_key: impl Into<String>,
        filename: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            correlation_id,
            document_key: document_key.into(),
            filename,
            status: InvoiceStatus::Pending,
            fields: None,
            extraction: None,
            failure_reason: None,
            match_decision: None,
            match_detail: None,
            review: None,
            posting: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A purchase order from the procurement feed. Read-only to the pipeline;
/// `po_number` is stored normalized (trimmed, uppercased) and unique.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub id: Uuid,
    pub po_number: String,
    pub total_amount: Decimal,
    pub order_date: Option<NaiveDate>,
}

/// Normalize a candidate PO reference the way the procurement feed stores
/// them: trimmed and uppercased. Returns `None` for blank input.
pub fn normalize_po_number(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}
