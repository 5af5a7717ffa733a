use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::invoice::{InvoiceFields, MatchDecision, MatchDetail};

/// The single durable exchange all pipeline stages publish to.
pub const EXCHANGE: &str = "invoices";

/// Routing keys, one per pipeline event kind.
pub mod routing {
    pub const INGESTED: &str = "ingested";
    pub const EXTRACTED: &str = "extracted";
    pub const MATCHED: &str = "matched";
    pub const APPROVED: &str = "approved";
    pub const POSTED: &str = "posted";
}

/// Queue names, one per consuming stage plus the operator-facing outputs.
pub mod queues {
    pub const INGESTED: &str = "invoice.ingested";
    pub const EXTRACTED: &str = "invoice.extracted";
    pub const APPROVED: &str = "invoice.approved";
    pub const MATCHED: &str = "invoice.matched";
    pub const POSTED: &str = "invoice.posted";
}

/// A typed pipeline event payload. Every payload carries the correlation id
/// of the invoice it concerns.
pub trait PipelineEvent: Serialize + DeserializeOwned + Send + Sync {
    fn correlation_id(&self) -> Uuid;
    fn routing_key() -> &'static str;
}

/// Published by the ingestion boundary once a raw document is stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestedEvent {
    pub correlation_id: Uuid,
    pub document_key: String,
    #[serde(default)]
    pub filename: Option<String>,
}

impl PipelineEvent for IngestedEvent {
    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
    fn routing_key() -> &'static str {
        routing::INGESTED
    }
}

/// Published by the extraction stage with the structured fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractedEvent {
    pub correlation_id: Uuid,
    pub raw_ocr_key: String,
    pub fields: InvoiceFields,
}

impl PipelineEvent for ExtractedEvent {
    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
    fn routing_key() -> &'static str {
        routing::EXTRACTED
    }
}

/// Published by the matching stage with the decision and its detail. The
/// `error` field is set only on the fail-safe path, so matching failures
/// are never silent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchedEvent {
    pub correlation_id: Uuid,
    pub status: MatchDecision,
    pub details: MatchDetail,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineEvent for MatchedEvent {
    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
    fn routing_key() -> &'static str {
        routing::MATCHED
    }
}

/// Published by the review surface after a human (or auto) approval.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovedEvent {
    pub correlation_id: Uuid,
    pub approved_by: String,
}

impl PipelineEvent for ApprovedEvent {
    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
    fn routing_key() -> &'static str {
        routing::APPROVED
    }
}

/// Outcome of the posting stage, visible to operational dashboards.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostedStatus {
    Posted,
    PostingFailed,
}

impl PostedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostedStatus::Posted => "POSTED",
            PostedStatus::PostingFailed => "POSTING_FAILED",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostedEvent {
    pub correlation_id: Uuid,
    pub status: PostedStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineEvent for PostedEvent {
    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
    fn routing_key() -> &'static str {
        routing::POSTED
    }
}

/// A queue bound to the exchange under a routing key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Binding {
    pub queue: String,
    pub routing_key: String,
}

/// The exchange/queue/binding topology a stage declares before consuming.
/// Declaration is idempotent: declaring an already-present topology is a
/// no-op at the broker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Topology {
    pub exchange: String,
    pub bindings: Vec<Binding>,
}

impl Topology {
    /// The standard pipeline topology: every stage queue bound to the
    /// `invoices` exchange under its routing key.
    pub fn standard() -> Self {
        let bind = |queue: &str, routing_key: &str| Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        Self {
            exchange: EXCHANGE.to_string(),
            bindings: vec![
                bind(queues::INGESTED, routing::INGESTED),
                bind(queues::EXTRACTED, routing::EXTRACTED),
                bind(queues::MATCHED, routing::MATCHED),
                bind(queues::APPROVED, routing::APPROVED),
                bind(queues::POSTED, routing::POSTED),
            ],
        }
    }
}
