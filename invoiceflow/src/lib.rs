//! Invoiceflow - asynchronous invoice processing pipeline.
//!
//! A message-driven pipeline that turns raw invoice documents into posted
//! ledger entries: OCR and model-based field extraction, tolerance-based
//! purchase order matching, human review bookkeeping, and retried posting
//! to an external ledger. Stages communicate through a durable broker and
//! share a relational store that is the single source of truth for
//! invoice status.
//!
//! # Core Concepts
//!
//! - **Events**: Each stage consumes one event kind and publishes the
//!   next ([`IngestedEvent`], [`ExtractedEvent`], [`MatchedEvent`],
//!   [`ApprovedEvent`], [`PostedEvent`]), all routed through the single
//!   `invoices` exchange.
//!
//! - **Broker**: The [`MessageBroker`] trait abstracts the durable queue
//!   backend; [`Consumer`] is the shared loop that turns a
//!   [`HandleOutcome`] into ack, delayed requeue or dead-letter.
//!
//! - **Store**: The [`InvoiceStore`] and [`PurchaseOrderStore`] traits
//!   guard every status transition with conditional updates, which is
//!   what makes at-least-once delivery safe.
//!
//! - **Workers**: [`ExtractionWorker`], [`MatchingWorker`] and
//!   [`PostingWorker`] implement the stage semantics on top of the
//!   consumer framework; [`ReviewService`] is the seam a review frontend
//!   calls.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support

/// Broker client and the shared consumer framework.
///
/// The `broker` module defines the [`MessageBroker`] trait, the
/// [`Consumer`] loop, [`HandleOutcome`] classification and the
/// [`RedeliveryTracker`], plus the postgres-backed [`PostgresBroker`].
pub mod broker;

/// Configuration structures for every stage.
///
/// The `config` module defines [`PersistenceConfig`], [`ConsumerConfig`],
/// [`ExtractionConfig`], [`MatchingConfig`], [`PostingConfig`] and
/// [`ObjectStoreConfig`].
pub mod config;

/// Pipeline event payloads, routing keys and topology.
pub mod event;

/// Extraction stage: OCR fallback chain and model field extraction.
///
/// The `extract` module provides the [`OcrEngine`] and [`FieldExtractor`]
/// traits, the [`OcrChain`], the [`CloudOcr`]/[`LocalOcr`]/[`LlmExtractor`]
/// clients and the [`ExtractionWorker`].
pub mod extract;

/// Invoice domain model: statuses, fields, match and review records.
pub mod invoice;

/// Tolerance-based purchase order matching.
///
/// The `matching` module provides the pure [`variance_fraction`] and
/// [`decide`] functions and the [`MatchingWorker`].
pub mod matching;

#[cfg(feature = "metrics")]
/// Prometheus metrics, enabled by the `metrics` feature.
pub mod metrics;

/// Blob storage for raw documents and OCR text.
pub mod object_store;

/// Posting stage: ledger client and bounded-retry worker.
pub mod posting;

/// Exponential backoff and redelivery ceiling policy.
pub mod retry;

/// Review bookkeeping behind the human approval step.
pub mod review;

/// Shutdown signaling and the stage process runtime.
pub mod runtime;

/// Relational persistence for invoices and purchase orders.
pub mod store;

/// Tracing setup and span helpers.
pub mod telemetry;

pub use broker::{
    dead_letter_queue, publish_event, Consumer, Delivery, HandleOutcome,
    Message, MessageBroker, MessageHandler, MessageId, PostgresBroker,
    RedeliveryTracker,
};
pub use config::*;
pub use event::*;
pub use extract::*;
pub use invoice::*;
pub use matching::*;
pub use object_store::*;
pub use posting::*;
pub use retry::*;
pub use review::*;
pub use runtime::*;
pub use store::{
    InvoiceStore, PostgresInvoiceStore, PostgresPurchaseOrderStore,
    PurchaseOrderStore,
};
