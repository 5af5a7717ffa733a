//! Broker client and consumer framework.
//!
//! Durable queuing lives behind the [`MessageBroker`] trait: a postgres
//! implementation backs production, the testkit provides an in-memory one.
//! The broker is transport only; "message received" is never a commit
//! point. Stages persist to the relational store before acknowledging.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::event::{PipelineEvent, Topology, EXCHANGE};

pub mod consumer;
pub mod postgres;

pub use consumer::{Consumer, MessageHandler};
pub use postgres::PostgresBroker;

/// Unique identifier for a queued message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message as published: correlation id and timestamp headers plus the
/// raw body. The body is kept as text so that malformed payloads survive
/// transport and can be classified (and dead-lettered) by the consumer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub correlation_id: String,
    pub published_at: DateTime<Utc>,
    pub content_type: String,
    pub body: String,
}

impl Message {
    /// Build a JSON message from a typed pipeline event.
    pub fn from_event<E: PipelineEvent>(event: &E) -> anyhow::Result<Self> {
        Ok(Self {
            correlation_id: event.correlation_id().to_string(),
            published_at: Utc::now(),
            content_type: "application/json".to_string(),
            body: serde_json::to_string(event)?,
        })
    }
}

/// A message claimed from a queue, awaiting ack/nack/dead-letter.
///
/// `lease_id` identifies this particular claim. Settle operations are
/// conditioned on it, so a consumer whose lease expired cannot settle a
/// message that has since been reclaimed by someone else.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub message_id: MessageId,
    pub lease_id: Uuid,
    pub queue: String,
    pub message: Message,
}

/// Classification a handler returns for one delivery. Business outcomes
/// (NEEDS_REVIEW, FAILED extraction, POSTING_FAILED) are persisted data,
/// not failures, and come back as `Success`.
#[derive(Clone, Debug)]
pub enum HandleOutcome {
    /// Handled; ack the delivery.
    Success,
    /// Transient failure; requeue with backoff, bounded by the redelivery
    /// ceiling.
    RetryableFailure { error: Option<String> },
    /// Unprocessable; ack off the working queue and file a copy on the
    /// dead-letter destination.
    PermanentFailure { error: Option<String> },
}

impl HandleOutcome {
    pub fn retryable(error: impl std::fmt::Display) -> Self {
        Self::RetryableFailure {
            error: Some(error.to_string()),
        }
    }

    pub fn permanent(error: impl std::fmt::Display) -> Self {
        Self::PermanentFailure {
            error: Some(error.to_string()),
        }
    }
}

/// Trait for durable broker backends.
///
/// Delivery is at-least-once: a claimed message that is never acked (for
/// example when a consumer process dies) becomes fetchable again, so the
/// same message id may be seen by more than one handler invocation.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Idempotently declare exchanges, queues and bindings. A no-op when
    /// the topology is already present.
    async fn declare_topology(&self, topology: &Topology)
        -> anyhow::Result<()>;

    /// Durably route one copy of the message to every queue bound to the
    /// exchange under the routing key.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> anyhow::Result<()>;

    /// Claim the next ready delivery from a queue, if any.
    ///
    /// A claim carries a lease: if the consumer does not settle the
    /// delivery before the lease expires, the message is requeued and
    /// handed to the next fetcher.
    async fn fetch(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> anyhow::Result<Option<Delivery>>;

    /// Acknowledge a delivery, removing it from the working queue.
    async fn ack(&self, delivery: &Delivery) -> anyhow::Result<()>;

    /// Return a delivery to its queue, becoming fetchable after `delay`.
    async fn nack_requeue(
        &self,
        delivery: &Delivery,
        delay: Duration,
        error: Option<String>,
    ) -> anyhow::Result<()>;

    /// Remove a delivery from the working queue and file a copy on the
    /// queue's dead-letter destination for operator inspection.
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: Option<String>,
    ) -> anyhow::Result<()>;

    /// Number of ready messages on a queue.
    async fn queue_depth(&self, queue: &str) -> anyhow::Result<usize>;
}

/// Name of the dead-letter destination for a working queue.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}.dlq", queue)
}

/// Publish a typed pipeline event on the standard exchange.
pub async fn publish_event<E: PipelineEvent>(
    broker: &dyn MessageBroker,
    event: &E,
) -> anyhow::Result<()> {
    broker
        .publish(EXCHANGE, E::routing_key(), Message::from_event(event)?)
        .await
}

/// Side-channel redelivery counter keyed by message id.
///
/// Broker-native redelivery counts are untrusted across restarts, so the
/// consumer tracks its own ceiling here. Thread-safe via `tokio::sync::Mutex`.
#[derive(Clone, Default, Debug)]
pub struct RedeliveryTracker {
    inner: Arc<Mutex<HashMap<Uuid, u32>>>,
}

impl RedeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failed attempt and return the new redelivery count.
    pub async fn record(&self, message_id: MessageId) -> u32 {
        let mut guard = self.inner.lock().await;
        let count = guard.entry(message_id.0).or_insert(0);
        *count += 1;
        *count
    }

    /// Current count for a message, zero if unseen.
    pub async fn count(&self, message_id: MessageId) -> u32 {
        let guard = self.inner.lock().await;
        guard.get(&message_id.0).copied().unwrap_or(0)
    }

    /// Drop the counter once a message reaches a terminal disposition.
    pub async fn forget(&self, message_id: MessageId) {
        let mut guard = self.inner.lock().await;
        guard.remove(&message_id.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::IngestedEvent;

    #[test]
    fn message_from_event_sets_headers() {
        let event = IngestedEvent {
            correlation_id: Uuid::now_v7(),
            document_key: "raw/x.pdf".into(),
            filename: None,
        };
        let message = Message::from_event(&event).unwrap();
        assert_eq!(message.correlation_id, event.correlation_id.to_string());
        assert_eq!(message.content_type, "application/json");
        assert!(message.body.contains("raw/x.pdf"));
    }

    #[test]
    fn dead_letter_queue_naming() {
        assert_eq!(dead_letter_queue("invoice.ingested"), "invoice.ingested.dlq");
    }

    #[tokio::test]
    async fn redelivery_tracker_counts_and_forgets() {
        let tracker = RedeliveryTracker::new();
        let id = MessageId::new();

        assert_eq!(tracker.count(id).await, 0);
        assert_eq!(tracker.record(id).await, 1);
        assert_eq!(tracker.record(id).await, 2);
        assert_eq!(tracker.count(id).await, 2);

        tracker.forget(id).await;
        assert_eq!(tracker.count(id).await, 0);
    }
}
