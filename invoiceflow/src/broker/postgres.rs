//! Postgres-backed durable broker.
//!
//! Messages live in `pipeline_messages`; bindings in `pipeline_bindings`.
//! Publishing fans one row out per bound queue inside a transaction, so a
//! publish is atomic across queues. Fetching claims under
//! `FOR UPDATE SKIP LOCKED` so concurrent consumers never double-claim.
//!
//! Every claim takes a lease: the claiming `UPDATE` stamps a fresh
//! `lease_id` and a `lease_expires_at` deadline, and `fetch` requeues any
//! `in_flight` row whose deadline has passed before looking for work.
//! A consumer that dies between fetch and settle therefore only delays
//! its message by the lease TTL instead of stranding it. Settle
//! operations are conditioned on both the `in_flight` state and the
//! delivery's `lease_id`, so a consumer whose lease expired cannot
//! clobber a message that was reclaimed and handed to someone else.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::PersistenceConfig;
use crate::event::Topology;
use crate::store::postgres::connect_pool;

use super::{dead_letter_queue, Delivery, Message, MessageBroker, MessageId};

const STATE_READY: &str = "ready";
const STATE_IN_FLIGHT: &str = "in_flight";
const STATE_DEAD_LETTER: &str = "dead_letter";

/// How long a claim stays exclusive before an unsettled message is
/// requeued.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct PostgresBroker {
    pool: PgPool,
    lease_ttl: Duration,
}

impl PostgresBroker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    /// Connect a pool from configuration.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        Ok(Self::new(connect_pool(config).await?))
    }

    /// Override how long a fetched delivery stays claimed before it is
    /// requeued as abandoned.
    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Messages parked on a queue's dead-letter destination.
    pub async fn dead_letter_depth(
        &self,
        queue: &str,
    ) -> anyhow::Result<usize> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS depth FROM pipeline_messages \
             WHERE queue = $1 AND state = $2",
        )
        .bind(dead_letter_queue(queue))
        .bind(STATE_DEAD_LETTER)
        .fetch_one(&self.pool)
        .await?;
        let depth: i64 = row.try_get("depth")?;
        Ok(depth as usize)
    }
}

#[async_trait]
impl MessageBroker for PostgresBroker {
    async fn declare_topology(
        &self,
        topology: &Topology,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for binding in &topology.bindings {
            sqlx::query(
                "INSERT INTO pipeline_bindings (exchange, routing_key, queue) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (exchange, routing_key, queue) DO NOTHING",
            )
            .bind(&topology.exchange)
            .bind(&binding.routing_key)
            .bind(&binding.queue)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        let bound = sqlx::query(
            "SELECT queue FROM pipeline_bindings \
             WHERE exchange = $1 AND routing_key = $2",
        )
        .bind(exchange)
        .bind(routing_key)
        .fetch_all(&mut *tx)
        .await?;

        for row in &bound {
            let queue: String = row.try_get("queue")?;
            sqlx::query(
                "INSERT INTO pipeline_messages \
                 (id, queue, exchange, routing_key, correlation_id, \
                  content_type, body, state, available_at, published_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)",
            )
            .bind(Uuid::now_v7())
            .bind(&queue)
            .bind(exchange)
            .bind(routing_key)
            .bind(&message.correlation_id)
            .bind(&message.content_type)
            .bind(&message.body)
            .bind(STATE_READY)
            .bind(message.published_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> anyhow::Result<Option<Delivery>> {
        let mut tx = self.pool.begin().await?;

        // Abandoned claims first: anything whose lease ran out goes back
        // to ready so the claim below can pick it up.
        sqlx::query(
            "UPDATE pipeline_messages \
             SET state = $1, claimed_by = NULL, lease_id = NULL, \
                 lease_expires_at = NULL, \
                 last_error = COALESCE(last_error, 'lease expired'), \
                 updated_at = NOW() \
             WHERE queue = $2 AND state = $3 AND lease_expires_at <= NOW()",
        )
        .bind(STATE_READY)
        .bind(queue)
        .bind(STATE_IN_FLIGHT)
        .execute(&mut *tx)
        .await?;

        let claimed = sqlx::query(
            "SELECT id, correlation_id, content_type, body, published_at \
             FROM pipeline_messages \
             WHERE queue = $1 AND state = $2 AND available_at <= NOW() \
             ORDER BY available_at, id \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(queue)
        .bind(STATE_READY)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = claimed else {
            tx.commit().await?;
            return Ok(None);
        };

        let id: Uuid = row.try_get("id")?;
        let lease_id = Uuid::now_v7();
        let lease_expires_at = Utc::now()
            + chrono::Duration::milliseconds(self.lease_ttl.as_millis() as i64);
        sqlx::query(
            "UPDATE pipeline_messages \
             SET state = $1, claimed_by = $2, lease_id = $3, \
                 lease_expires_at = $4, updated_at = NOW() \
             WHERE id = $5",
        )
        .bind(STATE_IN_FLIGHT)
        .bind(consumer_tag)
        .bind(lease_id)
        .bind(lease_expires_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(Delivery {
            message_id: MessageId(id),
            lease_id,
            queue: queue.to_string(),
            message: Message {
                correlation_id: row.try_get("correlation_id")?,
                published_at: row.try_get("published_at")?,
                content_type: row.try_get("content_type")?,
                body: row.try_get("body")?,
            },
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> anyhow::Result<()> {
        sqlx::query(
            "DELETE FROM pipeline_messages \
             WHERE id = $1 AND state = $2 AND lease_id = $3",
        )
        .bind(delivery.message_id.0)
        .bind(STATE_IN_FLIGHT)
        .bind(delivery.lease_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn nack_requeue(
        &self,
        delivery: &Delivery,
        delay: Duration,
        error: Option<String>,
    ) -> anyhow::Result<()> {
        let available_at = Utc::now()
            + chrono::Duration::milliseconds(delay.as_millis() as i64);
        sqlx::query(
            "UPDATE pipeline_messages \
             SET state = $1, claimed_by = NULL, lease_id = NULL, \
                 lease_expires_at = NULL, last_error = $2, \
                 available_at = $3, updated_at = NOW() \
             WHERE id = $4 AND state = $5 AND lease_id = $6",
        )
        .bind(STATE_READY)
        .bind(error)
        .bind(available_at)
        .bind(delivery.message_id.0)
        .bind(STATE_IN_FLIGHT)
        .bind(delivery.lease_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: Option<String>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE pipeline_messages \
             SET state = $1, queue = $2, claimed_by = NULL, \
                 lease_id = NULL, lease_expires_at = NULL, \
                 last_error = $3, updated_at = NOW() \
             WHERE id = $4 AND state = $5 AND lease_id = $6",
        )
        .bind(STATE_DEAD_LETTER)
        .bind(dead_letter_queue(&delivery.queue))
        .bind(reason)
        .bind(delivery.message_id.0)
        .bind(STATE_IN_FLIGHT)
        .bind(delivery.lease_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> anyhow::Result<usize> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS depth FROM pipeline_messages \
             WHERE queue = $1 AND state = $2",
        )
        .bind(queue)
        .bind(STATE_READY)
        .fetch_one(&self.pool)
        .await?;
        let depth: i64 = row.try_get("depth")?;
        Ok(depth as usize)
    }
}
