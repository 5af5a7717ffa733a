//! Generic consumer loop shared by every pipeline stage.
//!
//! A [`Consumer`] owns one queue: it declares the topology, fetches
//! deliveries under a prefetch bound, dispatches them to a
//! [`MessageHandler`], and turns the handler's [`HandleOutcome`] into
//! ack, delayed requeue or dead-letter. Transport errors never kill the
//! loop; the consumer backs off, redeclares the topology and resumes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::ConsumerConfig;
use crate::event::Topology;
use crate::retry::{exceeds_redelivery_ceiling, BackoffPolicy};
use crate::runtime::ShutdownToken;
use crate::telemetry;

use super::{Delivery, HandleOutcome, MessageBroker, RedeliveryTracker};

/// Stage-specific message handling, plugged into a [`Consumer`].
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Message: DeserializeOwned + Send;

    /// Process one parsed message.
    ///
    /// Must be idempotent: delivery is at-least-once and the same message
    /// can arrive again after a crash or a requeue. Business-level
    /// rejections (an invoice parked for review, a failed extraction) are
    /// persisted outcomes and come back as `Success`.
    async fn handle(&self, message: Self::Message) -> HandleOutcome;
}

/// Consumer loop for a single queue.
pub struct Consumer<H: MessageHandler> {
    broker: Arc<dyn MessageBroker>,
    queue: String,
    consumer_tag: String,
    handler: Arc<H>,
    config: ConsumerConfig,
    redeliveries: RedeliveryTracker,
    shutdown: ShutdownToken,
}

impl<H: MessageHandler> Consumer<H> {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        queue: impl Into<String>,
        handler: H,
        config: ConsumerConfig,
        shutdown: ShutdownToken,
    ) -> Self {
        let queue = queue.into();
        let consumer_tag = format!("{}/{}", queue, Uuid::now_v7());
        Self {
            broker,
            queue,
            consumer_tag,
            handler: Arc::new(handler),
            config,
            redeliveries: RedeliveryTracker::new(),
            shutdown,
        }
    }

    /// Run until the shutdown token fires, then drain in-flight handlers
    /// within the configured grace period.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.broker.declare_topology(&Topology::standard()).await?;

        let permits = Arc::new(Semaphore::new(self.config.prefetch));
        let handler_backoff = BackoffPolicy::new(
            self.config.backoff_base_ms,
            self.config.backoff_cap_ms,
        );
        let reconnect_backoff = handler_backoff;
        let mut transport_failures: u32 = 0;

        info!(
            queue = %self.queue,
            prefetch = self.config.prefetch,
            "consumer started"
        );

        while !self.shutdown.is_cancelled() {
            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown.cancelled() => break,
            };

            match self.broker.fetch(&self.queue, &self.consumer_tag).await {
                Ok(Some(delivery)) => {
                    transport_failures = 0;
                    let broker = Arc::clone(&self.broker);
                    let handler = Arc::clone(&self.handler);
                    let redeliveries = self.redeliveries.clone();
                    let max_redeliveries = self.config.max_redeliveries;
                    let span = telemetry::delivery_span(
                        &delivery.queue,
                        &delivery.message.correlation_id,
                    );
                    tokio::spawn(
                        async move {
                            process_delivery(
                                broker,
                                handler,
                                redeliveries,
                                handler_backoff,
                                max_redeliveries,
                                delivery,
                            )
                            .await;
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Ok(None) => {
                    drop(permit);
                    self.idle_wait(Duration::from_millis(
                        self.config.poll_interval_ms,
                    ))
                    .await;
                }
                Err(err) => {
                    drop(permit);
                    transport_failures = transport_failures.saturating_add(1);
                    let delay =
                        reconnect_backoff.delay_for_attempt(transport_failures);
                    warn!(
                        queue = %self.queue,
                        failures = transport_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "broker fetch failed, backing off before reconnect"
                    );
                    self.idle_wait(delay).await;
                    if let Err(err) =
                        self.broker.declare_topology(&Topology::standard()).await
                    {
                        warn!(
                            queue = %self.queue,
                            error = %err,
                            "topology redeclare failed, will retry"
                        );
                    }
                }
            }
        }

        self.drain(&permits).await;
        info!(queue = %self.queue, "consumer stopped");
        Ok(())
    }

    /// Sleep that wakes early on shutdown.
    async fn idle_wait(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Wait for every in-flight handler to return its permit, bounded by
    /// the shutdown grace period.
    async fn drain(&self, permits: &Arc<Semaphore>) {
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let all = self.config.prefetch as u32;
        match tokio::time::timeout(grace, permits.acquire_many(all)).await {
            Ok(Ok(_)) => {
                debug!(queue = %self.queue, "in-flight deliveries drained")
            }
            Ok(Err(_)) => {}
            Err(_) => warn!(
                queue = %self.queue,
                grace_secs = self.config.shutdown_grace_secs,
                "shutdown grace expired with deliveries still in flight"
            ),
        }
    }
}

/// Dispatch one claimed delivery and settle it with the broker.
async fn process_delivery<H: MessageHandler>(
    broker: Arc<dyn MessageBroker>,
    handler: Arc<H>,
    redeliveries: RedeliveryTracker,
    backoff: BackoffPolicy,
    max_redeliveries: u32,
    delivery: Delivery,
) {
    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();

    let message: H::Message = match serde_json::from_str(&delivery.message.body)
    {
        Ok(message) => message,
        Err(err) => {
            // A payload that cannot parse will never parse; retrying it
            // would poison the queue.
            warn!(error = %err, "malformed payload, dead-lettering");
            settle_dead_letter(
                &*broker,
                &redeliveries,
                &delivery,
                Some(format!("malformed payload: {err}")),
            )
            .await;
            return;
        }
    };

    let outcome = handler.handle(message).await;

    #[cfg(feature = "metrics")]
    crate::metrics::observe_delivery_duration(
        &delivery.queue,
        started.elapsed().as_secs_f64(),
    );

    match outcome {
        HandleOutcome::Success => {
            if let Err(err) = broker.ack(&delivery).await {
                error!(error = %err, "ack failed, delivery will be redelivered");
            }
            redeliveries.forget(delivery.message_id).await;
            #[cfg(feature = "metrics")]
            crate::metrics::record_delivery(&delivery.queue, "ack");
        }
        HandleOutcome::RetryableFailure { error } => {
            let count = redeliveries.record(delivery.message_id).await;
            if exceeds_redelivery_ceiling(count, max_redeliveries) {
                warn!(
                    redeliveries = count,
                    ceiling = max_redeliveries,
                    "redelivery ceiling reached, dead-lettering"
                );
                let reason = Some(match error {
                    Some(error) => format!(
                        "redelivery ceiling {max_redeliveries} reached: {error}"
                    ),
                    None => format!(
                        "redelivery ceiling {max_redeliveries} reached"
                    ),
                });
                settle_dead_letter(&*broker, &redeliveries, &delivery, reason)
                    .await;
            } else {
                let delay = backoff.delay_for_attempt(count);
                debug!(
                    attempt = count,
                    delay_ms = delay.as_millis() as u64,
                    error = error.as_deref().unwrap_or("unspecified"),
                    "transient failure, requeueing with backoff"
                );
                if let Err(err) =
                    broker.nack_requeue(&delivery, delay, error).await
                {
                    error!(error = %err, "requeue failed, delivery will be redelivered");
                }
                #[cfg(feature = "metrics")]
                crate::metrics::record_delivery(&delivery.queue, "requeued");
            }
        }
        HandleOutcome::PermanentFailure { error } => {
            warn!(
                error = error.as_deref().unwrap_or("unspecified"),
                "permanent failure, dead-lettering"
            );
            settle_dead_letter(&*broker, &redeliveries, &delivery, error).await;
        }
    }
}

async fn settle_dead_letter(
    broker: &dyn MessageBroker,
    redeliveries: &RedeliveryTracker,
    delivery: &Delivery,
    reason: Option<String>,
) {
    if let Err(err) = broker.dead_letter(delivery, reason).await {
        error!(error = %err, "dead-letter failed, delivery will be redelivered");
        return;
    }
    redeliveries.forget(delivery.message_id).await;
    #[cfg(feature = "metrics")]
    crate::metrics::record_delivery(&delivery.queue, "dead_letter");
}
