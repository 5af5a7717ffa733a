//! In-memory broker with the same settle semantics as the postgres one.
//!
//! Claims carry the same lease behavior: an unsettled delivery becomes
//! fetchable again once its lease runs out, and a stale delivery can no
//! longer settle the reclaimed slot. Deadlines use `tokio::time::Instant`
//! so tests can drive expiry with paused time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use invoiceflow::broker::{
    dead_letter_queue, Delivery, Message, MessageBroker, MessageId,
};
use invoiceflow::event::Topology;

#[derive(Clone, Debug, PartialEq)]
enum SlotState {
    Ready,
    InFlight,
}

#[derive(Clone, Debug)]
struct Slot {
    id: MessageId,
    message: Message,
    state: SlotState,
    available_at: Instant,
    lease_id: Option<Uuid>,
    lease_expires_at: Option<Instant>,
}

impl Slot {
    fn ready(message: Message) -> Self {
        Self {
            id: MessageId(Uuid::now_v7()),
            message,
            state: SlotState::Ready,
            available_at: Instant::now(),
            lease_id: None,
            lease_expires_at: None,
        }
    }

    fn release(&mut self) {
        self.state = SlotState::Ready;
        self.lease_id = None;
        self.lease_expires_at = None;
    }

    fn lease_expired(&self, now: Instant) -> bool {
        self.state == SlotState::InFlight
            && self.lease_expires_at.is_some_and(|deadline| deadline <= now)
    }

    fn held_by(&self, delivery: &Delivery) -> bool {
        self.id == delivery.message_id
            && self.state == SlotState::InFlight
            && self.lease_id == Some(delivery.lease_id)
    }
}

/// A message that landed on a dead-letter destination, with its reason.
#[derive(Clone, Debug)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: Option<String>,
}

#[derive(Default)]
struct Inner {
    bindings: Vec<(String, String, String)>,
    queues: HashMap<String, Vec<Slot>>,
    dead: HashMap<String, Vec<DeadLetter>>,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
    lease_ttl: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            lease_ttl: invoiceflow::broker::postgres::DEFAULT_LEASE_TTL,
        }
    }

    /// Override how long a fetched delivery stays claimed before it is
    /// requeued as abandoned.
    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// Place a message directly on a queue, bypassing routing. Useful for
    /// injecting payloads (including malformed ones) into one stage.
    pub fn push(&self, queue: &str, message: Message) {
        let mut inner = self.inner.lock();
        inner
            .queues
            .entry(queue.to_string())
            .or_default()
            .push(Slot::ready(message));
    }

    /// Everything parked on a queue's dead-letter destination.
    pub fn dead_letters(&self, queue: &str) -> Vec<DeadLetter> {
        self.inner
            .lock()
            .dead
            .get(&dead_letter_queue(queue))
            .cloned()
            .unwrap_or_default()
    }

    /// Ready and in-flight messages still on a working queue.
    pub fn remaining(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|slots| slots.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare_topology(
        &self,
        topology: &Topology,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        for binding in &topology.bindings {
            let entry = (
                topology.exchange.clone(),
                binding.routing_key.clone(),
                binding.queue.clone(),
            );
            if !inner.bindings.contains(&entry) {
                inner.bindings.push(entry);
            }
            inner.queues.entry(binding.queue.clone()).or_default();
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let destinations: Vec<String> = inner
            .bindings
            .iter()
            .filter(|(ex, rk, _)| ex == exchange && rk == routing_key)
            .map(|(_, _, queue)| queue.clone())
            .collect();
        for queue in destinations {
            inner
                .queues
                .entry(queue)
                .or_default()
                .push(Slot::ready(message.clone()));
        }
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> anyhow::Result<Option<Delivery>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let Some(slots) = inner.queues.get_mut(queue) else {
            return Ok(None);
        };
        // Abandoned claims go back to ready before new work is handed out.
        for slot in slots.iter_mut() {
            if slot.lease_expired(now) {
                slot.release();
            }
        }
        for slot in slots.iter_mut() {
            if slot.state == SlotState::Ready && slot.available_at <= now {
                let lease_id = Uuid::now_v7();
                slot.state = SlotState::InFlight;
                slot.lease_id = Some(lease_id);
                slot.lease_expires_at = Some(now + self.lease_ttl);
                return Ok(Some(Delivery {
                    message_id: slot.id,
                    lease_id,
                    queue: queue.to_string(),
                    message: slot.message.clone(),
                }));
            }
        }
        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(slots) = inner.queues.get_mut(&delivery.queue) {
            slots.retain(|slot| !slot.held_by(delivery));
        }
        Ok(())
    }

    async fn nack_requeue(
        &self,
        delivery: &Delivery,
        delay: Duration,
        error: Option<String>,
    ) -> anyhow::Result<()> {
        let _ = error;
        let mut inner = self.inner.lock();
        if let Some(slots) = inner.queues.get_mut(&delivery.queue) {
            for slot in slots.iter_mut() {
                if slot.held_by(delivery) {
                    slot.release();
                    slot.available_at = Instant::now() + delay;
                }
            }
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: Option<String>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let mut moved = None;
        if let Some(slots) = inner.queues.get_mut(&delivery.queue) {
            if let Some(index) =
                slots.iter().position(|slot| slot.held_by(delivery))
            {
                moved = Some(slots.remove(index));
            }
        }
        if let Some(slot) = moved {
            inner
                .dead
                .entry(dead_letter_queue(&delivery.queue))
                .or_default()
                .push(DeadLetter {
                    message: slot.message,
                    reason,
                });
        }
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> anyhow::Result<usize> {
        let inner = self.inner.lock();
        Ok(inner
            .queues
            .get(queue)
            .map(|slots| {
                slots
                    .iter()
                    .filter(|slot| slot.state == SlotState::Ready)
                    .count()
            })
            .unwrap_or(0))
    }
}
