//! Consumer loop behavior against the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use invoiceflow::broker::{
    Consumer, HandleOutcome, Message, MessageBroker, MessageHandler,
};
use invoiceflow::config::ConsumerConfig;
use invoiceflow::event::{queues, IngestedEvent, Topology};
use invoiceflow::runtime::ShutdownToken;
use invoiceflow_testkit::InMemoryBroker;

fn test_config() -> ConsumerConfig {
    ConsumerConfig {
        prefetch: 4,
        max_redeliveries: 2,
        backoff_base_ms: 1,
        backoff_cap_ms: 10,
        poll_interval_ms: 5,
        shutdown_grace_secs: 5,
    }
}

fn ingested_message(correlation_id: Uuid) -> Message {
    Message::from_event(&IngestedEvent {
        correlation_id,
        document_key: format!("raw/{correlation_id}"),
        filename: None,
    })
    .unwrap()
}

/// Handler that returns a fixed outcome and records what it saw.
struct ScriptHandler {
    outcome: HandleOutcome,
    seen: Arc<Mutex<Vec<Uuid>>>,
}

impl ScriptHandler {
    fn new(outcome: HandleOutcome) -> Self {
        Self {
            outcome,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl MessageHandler for ScriptHandler {
    type Message = IngestedEvent;

    async fn handle(&self, message: IngestedEvent) -> HandleOutcome {
        self.seen.lock().push(message.correlation_id);
        self.outcome.clone()
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test]
async fn successful_delivery_is_acked() {
    let broker = InMemoryBroker::new();
    let handler = ScriptHandler::new(HandleOutcome::Success);
    let seen = Arc::clone(&handler.seen);
    let shutdown = ShutdownToken::new();

    let consumer = Consumer::new(
        Arc::new(broker.clone()),
        queues::INGESTED,
        handler,
        test_config(),
        shutdown.clone(),
    );
    let running = tokio::spawn(async move { consumer.run().await });

    broker
        .declare_topology(&Topology::standard())
        .await
        .unwrap();
    let id = Uuid::now_v7();
    broker.push(queues::INGESTED, ingested_message(id));

    wait_until(|| seen.lock().len() == 1).await;
    wait_until(|| broker.remaining(queues::INGESTED) == 0).await;
    assert!(broker.dead_letters(queues::INGESTED).is_empty());

    shutdown.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_payload_lands_in_dead_letter_exactly_once() {
    let broker = InMemoryBroker::new();
    let handler = ScriptHandler::new(HandleOutcome::Success);
    let seen = Arc::clone(&handler.seen);
    let shutdown = ShutdownToken::new();

    let consumer = Consumer::new(
        Arc::new(broker.clone()),
        queues::INGESTED,
        handler,
        test_config(),
        shutdown.clone(),
    );
    let running = tokio::spawn(async move { consumer.run().await });

    broker.push(
        queues::INGESTED,
        Message {
            correlation_id: Uuid::now_v7().to_string(),
            published_at: Utc::now(),
            content_type: "application/json".into(),
            body: "{not json at all".into(),
        },
    );

    wait_until(|| !broker.dead_letters(queues::INGESTED).is_empty()).await;
    wait_until(|| broker.remaining(queues::INGESTED) == 0).await;

    let dead = broker.dead_letters(queues::INGESTED);
    assert_eq!(dead.len(), 1);
    assert!(dead[0]
        .reason
        .as_deref()
        .unwrap()
        .contains("malformed payload"));
    // The handler never saw it.
    assert!(seen.lock().is_empty());

    shutdown.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn retryable_failures_hit_the_ceiling_then_dead_letter() {
    let broker = InMemoryBroker::new();
    let handler =
        ScriptHandler::new(HandleOutcome::retryable("database offline"));
    let seen = Arc::clone(&handler.seen);
    let shutdown = ShutdownToken::new();

    let consumer = Consumer::new(
        Arc::new(broker.clone()),
        queues::INGESTED,
        handler,
        test_config(),
        shutdown.clone(),
    );
    let running = tokio::spawn(async move { consumer.run().await });

    broker.push(queues::INGESTED, ingested_message(Uuid::now_v7()));

    wait_until(|| !broker.dead_letters(queues::INGESTED).is_empty()).await;

    // max_redeliveries = 2: the first delivery plus one requeue run the
    // handler, the second failure trips the ceiling.
    assert_eq!(seen.lock().len(), 2);
    assert_eq!(broker.remaining(queues::INGESTED), 0);
    let dead = broker.dead_letters(queues::INGESTED);
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.as_deref().unwrap().contains("ceiling"));

    shutdown.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn permanent_failure_dead_letters_without_retry() {
    let broker = InMemoryBroker::new();
    let handler =
        ScriptHandler::new(HandleOutcome::permanent("unknown invoice"));
    let seen = Arc::clone(&handler.seen);
    let shutdown = ShutdownToken::new();

    let consumer = Consumer::new(
        Arc::new(broker.clone()),
        queues::INGESTED,
        handler,
        test_config(),
        shutdown.clone(),
    );
    let running = tokio::spawn(async move { consumer.run().await });

    broker.push(queues::INGESTED, ingested_message(Uuid::now_v7()));

    wait_until(|| !broker.dead_letters(queues::INGESTED).is_empty()).await;
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(broker.remaining(queues::INGESTED), 0);

    shutdown.cancel();
    running.await.unwrap().unwrap();
}

/// Handler that blocks until released, to hold a delivery in flight.
struct SlowHandler {
    entered: Arc<Mutex<bool>>,
    release: Arc<tokio::sync::Notify>,
    finished: Arc<Mutex<bool>>,
}

#[async_trait]
impl MessageHandler for SlowHandler {
    type Message = IngestedEvent;

    async fn handle(&self, _message: IngestedEvent) -> HandleOutcome {
        *self.entered.lock() = true;
        self.release.notified().await;
        *self.finished.lock() = true;
        HandleOutcome::Success
    }
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_deliveries() {
    let broker = InMemoryBroker::new();
    let entered = Arc::new(Mutex::new(false));
    let release = Arc::new(tokio::sync::Notify::new());
    let finished = Arc::new(Mutex::new(false));
    let handler = SlowHandler {
        entered: Arc::clone(&entered),
        release: Arc::clone(&release),
        finished: Arc::clone(&finished),
    };
    let shutdown = ShutdownToken::new();

    let consumer = Consumer::new(
        Arc::new(broker.clone()),
        queues::INGESTED,
        handler,
        test_config(),
        shutdown.clone(),
    );
    let running = tokio::spawn(async move { consumer.run().await });

    broker.push(queues::INGESTED, ingested_message(Uuid::now_v7()));

    // Let the delivery get in flight, then shut down while it hangs.
    wait_until(|| *entered.lock()).await;
    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!running.is_finished());

    release.notify_waiters();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(*finished.lock());
}
