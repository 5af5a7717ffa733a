//! Lease behavior of the broker: a claimed delivery that is never settled
//! must come back, and a stale claim must not settle a reclaimed message.

use std::time::Duration;

use uuid::Uuid;

use invoiceflow::broker::{Message, MessageBroker};
use invoiceflow::event::{queues, IngestedEvent};
use invoiceflow_testkit::InMemoryBroker;

const LEASE: Duration = Duration::from_secs(5);

fn broker() -> InMemoryBroker {
    InMemoryBroker::new().with_lease_ttl(LEASE)
}

fn ingested_message(correlation_id: Uuid) -> Message {
    Message::from_event(&IngestedEvent {
        correlation_id,
        document_key: format!("raw/{correlation_id}"),
        filename: None,
    })
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn unsettled_claim_is_redelivered_after_the_lease_expires() {
    let broker = broker();
    let correlation_id = Uuid::now_v7();
    broker.push(queues::INGESTED, ingested_message(correlation_id));

    let first = broker
        .fetch(queues::INGESTED, "crashed-consumer")
        .await
        .unwrap()
        .expect("message should be claimable");

    // The consumer dies here without settling. Past the lease deadline
    // the message must be handed out again, payload intact.
    tokio::time::advance(LEASE + Duration::from_secs(1)).await;

    let second = broker
        .fetch(queues::INGESTED, "replacement-consumer")
        .await
        .unwrap()
        .expect("abandoned claim should be redelivered");
    assert_eq!(second.message_id, first.message_id);
    assert_eq!(second.message.correlation_id, correlation_id.to_string());

    broker.ack(&second).await.unwrap();
    assert_eq!(broker.remaining(queues::INGESTED), 0);
}

#[tokio::test(start_paused = true)]
async fn claim_stays_exclusive_while_the_lease_is_live() {
    let broker = broker();
    broker.push(queues::INGESTED, ingested_message(Uuid::now_v7()));

    let claimed = broker
        .fetch(queues::INGESTED, "worker-a")
        .await
        .unwrap()
        .expect("message should be claimable");

    tokio::time::advance(LEASE - Duration::from_secs(1)).await;
    let contender = broker.fetch(queues::INGESTED, "worker-b").await.unwrap();
    assert!(contender.is_none(), "live claim must not be handed out twice");

    broker.ack(&claimed).await.unwrap();
    assert_eq!(broker.remaining(queues::INGESTED), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_delivery_cannot_settle_a_reclaimed_message() {
    let broker = broker();
    broker.push(queues::INGESTED, ingested_message(Uuid::now_v7()));

    let stale = broker
        .fetch(queues::INGESTED, "worker-a")
        .await
        .unwrap()
        .expect("message should be claimable");

    tokio::time::advance(LEASE + Duration::from_secs(1)).await;

    let current = broker
        .fetch(queues::INGESTED, "worker-b")
        .await
        .unwrap()
        .expect("abandoned claim should be redelivered");

    // A consumer that comes back after its lease ran out must not be able
    // to remove the message out from under the current holder.
    broker.ack(&stale).await.unwrap();
    assert_eq!(broker.remaining(queues::INGESTED), 1);
    broker
        .dead_letter(&stale, Some("stale".to_string()))
        .await
        .unwrap();
    assert!(broker.dead_letters(queues::INGESTED).is_empty());

    broker.ack(&current).await.unwrap();
    assert_eq!(broker.remaining(queues::INGESTED), 0);
}

#[tokio::test(start_paused = true)]
async fn settled_delivery_does_not_come_back_after_its_lease_deadline() {
    let broker = broker();
    broker.push(queues::INGESTED, ingested_message(Uuid::now_v7()));

    let claimed = broker
        .fetch(queues::INGESTED, "worker-a")
        .await
        .unwrap()
        .expect("message should be claimable");
    broker.ack(&claimed).await.unwrap();

    tokio::time::advance(LEASE + Duration::from_secs(1)).await;
    assert!(broker.fetch(queues::INGESTED, "worker-a").await.unwrap().is_none());
    assert_eq!(broker.remaining(queues::INGESTED), 0);
}
