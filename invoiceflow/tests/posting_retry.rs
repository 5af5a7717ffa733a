//! Posting worker behavior: bounded retry, terminal outcomes, duplicates.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use invoiceflow::broker::{HandleOutcome, MessageBroker, MessageHandler};
use invoiceflow::config::PostingConfig;
use invoiceflow::event::{
    queues, ApprovedEvent, PostedEvent, PostedStatus, Topology,
};
use invoiceflow::invoice::{
    InvoiceFields, InvoiceRecord, InvoiceStatus, PostingOutcome, ReviewRecord,
};
use invoiceflow::posting::PostingWorker;
use invoiceflow_testkit::{
    InMemoryBroker, InMemoryInvoiceStore, LedgerStep, ScriptedLedger,
};

fn posting_config() -> PostingConfig {
    PostingConfig {
        max_retries: 3,
        backoff_base_ms: 1,
        backoff_cap_ms: 5,
        ..PostingConfig::default()
    }
}

struct Fixture {
    broker: InMemoryBroker,
    invoices: InMemoryInvoiceStore,
    ledger: Arc<ScriptedLedger>,
    worker: PostingWorker,
}

async fn fixture(ledger: ScriptedLedger) -> Fixture {
    let broker = InMemoryBroker::new();
    broker
        .declare_topology(&Topology::standard())
        .await
        .unwrap();
    let invoices = InMemoryInvoiceStore::new();
    let ledger = Arc::new(ledger);
    let worker = PostingWorker::new(
        Arc::new(invoices.clone()),
        Arc::clone(&ledger) as Arc<dyn invoiceflow::posting::LedgerClient>,
        Arc::new(broker.clone()),
        &posting_config(),
    );
    Fixture {
        broker,
        invoices,
        ledger,
        worker,
    }
}

fn reviewed_invoice(f: &Fixture, approved: bool) -> Uuid {
    let id = Uuid::now_v7();
    let mut record = InvoiceRecord::pending(id, format!("raw/{id}"), None);
    record.status = InvoiceStatus::Reviewed;
    record.fields = Some(InvoiceFields {
        vendor_name: Some("Acme Corp".into()),
        invoice_number: Some("INV-7".into()),
        total_amount: Some("1020.00".parse::<Decimal>().unwrap()),
        ..InvoiceFields::default()
    });
    record.review = Some(ReviewRecord {
        reviewed_by: "ap-clerk".into(),
        approved,
        notes: None,
        reviewed_at: Utc::now(),
    });
    f.invoices.seed(record);
    id
}

async fn published_posted(f: &Fixture) -> Vec<PostedEvent> {
    let mut events = Vec::new();
    while let Some(delivery) =
        f.broker.fetch(queues::POSTED, "test").await.unwrap()
    {
        events.push(serde_json::from_str(&delivery.message.body).unwrap());
        f.broker.ack(&delivery).await.unwrap();
    }
    events
}

fn approved(id: Uuid) -> ApprovedEvent {
    ApprovedEvent {
        correlation_id: id,
        approved_by: "ap-clerk".into(),
    }
}

#[tokio::test]
async fn successful_posting_records_reference() {
    let f =
        fixture(ScriptedLedger::new(LedgerStep::Succeed("JRN-42".into())))
            .await;
    let id = reviewed_invoice(&f, true);

    let outcome = f.worker.handle(approved(id)).await;
    assert!(matches!(outcome, HandleOutcome::Success));
    assert_eq!(f.ledger.calls(), 1);

    let record = f.invoices.get(id).unwrap();
    assert_eq!(record.status, InvoiceStatus::Posted);
    assert_eq!(
        record.posting.unwrap().external_reference.as_deref(),
        Some("JRN-42")
    );

    let events = published_posted(&f).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, PostedStatus::Posted);
    assert_eq!(events[0].external_reference.as_deref(), Some("JRN-42"));
}

#[tokio::test(start_paused = true)]
async fn permanently_unavailable_ledger_spends_exact_retry_budget() {
    let f = fixture(ScriptedLedger::new(LedgerStep::Transient(
        "503 Service Unavailable".into(),
    )))
    .await;
    let id = reviewed_invoice(&f, true);

    let outcome = f.worker.handle(approved(id)).await;
    assert!(matches!(outcome, HandleOutcome::Success));

    // max_retries = 3: the initial call plus three retries, no more.
    assert_eq!(f.ledger.calls(), 4);

    let record = f.invoices.get(id).unwrap();
    assert_eq!(record.status, InvoiceStatus::PostingFailed);
    assert!(record
        .posting
        .unwrap()
        .error
        .unwrap()
        .contains("retry budget exhausted"));

    let events = published_posted(&f).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, PostedStatus::PostingFailed);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_then_success_posts() {
    let ledger = ScriptedLedger::new(LedgerStep::Succeed("JRN-1".into()))
        .push(LedgerStep::Transient("502".into()));
    let f = fixture(ledger).await;
    let id = reviewed_invoice(&f, true);

    let outcome = f.worker.handle(approved(id)).await;
    assert!(matches!(outcome, HandleOutcome::Success));
    assert_eq!(f.ledger.calls(), 2);
    assert_eq!(f.invoices.get(id).unwrap().status, InvoiceStatus::Posted);
}

#[tokio::test]
async fn rejection_fails_immediately_without_retry() {
    let f = fixture(ScriptedLedger::new(LedgerStep::Reject(
        "422 duplicate invoice number".into(),
    )))
    .await;
    let id = reviewed_invoice(&f, true);

    let outcome = f.worker.handle(approved(id)).await;
    assert!(matches!(outcome, HandleOutcome::Success));
    assert_eq!(f.ledger.calls(), 1);
    assert_eq!(
        f.invoices.get(id).unwrap().status,
        InvoiceStatus::PostingFailed
    );
}

#[tokio::test]
async fn duplicate_delivery_after_posting_is_a_noop() {
    let f =
        fixture(ScriptedLedger::new(LedgerStep::Succeed("JRN-9".into())))
            .await;
    let id = reviewed_invoice(&f, true);

    assert!(matches!(
        f.worker.handle(approved(id)).await,
        HandleOutcome::Success
    ));
    assert!(matches!(
        f.worker.handle(approved(id)).await,
        HandleOutcome::Success
    ));

    // One ledger call, one event; the second delivery changed nothing.
    assert_eq!(f.ledger.calls(), 1);
    assert_eq!(published_posted(&f).await.len(), 1);
}

#[tokio::test]
async fn settled_failure_is_not_retried_on_redelivery() {
    let f = fixture(ScriptedLedger::new(LedgerStep::Reject("422".into())))
        .await;
    let id = reviewed_invoice(&f, true);

    assert!(matches!(
        f.worker.handle(approved(id)).await,
        HandleOutcome::Success
    ));
    assert!(matches!(
        f.worker.handle(approved(id)).await,
        HandleOutcome::Success
    ));
    assert_eq!(f.ledger.calls(), 1);
}

#[tokio::test]
async fn rejected_review_is_never_posted() {
    let f =
        fixture(ScriptedLedger::new(LedgerStep::Succeed("JRN-1".into())))
            .await;
    let id = reviewed_invoice(&f, false);

    let outcome = f.worker.handle(approved(id)).await;
    assert!(matches!(outcome, HandleOutcome::Success));
    assert_eq!(f.ledger.calls(), 0);
    assert_eq!(f.invoices.get(id).unwrap().status, InvoiceStatus::Reviewed);
}

#[tokio::test]
async fn unreviewed_invoice_requeues_the_event() {
    let f =
        fixture(ScriptedLedger::new(LedgerStep::Succeed("JRN-1".into())))
            .await;
    let id = Uuid::now_v7();
    let mut record = InvoiceRecord::pending(id, format!("raw/{id}"), None);
    record.status = InvoiceStatus::NeedsReview;
    f.invoices.seed(record);

    let outcome = f.worker.handle(approved(id)).await;
    assert!(matches!(outcome, HandleOutcome::RetryableFailure { .. }));
    assert_eq!(f.ledger.calls(), 0);
}

#[tokio::test]
async fn unknown_invoice_is_a_permanent_failure() {
    let f =
        fixture(ScriptedLedger::new(LedgerStep::Succeed("JRN-1".into())))
            .await;
    let outcome = f.worker.handle(approved(Uuid::now_v7())).await;
    assert!(matches!(outcome, HandleOutcome::PermanentFailure { .. }));
    assert_eq!(f.ledger.calls(), 0);
}

#[tokio::test]
async fn posting_outcome_carries_timestamp() {
    let f =
        fixture(ScriptedLedger::new(LedgerStep::Succeed("JRN-3".into())))
            .await;
    let id = reviewed_invoice(&f, true);
    let before = Utc::now();

    f.worker.handle(approved(id)).await;

    let PostingOutcome { posted_at, .. } =
        f.invoices.get(id).unwrap().posting.unwrap();
    assert!(posted_at >= before);
}
