//! Matching worker behavior: tolerance boundaries, candidate order,
//! fail-safe parking.

use std::sync::Arc;

use rust_decimal::Decimal;
use uuid::Uuid;

use invoiceflow::broker::{HandleOutcome, MessageBroker, MessageHandler};
use invoiceflow::config::MatchingConfig;
use invoiceflow::event::{queues, ExtractedEvent, MatchedEvent, Topology};
use invoiceflow::invoice::{
    InvoiceFields, InvoiceRecord, InvoiceStatus, MatchDecision, PurchaseOrder,
};
use invoiceflow::matching::MatchingWorker;
use invoiceflow::store::PurchaseOrderStore;
use invoiceflow_testkit::{
    InMemoryBroker, InMemoryInvoiceStore, InMemoryPurchaseOrderStore,
};

fn dec(value: &str) -> Decimal {
    value.parse().unwrap()
}

struct Fixture {
    broker: InMemoryBroker,
    invoices: InMemoryInvoiceStore,
    purchase_orders: InMemoryPurchaseOrderStore,
    worker: MatchingWorker,
}

async fn fixture() -> Fixture {
    let broker = InMemoryBroker::new();
    broker
        .declare_topology(&Topology::standard())
        .await
        .unwrap();
    let invoices = InMemoryInvoiceStore::new();
    let purchase_orders = InMemoryPurchaseOrderStore::new();
    let worker = MatchingWorker::new(
        Arc::new(invoices.clone()),
        Arc::new(purchase_orders.clone()),
        Arc::new(broker.clone()),
        &MatchingConfig::default(),
    );
    Fixture {
        broker,
        invoices,
        purchase_orders,
        worker,
    }
}

fn processing_invoice(f: &Fixture) -> Uuid {
    let id = Uuid::now_v7();
    let mut record = InvoiceRecord::pending(id, format!("raw/{id}"), None);
    record.status = InvoiceStatus::Processing;
    f.invoices.seed(record);
    id
}

fn extracted(id: Uuid, amount: &str, po_numbers: &[&str]) -> ExtractedEvent {
    ExtractedEvent {
        correlation_id: id,
        raw_ocr_key: format!("ocr/{id}.txt"),
        fields: InvoiceFields {
            total_amount: Some(dec(amount)),
            po_numbers: po_numbers.iter().map(|s| s.to_string()).collect(),
            ..InvoiceFields::default()
        },
    }
}

async fn seed_po(f: &Fixture, number: &str, amount: &str) {
    f.purchase_orders
        .upsert(&PurchaseOrder {
            id: Uuid::now_v7(),
            po_number: number.to_string(),
            total_amount: dec(amount),
            order_date: None,
        })
        .await
        .unwrap();
}

async fn published_matched(f: &Fixture) -> Vec<MatchedEvent> {
    let mut events = Vec::new();
    while let Some(delivery) =
        f.broker.fetch(queues::MATCHED, "test").await.unwrap()
    {
        events.push(serde_json::from_str(&delivery.message.body).unwrap());
        f.broker.ack(&delivery).await.unwrap();
    }
    events
}

#[tokio::test]
async fn amount_at_tolerance_boundary_auto_approves() {
    let f = fixture().await;
    let id = processing_invoice(&f);
    seed_po(&f, "PO-1", "1000.00").await;

    let outcome = f.worker.handle(extracted(id, "1020.00", &["PO-1"])).await;
    assert!(matches!(outcome, HandleOutcome::Success));

    let record = f.invoices.get(id).unwrap();
    assert_eq!(record.status, InvoiceStatus::AutoApproved);
    let detail = record.match_detail.unwrap();
    assert_eq!(detail.po_number.as_deref(), Some("PO-1"));
    assert_eq!(detail.variance_pct, Some(dec("0.02")));

    let events = published_matched(&f).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, MatchDecision::AutoApproved);
    assert!(events[0].error.is_none());
}

#[tokio::test]
async fn one_cent_over_tolerance_needs_review() {
    let f = fixture().await;
    let id = processing_invoice(&f);
    seed_po(&f, "PO-1", "1000.00").await;

    let outcome = f.worker.handle(extracted(id, "1020.01", &["PO-1"])).await;
    assert!(matches!(outcome, HandleOutcome::Success));

    let record = f.invoices.get(id).unwrap();
    assert_eq!(record.status, InvoiceStatus::NeedsReview);
}

#[tokio::test]
async fn zero_amount_order_needs_review_without_panicking() {
    let f = fixture().await;
    let id = processing_invoice(&f);
    seed_po(&f, "PO-1", "0.00").await;

    let outcome = f.worker.handle(extracted(id, "500.00", &["PO-1"])).await;
    assert!(matches!(outcome, HandleOutcome::Success));

    let record = f.invoices.get(id).unwrap();
    assert_eq!(record.status, InvoiceStatus::NeedsReview);
    assert_eq!(record.match_detail.unwrap().variance_pct, Some(Decimal::ONE));
}

#[tokio::test]
async fn first_present_candidate_decides() {
    let f = fixture().await;
    let id = processing_invoice(&f);
    seed_po(&f, "PO-1", "1000.00").await;

    let outcome = f
        .worker
        .handle(extracted(id, "1000.00", &["MISSING", "po-1 "]))
        .await;
    assert!(matches!(outcome, HandleOutcome::Success));

    // Lookups happen in order with normalized numbers.
    assert_eq!(f.purchase_orders.lookups(), vec!["MISSING", "PO-1"]);
    let record = f.invoices.get(id).unwrap();
    assert_eq!(record.status, InvoiceStatus::AutoApproved);
    assert_eq!(
        record.match_detail.unwrap().po_number.as_deref(),
        Some("PO-1")
    );
}

#[tokio::test]
async fn no_candidates_parks_for_review() {
    let f = fixture().await;
    let id = processing_invoice(&f);

    let outcome = f.worker.handle(extracted(id, "750.00", &[])).await;
    assert!(matches!(outcome, HandleOutcome::Success));

    let record = f.invoices.get(id).unwrap();
    assert_eq!(record.status, InvoiceStatus::NeedsReview);
    let detail = record.match_detail.unwrap();
    assert!(detail.po_number.is_none());
    assert_eq!(detail.invoice_amount, dec("750.00"));
}

#[tokio::test]
async fn lookup_failure_fails_safe_to_review_with_visible_error() {
    let f = fixture().await;
    let id = processing_invoice(&f);
    f.purchase_orders.fail_lookups("connection refused");

    let outcome = f.worker.handle(extracted(id, "900.00", &["PO-1"])).await;
    assert!(matches!(outcome, HandleOutcome::Success));

    let record = f.invoices.get(id).unwrap();
    assert_eq!(record.status, InvoiceStatus::NeedsReview);

    let events = published_matched(&f).await;
    assert_eq!(events.len(), 1);
    assert!(events[0]
        .error
        .as_deref()
        .unwrap()
        .contains("connection refused"));
}

#[tokio::test]
async fn missing_amount_is_permanent_and_fails_the_invoice() {
    let f = fixture().await;
    let id = processing_invoice(&f);

    let event = ExtractedEvent {
        correlation_id: id,
        raw_ocr_key: format!("ocr/{id}.txt"),
        fields: InvoiceFields::default(),
    };
    let outcome = f.worker.handle(event).await;
    assert!(matches!(outcome, HandleOutcome::PermanentFailure { .. }));

    let record = f.invoices.get(id).unwrap();
    assert_eq!(record.status, InvoiceStatus::Failed);
}

#[tokio::test]
async fn duplicate_delivery_does_not_publish_twice() {
    let f = fixture().await;
    let id = processing_invoice(&f);
    seed_po(&f, "PO-1", "1000.00").await;

    let event = extracted(id, "1000.00", &["PO-1"]);
    assert!(matches!(
        f.worker.handle(event.clone()).await,
        HandleOutcome::Success
    ));
    assert!(matches!(
        f.worker.handle(event).await,
        HandleOutcome::Success
    ));

    assert_eq!(published_matched(&f).await.len(), 1);
    let record = f.invoices.get(id).unwrap();
    assert_eq!(record.status, InvoiceStatus::AutoApproved);
}
