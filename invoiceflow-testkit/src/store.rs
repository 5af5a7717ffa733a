//! In-memory stores mirroring the postgres guard semantics.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use invoiceflow::invoice::{
    ExtractionOutcome, InvoiceFields, InvoiceRecord, InvoiceStatus,
    MatchDecision, MatchDetail, PostingOutcome, PurchaseOrder, ReviewRecord,
};
use invoiceflow::object_store::ObjectStore;
use invoiceflow::store::{InvoiceStore, PurchaseOrderStore};

#[derive(Clone, Default)]
pub struct InMemoryInvoiceStore {
    records: Arc<Mutex<HashMap<Uuid, InvoiceRecord>>>,
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record in an arbitrary state, bypassing the transition
    /// guards, so tests can start mid-pipeline.
    pub fn seed(&self, record: InvoiceRecord) {
        self.records.lock().insert(record.correlation_id, record);
    }

    pub fn get(&self, correlation_id: Uuid) -> Option<InvoiceRecord> {
        self.records.lock().get(&correlation_id).cloned()
    }

    fn update<F>(&self, correlation_id: Uuid, mutate: F) -> bool
    where
        F: FnOnce(&mut InvoiceRecord) -> bool,
    {
        let mut records = self.records.lock();
        match records.get_mut(&correlation_id) {
            Some(record) => {
                let changed = mutate(record);
                if changed {
                    record.updated_at = chrono::Utc::now();
                }
                changed
            }
            None => false,
        }
    }
}

#[async_trait]
impl InvoiceStore for InMemoryInvoiceStore {
    async fn create_pending(
        &self,
        record: &InvoiceRecord,
    ) -> anyhow::Result<()> {
        self.records
            .lock()
            .entry(record.correlation_id)
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn fetch(
        &self,
        correlation_id: Uuid,
    ) -> anyhow::Result<Option<InvoiceRecord>> {
        Ok(self.get(correlation_id))
    }

    async fn begin_processing(
        &self,
        correlation_id: Uuid,
    ) -> anyhow::Result<bool> {
        Ok(self.update(correlation_id, |record| {
            if record.status == InvoiceStatus::Pending {
                record.status = InvoiceStatus::Processing;
                true
            } else {
                false
            }
        }))
    }

    async fn complete_extraction(
        &self,
        correlation_id: Uuid,
        fields: &InvoiceFields,
        extraction: &ExtractionOutcome,
    ) -> anyhow::Result<bool> {
        Ok(self.update(correlation_id, |record| {
            if record.status == InvoiceStatus::Processing {
                record.fields = Some(fields.clone());
                record.extraction = Some(extraction.clone());
                true
            } else {
                false
            }
        }))
    }

    async fn mark_failed(
        &self,
        correlation_id: Uuid,
        reason: &str,
    ) -> anyhow::Result<bool> {
        Ok(self.update(correlation_id, |record| {
            if record.status == InvoiceStatus::Processing {
                record.status = InvoiceStatus::Failed;
                record.failure_reason = Some(reason.to_string());
                true
            } else {
                false
            }
        }))
    }

    async fn record_match_decision(
        &self,
        correlation_id: Uuid,
        decision: MatchDecision,
        detail: &MatchDetail,
        error: Option<&str>,
    ) -> anyhow::Result<bool> {
        Ok(self.update(correlation_id, |record| {
            if record.status == InvoiceStatus::Processing {
                record.status = decision.as_status();
                record.match_decision = Some(decision);
                record.match_detail = Some(detail.clone());
                if let Some(error) = error {
                    record.failure_reason = Some(error.to_string());
                }
                true
            } else {
                false
            }
        }))
    }

    async fn record_review(
        &self,
        correlation_id: Uuid,
        review: &ReviewRecord,
    ) -> anyhow::Result<bool> {
        Ok(self.update(correlation_id, |record| {
            if matches!(
                record.status,
                InvoiceStatus::NeedsReview | InvoiceStatus::AutoApproved
            ) {
                record.status = InvoiceStatus::Reviewed;
                record.review = Some(review.clone());
                true
            } else {
                false
            }
        }))
    }

    async fn record_posted(
        &self,
        correlation_id: Uuid,
        posting: &PostingOutcome,
    ) -> anyhow::Result<bool> {
        Ok(self.update(correlation_id, |record| {
            if record.status == InvoiceStatus::Reviewed {
                record.status = InvoiceStatus::Posted;
                record.posting = Some(posting.clone());
                true
            } else {
                false
            }
        }))
    }

    async fn record_posting_failed(
        &self,
        correlation_id: Uuid,
        posting: &PostingOutcome,
    ) -> anyhow::Result<bool> {
        Ok(self.update(correlation_id, |record| {
            if record.status == InvoiceStatus::Reviewed {
                record.status = InvoiceStatus::PostingFailed;
                record.posting = Some(posting.clone());
                true
            } else {
                false
            }
        }))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryPurchaseOrderStore {
    orders: Arc<Mutex<HashMap<String, PurchaseOrder>>>,
    lookups: Arc<Mutex<Vec<String>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl InMemoryPurchaseOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every lookup after this call fails with the given message, for
    /// exercising the fail-safe path.
    pub fn fail_lookups(&self, message: &str) {
        *self.failure.lock() = Some(message.to_string());
    }

    /// Numbers looked up, in order.
    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().clone()
    }
}

#[async_trait]
impl PurchaseOrderStore for InMemoryPurchaseOrderStore {
    async fn find_by_number(
        &self,
        po_number: &str,
    ) -> anyhow::Result<Option<PurchaseOrder>> {
        self.lookups.lock().push(po_number.to_string());
        if let Some(message) = self.failure.lock().clone() {
            anyhow::bail!(message);
        }
        Ok(self.orders.lock().get(po_number).cloned())
    }

    async fn upsert(&self, po: &PurchaseOrder) -> anyhow::Result<()> {
        self.orders.lock().insert(po.po_number.clone(), po.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.lock().contains_key(key)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        self.blobs
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such object: {}", key))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        self.blobs.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}
