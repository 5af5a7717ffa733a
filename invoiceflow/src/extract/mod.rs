//! Extraction stage: raw document in, structured fields out.
//!
//! Consumes `invoice.ingested`, runs the OCR fallback chain, asks the
//! model for structured fields, persists the result and only then
//! publishes `extracted`. The acknowledgement happens after the publish,
//! so a crash anywhere in between redelivers the message instead of
//! losing the invoice.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::broker::{
    publish_event, HandleOutcome, MessageBroker, MessageHandler,
};
use crate::event::{ExtractedEvent, IngestedEvent};
use crate::invoice::{
    ExtractionOutcome, InvoiceFields, InvoiceRecord, InvoiceStatus,
};
use crate::object_store::{raw_ocr_key, ObjectStore};
use crate::store::InvoiceStore;

pub mod llm;
pub mod ocr;

pub use llm::{ExtractError, ExtractedFields, FieldExtractor, LlmExtractor};
pub use ocr::{CloudOcr, LocalOcr, OcrChain, OcrEngine, OcrError, OcrText};

pub struct ExtractionWorker {
    invoices: Arc<dyn InvoiceStore>,
    objects: Arc<dyn ObjectStore>,
    ocr: OcrChain,
    extractor: Arc<dyn FieldExtractor>,
    broker: Arc<dyn MessageBroker>,
}

impl ExtractionWorker {
    pub fn new(
        invoices: Arc<dyn InvoiceStore>,
        objects: Arc<dyn ObjectStore>,
        ocr: OcrChain,
        extractor: Arc<dyn FieldExtractor>,
        broker: Arc<dyn MessageBroker>,
    ) -> Self {
        Self {
            invoices,
            objects,
            ocr,
            extractor,
            broker,
        }
    }

    async fn process(
        &self,
        event: IngestedEvent,
    ) -> anyhow::Result<HandleOutcome> {
        let id = event.correlation_id;

        self.invoices
            .create_pending(&InvoiceRecord::pending(
                id,
                &event.document_key,
                event.filename.clone(),
            ))
            .await?;

        if !self.invoices.begin_processing(id).await? {
            // A previous delivery already claimed this invoice. Resume if
            // that attempt died before recording its extraction. If it died
            // after recording but before publishing, resend the event from
            // the record so the pipeline does not stall on this invoice.
            let resumable = match self.invoices.fetch(id).await? {
                Some(record)
                    if record.status == InvoiceStatus::Processing =>
                {
                    match (record.extraction, record.fields) {
                        (Some(extraction), Some(fields)) => {
                            info!(
                                "extraction already recorded, republishing"
                            );
                            publish_event(
                                self.broker.as_ref(),
                                &ExtractedEvent {
                                    correlation_id: id,
                                    raw_ocr_key: extraction.raw_ocr_key,
                                    fields,
                                },
                            )
                            .await?;
                            return Ok(HandleOutcome::Success);
                        }
                        _ => true,
                    }
                }
                _ => false,
            };
            if !resumable {
                info!("invoice already past extraction, skipping");
                return Ok(HandleOutcome::Success);
            }
        }

        let document = self.objects.get(&event.document_key).await?;

        let (ocr_text, engine) = match self.ocr.recognize(&document).await {
            Ok(recognized) => recognized,
            Err(err @ OcrError::UnsupportedDocument(_)) => {
                // No engine will ever read this document.
                self.invoices.mark_failed(id, &err.to_string()).await?;
                return Ok(HandleOutcome::Success);
            }
            Err(err) => return Ok(HandleOutcome::retryable(err)),
        };

        if ocr_text.text.trim().is_empty() {
            self.invoices.mark_failed(id, "no text recognized").await?;
            return Ok(HandleOutcome::Success);
        }

        let ocr_key = raw_ocr_key(id);
        self.objects
            .put(&ocr_key, ocr_text.text.as_bytes())
            .await?;

        let extracted = match self.extractor.extract(&ocr_text.text).await {
            Ok(extracted) => extracted,
            Err(ExtractError::RateLimited) => {
                return Ok(HandleOutcome::retryable(ExtractError::RateLimited))
            }
            Err(err) => {
                // The model failing is not the invoice failing; degrade to
                // empty fields and let the emptiness check decide.
                warn!(error = %err, "field extraction degraded to empty fields");
                ExtractedFields {
                    fields: InvoiceFields::empty(),
                    truncated: false,
                }
            }
        };

        if extracted.fields == InvoiceFields::empty() {
            self.invoices.mark_failed(id, "no fields extracted").await?;
            return Ok(HandleOutcome::Success);
        }

        let outcome = ExtractionOutcome {
            raw_ocr_key: ocr_key.clone(),
            ocr_engine: engine.to_string(),
            confidence: ocr_text.confidence,
            truncated: extracted.truncated,
        };
        if !self
            .invoices
            .complete_extraction(id, &extracted.fields, &outcome)
            .await?
        {
            info!("extraction already recorded by another delivery");
            return Ok(HandleOutcome::Success);
        }

        publish_event(
            self.broker.as_ref(),
            &ExtractedEvent {
                correlation_id: id,
                raw_ocr_key: ocr_key,
                fields: extracted.fields,
            },
        )
        .await?;

        info!(ocr_engine = engine, "extraction complete");
        Ok(HandleOutcome::Success)
    }
}

#[async_trait]
impl MessageHandler for ExtractionWorker {
    type Message = IngestedEvent;

    async fn handle(&self, message: IngestedEvent) -> HandleOutcome {
        match self.process(message).await {
            Ok(outcome) => outcome,
            // Store, blob or publish errors are infrastructure; requeue.
            Err(err) => HandleOutcome::retryable(err),
        }
    }
}
