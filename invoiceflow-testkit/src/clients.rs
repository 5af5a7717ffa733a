//! Scripted stand-ins for the external clients.
//!
//! Each double takes a queue of steps; when the script runs dry the
//! configured fallback repeats forever, so "fails every time" scenarios
//! need no step counting.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use invoiceflow::extract::llm::{
    ExtractError, ExtractedFields, FieldExtractor,
};
use invoiceflow::extract::ocr::{OcrEngine, OcrError, OcrText};
use invoiceflow::invoice::InvoiceFields;
use invoiceflow::posting::ledger::{
    LedgerClient, LedgerError, LedgerPosting, LedgerReceipt,
};

#[derive(Clone, Debug)]
pub enum OcrStep {
    Text(String, f32),
    Unsupported(String),
    Transient(String),
    Fatal(String),
}

impl OcrStep {
    fn into_result(self) -> Result<OcrText, OcrError> {
        match self {
            OcrStep::Text(text, confidence) => {
                Ok(OcrText { text, confidence })
            }
            OcrStep::Unsupported(msg) => {
                Err(OcrError::UnsupportedDocument(msg))
            }
            OcrStep::Transient(msg) => Err(OcrError::Transient(msg)),
            OcrStep::Fatal(msg) => Err(OcrError::Fatal(msg)),
        }
    }
}

pub struct ScriptedOcrEngine {
    name: &'static str,
    script: Mutex<VecDeque<OcrStep>>,
    fallback: OcrStep,
    calls: Arc<Mutex<usize>>,
}

impl ScriptedOcrEngine {
    pub fn new(name: &'static str, fallback: OcrStep) -> Self {
        Self {
            name,
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn push(self, step: OcrStep) -> Self {
        self.script.lock().push_back(step);
        self
    }

    /// Shared call counter, usable after the engine is boxed away.
    pub fn call_counter(&self) -> Arc<Mutex<usize>> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl OcrEngine for ScriptedOcrEngine {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn recognize(&self, _document: &[u8]) -> Result<OcrText, OcrError> {
        *self.calls.lock() += 1;
        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        step.into_result()
    }
}

#[derive(Clone, Debug)]
pub enum ExtractStep {
    Fields(InvoiceFields, bool),
    RateLimited,
    Upstream(String),
    Malformed(String),
}

impl ExtractStep {
    fn into_result(self) -> Result<ExtractedFields, ExtractError> {
        match self {
            ExtractStep::Fields(fields, truncated) => {
                Ok(ExtractedFields { fields, truncated })
            }
            ExtractStep::RateLimited => Err(ExtractError::RateLimited),
            ExtractStep::Upstream(msg) => Err(ExtractError::Upstream(msg)),
            ExtractStep::Malformed(msg) => Err(ExtractError::Malformed(msg)),
        }
    }
}

pub struct ScriptedExtractor {
    script: Mutex<VecDeque<ExtractStep>>,
    fallback: ExtractStep,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedExtractor {
    pub fn new(fallback: ExtractStep) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn push(self, step: ExtractStep) -> Self {
        self.script.lock().push_back(step);
        self
    }

    /// OCR texts the extractor was handed, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl FieldExtractor for ScriptedExtractor {
    async fn extract(
        &self,
        ocr_text: &str,
    ) -> Result<ExtractedFields, ExtractError> {
        self.prompts.lock().push(ocr_text.to_string());
        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        step.into_result()
    }
}

#[derive(Clone, Debug)]
pub enum LedgerStep {
    Succeed(String),
    Transient(String),
    Reject(String),
}

impl LedgerStep {
    fn into_result(self) -> Result<LedgerReceipt, LedgerError> {
        match self {
            LedgerStep::Succeed(reference) => {
                Ok(LedgerReceipt { reference })
            }
            LedgerStep::Transient(msg) => Err(LedgerError::Transient(msg)),
            LedgerStep::Reject(msg) => Err(LedgerError::Rejected(msg)),
        }
    }
}

pub struct ScriptedLedger {
    script: Mutex<VecDeque<LedgerStep>>,
    fallback: LedgerStep,
    postings: Mutex<Vec<LedgerPosting>>,
}

impl ScriptedLedger {
    pub fn new(fallback: LedgerStep) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            postings: Mutex::new(Vec::new()),
        }
    }

    pub fn push(self, step: LedgerStep) -> Self {
        self.script.lock().push_back(step);
        self
    }

    pub fn calls(&self) -> usize {
        self.postings.lock().len()
    }

    pub fn postings(&self) -> Vec<LedgerPosting> {
        self.postings.lock().clone()
    }
}

#[async_trait]
impl LedgerClient for ScriptedLedger {
    async fn post_invoice(
        &self,
        posting: &LedgerPosting,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.postings.lock().push(posting.clone());
        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        step.into_result()
    }
}
