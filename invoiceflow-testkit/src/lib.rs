//! Test doubles for the invoiceflow pipeline.
//!
//! Everything here is in-memory and deterministic: a broker with
//! inspectable dead-letter queues, stores with the same conditional
//! update semantics as the postgres implementations, and scripted
//! stand-ins for the OCR engines, the field extractor and the ledger.

pub mod broker;
pub mod clients;
pub mod store;

pub use broker::{DeadLetter, InMemoryBroker};
pub use clients::{
    ExtractStep, LedgerStep, OcrStep, ScriptedExtractor, ScriptedLedger,
    ScriptedOcrEngine,
};
pub use store::{
    InMemoryInvoiceStore, InMemoryObjectStore, InMemoryPurchaseOrderStore,
};
