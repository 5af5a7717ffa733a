//! Extraction stage daemon: consumes `invoice.ingested`.

use std::sync::Arc;

use invoiceflow::broker::{Consumer, MessageBroker, PostgresBroker};
use invoiceflow::config::{
    ConsumerConfig, ExtractionConfig, ObjectStoreConfig, PersistenceConfig,
};
use invoiceflow::event::queues;
use invoiceflow::extract::{
    CloudOcr, ExtractionWorker, LlmExtractor, LocalOcr, OcrChain, OcrEngine,
};
use invoiceflow::object_store::{FsObjectStore, ObjectStore};
use invoiceflow::runtime::StageRuntime;
use invoiceflow::store::postgres::connect_pool;
use invoiceflow::store::{InvoiceStore, PostgresInvoiceStore};
use invoiceflow::telemetry;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let persistence = PersistenceConfig {
        connection_string: env_or(
            "DATABASE_URL",
            &PersistenceConfig::default().connection_string,
        ),
        ..PersistenceConfig::default()
    };
    let extraction = ExtractionConfig {
        cloud_ocr_url: env_or(
            "CLOUD_OCR_URL",
            &ExtractionConfig::default().cloud_ocr_url,
        ),
        model_api_url: env_or(
            "MODEL_API_URL",
            &ExtractionConfig::default().model_api_url,
        ),
        model_api_key: env_or("MODEL_API_KEY", ""),
        model_name: env_or(
            "MODEL_NAME",
            &ExtractionConfig::default().model_name,
        ),
        ..ExtractionConfig::default()
    };
    let objects_config = ObjectStoreConfig {
        root: env_or("OBJECT_STORE_ROOT", "/var/lib/invoiceflow/blobs"),
    };

    let pool = connect_pool(&persistence).await?;
    let broker: Arc<dyn MessageBroker> =
        Arc::new(PostgresBroker::new(pool.clone()));
    let invoices: Arc<dyn InvoiceStore> =
        Arc::new(PostgresInvoiceStore::new(pool));
    let objects: Arc<dyn ObjectStore> =
        Arc::new(FsObjectStore::from_config(&objects_config));

    let engines: Vec<Box<dyn OcrEngine>> = vec![
        Box::new(CloudOcr::new(&extraction)?),
        Box::new(LocalOcr::new()),
    ];
    let ocr = OcrChain::new(engines, extraction.ocr_max_retries);
    let extractor = Arc::new(LlmExtractor::new(&extraction)?);

    let worker = ExtractionWorker::new(
        invoices,
        objects,
        ocr,
        extractor,
        Arc::clone(&broker),
    );

    let mut runtime = StageRuntime::new();
    runtime.trigger_on_ctrl_c();
    let consumer = Consumer::new(
        broker,
        queues::INGESTED,
        worker,
        ConsumerConfig::default(),
        runtime.shutdown_token(),
    );
    runtime.spawn_consumer(consumer);
    runtime.run_until_finished().await
}
