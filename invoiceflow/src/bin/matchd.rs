//! Matching stage daemon: consumes `invoice.extracted`.

use std::sync::Arc;

use invoiceflow::broker::{Consumer, MessageBroker, PostgresBroker};
use invoiceflow::config::{
    ConsumerConfig, MatchingConfig, PersistenceConfig,
};
use invoiceflow::event::queues;
use invoiceflow::matching::MatchingWorker;
use invoiceflow::runtime::StageRuntime;
use invoiceflow::store::postgres::connect_pool;
use invoiceflow::store::{
    InvoiceStore, PostgresInvoiceStore, PostgresPurchaseOrderStore,
    PurchaseOrderStore,
};
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
    let mut matching = MatchingConfig::default();
    if let Ok(raw) = std::env::var("MATCH_TOLERANCE") {
        matching.tolerance_fraction = raw
            .parse()
            .map_err(|err| anyhow::anyhow!("bad MATCH_TOLERANCE: {err}"))?;
    }

    let pool = connect_pool(&persistence).await?;
    let broker: Arc<dyn MessageBroker> =
        Arc::new(PostgresBroker::new(pool.clone()));
    let invoices: Arc<dyn InvoiceStore> =
        Arc::new(PostgresInvoiceStore::new(pool.clone()));
    let purchase_orders: Arc<dyn PurchaseOrderStore> =
        Arc::new(PostgresPurchaseOrderStore::new(pool));

    let worker = MatchingWorker::new(
        invoices,
        purchase_orders,
        Arc::clone(&broker),
        &matching,
    );

    let mut runtime = StageRuntime::new();
    runtime.trigger_on_ctrl_c();
    let consumer = Consumer::new(
        broker,
        queues::EXTRACTED,
        worker,
        ConsumerConfig::default(),
        runtime.shutdown_token(),
    );
    runtime.spawn_consumer(consumer);
    runtime.run_until_finished().await
}
