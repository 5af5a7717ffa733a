//! Posting stage daemon: consumes `invoice.approved`.

use std::sync::Arc;

use invoiceflow::broker::{Consumer, MessageBroker, PostgresBroker};
use invoiceflow::config::{ConsumerConfig, PersistenceConfig, PostingConfig};
use invoiceflow::event::queues;
use invoiceflow::posting::{HttpLedgerClient, LedgerClient, PostingWorker};
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
    let posting = PostingConfig {
        ledger_url: env_or("LEDGER_URL", &PostingConfig::default().ledger_url),
        ledger_token: env_or("LEDGER_TOKEN", ""),
        ..PostingConfig::default()
    };

    let pool = connect_pool(&persistence).await?;
    let broker: Arc<dyn MessageBroker> =
        Arc::new(PostgresBroker::new(pool.clone()));
    let invoices: Arc<dyn InvoiceStore> =
        Arc::new(PostgresInvoiceStore::new(pool));
    let ledger: Arc<dyn LedgerClient> =
        Arc::new(HttpLedgerClient::new(&posting)?);

    let worker =
        PostingWorker::new(invoices, ledger, Arc::clone(&broker), &posting);

    let mut runtime = StageRuntime::new();
    runtime.trigger_on_ctrl_c();
    let consumer = Consumer::new(
        broker,
        queues::APPROVED,
        worker,
        ConsumerConfig::default(),
        runtime.shutdown_token(),
    );
    runtime.spawn_consumer(consumer);
    runtime.run_until_finished().await
}
