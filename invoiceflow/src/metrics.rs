//! Prometheus instrumentation, compiled behind the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `invoiceflow_deliveries_total` - Deliveries settled, by queue and disposition
//! - `invoiceflow_match_decisions_total` - Match decisions, by decision
//! - `invoiceflow_postings_total` - Ledger posting outcomes, by status
//!
//! ## Gauges
//! - `invoiceflow_queue_depth` - Ready messages per queue
//!
//! ## Histograms
//! - `invoiceflow_delivery_duration_seconds` - Handler duration per queue
#![cfg(feature = "metrics")]

use std::sync::LazyLock;

use prometheus::{
    exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry,
};

/// Global Prometheus registry for pipeline metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for settled deliveries.
///
/// Labels:
/// - `queue`: The working queue name
/// - `disposition`: ack, requeued or dead_letter
pub static DELIVERIES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "invoiceflow_deliveries_total",
        "Total deliveries settled",
    );
    CounterVec::new(opts, &["queue", "disposition"])
        .expect("invoiceflow_deliveries_total metric creation failed")
});

/// Counter for match decisions.
///
/// Labels:
/// - `decision`: AUTO_APPROVED or NEEDS_REVIEW
pub static MATCH_DECISIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "invoiceflow_match_decisions_total",
        "Total match decisions recorded",
    );
    CounterVec::new(opts, &["decision"])
        .expect("invoiceflow_match_decisions_total metric creation failed")
});

/// Counter for ledger posting outcomes.
///
/// Labels:
/// - `status`: POSTED or POSTING_FAILED
pub static POSTINGS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "invoiceflow_postings_total",
        "Total ledger posting outcomes",
    );
    CounterVec::new(opts, &["status"])
        .expect("invoiceflow_postings_total metric creation failed")
});

/// Gauge for ready messages per queue.
pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts =
        Opts::new("invoiceflow_queue_depth", "Ready messages per queue");
    GaugeVec::new(opts, &["queue"])
        .expect("invoiceflow_queue_depth metric creation failed")
});

/// Histogram for handler duration per queue.
pub static DELIVERY_DURATION_SECONDS: LazyLock<HistogramVec> =
    LazyLock::new(|| {
        let buckets =
            exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
        let opts = prometheus::HistogramOpts::new(
            "invoiceflow_delivery_duration_seconds",
            "Delivery handling duration in seconds",
        )
        .buckets(buckets);
        HistogramVec::new(opts, &["queue"])
            .expect("invoiceflow_delivery_duration_seconds metric creation failed")
    });

/// Register every metric with the global registry. Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(DELIVERIES_TOTAL.clone())
            as Box<dyn prometheus::core::Collector>,
        Box::new(MATCH_DECISIONS_TOTAL.clone()),
        Box::new(POSTINGS_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(DELIVERY_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg
                .contains("Duplicate metrics collector registration attempted")
            {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_delivery(queue: &str, disposition: &str) {
    DELIVERIES_TOTAL
        .with_label_values(&[queue, disposition])
        .inc();
}

pub fn record_match_decision(decision: &str) {
    MATCH_DECISIONS_TOTAL.with_label_values(&[decision]).inc();
}

pub fn record_posting(status: &str) {
    POSTINGS_TOTAL.with_label_values(&[status]).inc();
}

pub fn set_queue_depth(queue: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[queue]).set(depth);
}

pub fn observe_delivery_duration(queue: &str, duration_secs: f64) {
    DELIVERY_DURATION_SECONDS
        .with_label_values(&[queue])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
