//! Tracing helpers shared by the stage binaries and the consumer loop.

use tracing::{info_span, Span};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins; `info` otherwise.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Span wrapping the handling of one delivery. The correlation id rides on
/// every log line a handler emits.
pub fn delivery_span(queue: &str, correlation_id: &str) -> Span {
    info_span!("delivery", queue = %queue, correlation_id = %correlation_id)
}
