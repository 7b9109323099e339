//! Structured logging for the pipeline.
//!
//! One global subscriber, installed once at startup, plus a span helper so
//! every pipeline operation logs under a consistent shape.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs the global tracing subscriber.
///
/// `json` selects machine-readable output for deployed instances; pass
/// `false` for human-readable output during development. Only the first
/// call installs anything, so tests and embedding applications may call
/// this freely.
///
/// Filtering honors `RUST_LOG` when set; otherwise everything logs at
/// `info` with the pipeline crates raised to `debug`.
pub fn init_logging(json: bool) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,tally_core=debug,tally_flow=debug"));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false);
        if json {
            builder.json().init();
        } else {
            builder.init();
        }
    });
}

/// Creates a span for a reduce-pipeline operation with standard fields.
///
/// # Example
///
/// ```rust
/// use tally_core::observability::pipeline_span;
///
/// let span = pipeline_span("play", "org-1");
/// let _guard = span.enter();
/// // ... run the operation
/// ```
#[must_use]
pub fn pipeline_span(operation: &str, group: &str) -> Span {
    tracing::info_span!("pipeline", op = operation, group = group)
}
