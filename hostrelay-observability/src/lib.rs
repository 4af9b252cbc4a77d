pub mod metrics;
pub mod tracing;

pub use metrics::{gather_metrics, init_metrics, metrics_enabled, relay_metrics, RelayMetrics};
pub use self::tracing::{init_logging, init_tracing, shutdown_tracing, TracingConfig};

#[cfg(feature = "axum")]
pub use metrics::metrics_router;

/// Minimal logging setup without metrics or OpenTelemetry infrastructure
pub fn init_minimal_logging() {
    init_logging("info", false);
}
