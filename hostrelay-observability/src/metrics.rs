//! Prometheus metrics for the relay

use prometheus::{
    Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

static METRICS: OnceLock<RelayMetrics> = OnceLock::new();

const STREAM_OPEN_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0];

/// Relay counters, gauges and histograms, registered in their own registry
#[derive(Debug, Clone)]
pub struct RelayMetrics {
    registry: Registry,
    /// Tunnel handshakes by outcome (`accepted`, `rejected`)
    pub handshakes: IntCounterVec,
    /// Public requests by outcome (`ok`, `directory_miss`, `unresponsive`, `error`)
    pub relay_requests: IntCounterVec,
    pub active_sessions: IntGauge,
    pub active_controls: IntGauge,
    /// Time from control message to the client's stream arriving
    pub stream_open_seconds: Histogram,
}

impl RelayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let handshakes = IntCounterVec::new(
            Opts::new("hostrelay_handshakes_total", "Tunnel handshakes by outcome"),
            &["outcome"],
        )?;
        let relay_requests = IntCounterVec::new(
            Opts::new("hostrelay_relay_requests_total", "Relayed public requests by outcome"),
            &["outcome"],
        )?;
        let active_sessions = IntGauge::new("hostrelay_active_sessions", "Registered tunnel sessions")?;
        let active_controls = IntGauge::new(
            "hostrelay_active_control_channels",
            "Registered control channels",
        )?;
        let stream_open_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "hostrelay_stream_open_seconds",
                "Latency between requesting and receiving a relay stream",
            )
            .buckets(STREAM_OPEN_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(handshakes.clone()))?;
        registry.register(Box::new(relay_requests.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(active_controls.clone()))?;
        registry.register(Box::new(stream_open_seconds.clone()))?;

        Ok(Self {
            registry,
            handshakes,
            relay_requests,
            active_sessions,
            active_controls,
            stream_open_seconds,
        })
    }

    pub fn record_handshake(&self, accepted: bool) {
        let outcome = if accepted { "accepted" } else { "rejected" };
        self.handshakes.with_label_values(&[outcome]).inc();
    }

    pub fn record_relay(&self, outcome: &str) {
        self.relay_requests.with_label_values(&[outcome]).inc();
    }

    pub fn observe_stream_open(&self, elapsed: Duration) {
        self.stream_open_seconds.observe(elapsed.as_secs_f64());
    }

    /// Render the text exposition format
    pub fn render(&self) -> String {
        match TextEncoder::new().encode_to_string(&self.registry.gather()) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Failed to encode metrics: {}", e);
                String::new()
            }
        }
    }
}

/// Install the global metrics. Idempotent.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if METRICS.get().is_none() {
        let _ = METRICS.set(RelayMetrics::new()?);
    }
    Ok(())
}

pub fn metrics_enabled() -> bool {
    METRICS.get().is_some()
}

/// The global metrics, once [`init_metrics`] has run
pub fn relay_metrics() -> Option<&'static RelayMetrics> {
    METRICS.get()
}

/// Text exposition of the global metrics; empty before [`init_metrics`]
pub fn gather_metrics() -> String {
    METRICS.get().map(RelayMetrics::render).unwrap_or_default()
}

/// Router serving `GET /metrics`
#[cfg(feature = "axum")]
pub fn metrics_router() -> axum::Router {
    axum::Router::new().route("/metrics", axum::routing::get(|| async { gather_metrics() }))
}
