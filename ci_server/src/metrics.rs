//! Prometheus metrics for CI server observability.
//!
//! Queue-level counters and gauges are recorded by `ci_queue` itself; the
//! exporter installed here publishes both.

use std::net::SocketAddr;

use metrics::{counter, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics(port: u16) {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)));
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a build request received through the API.
pub fn trigger_received(source: &str) {
    counter!("ci_triggers_received_total", "source" => source.to_string()).increment(1);
}

/// Record a build reaching a final state.
pub fn build_finished(state: &str) {
    counter!("ci_builds_total", "state" => state.to_string()).increment(1);
}

/// Record build duration.
pub fn build_duration(duration_ms: u64) {
    histogram!("ci_build_duration_ms").record(duration_ms as f64);
}

/// Record an error occurrence.
pub fn error_recorded(category: &str) {
    counter!("ci_errors_total", "category" => category.to_string()).increment(1);
}
