//! Queue metrics, recorded through the `metrics` facade.
//!
//! Nothing is exported unless the host process installs a recorder.

use metrics::{counter, gauge, histogram};

use crate::registry::RequestStatus;

/// Record a request entering `status`.
pub fn request_status_changed(status: RequestStatus) {
    counter!("ci_queue_requests_total", "status" => status.as_str()).increment(1);
}

/// Set current queued and active totals.
pub fn queue_depth(queued: usize, active: usize) {
    gauge!("ci_queue_queued").set(queued as f64);
    gauge!("ci_queue_active").set(active as f64);
}

/// Record an activation pass.
pub fn activation_pass(duration_ms: u64, activated: usize) {
    histogram!("ci_queue_activation_pass_ms").record(duration_ms as f64);
    counter!("ci_queue_activations_total").increment(activated as u64);
}
