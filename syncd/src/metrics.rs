//! Prometheus metrics for the daemon.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};

pub static SESSION_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "syncd_session_events_total",
        "Session lifecycle events",
        &["event"]
    )
    .expect("failed to define a metric")
});

pub static AUTO_SYNC_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "syncd_auto_sync_runs_total",
        "Automatic syncs scheduled, by outcome",
        &["outcome"]
    )
    .expect("failed to define a metric")
});

pub static PRESENCE_EDGES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "syncd_presence_edges_total",
        "Transport availability edges",
        &["transport", "direction"]
    )
    .expect("failed to define a metric")
});

pub static CONNECTION_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "syncd_connection_failures_total",
        "Connections that ended in FAILED, by reason class",
        &["reason"]
    )
    .expect("failed to define a metric")
});

/// Render all registered metrics in the text exposition format.
pub fn gather() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
