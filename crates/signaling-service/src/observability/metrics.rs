//! Metric recording helpers.
//!
//! Naming follows Prometheus conventions: `sig_` prefix, `_total` for
//! counters, `_seconds` for duration histograms. Recording is a no-op until
//! [`init_metrics_recorder`] installs a recorder, so tests need no setup.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle `/metrics` renders.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Shared store round trips (p99 target 10ms)
        .set_buckets_for_metric(
            Matcher::Prefix("sig_store".to_string()),
            &[0.001, 0.002, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.000],
        )
        .map_err(|e| format!("Failed to set store latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("sig_http".to_string()),
            &[0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000],
        )
        .map_err(|e| format!("Failed to set HTTP latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

#[allow(clippy::cast_precision_loss)]
pub fn set_rooms_active(count: usize) {
    gauge!("sig_rooms_active").set(count as f64);
}

#[allow(clippy::cast_precision_loss)]
pub fn set_participants_active(count: usize) {
    gauge!("sig_participants_active").set(count as f64);
}

pub fn increment_connections_active() {
    gauge!("sig_connections_active").increment(1.0);
}

pub fn decrement_connections_active() {
    gauge!("sig_connections_active").decrement(1.0);
}

/// Backpressure indicator for the registry actor.
#[allow(clippy::cast_precision_loss)]
pub fn set_registry_mailbox_depth(depth: usize) {
    gauge!("sig_registry_mailbox_depth").set(depth as f64);
}

// ============================================================================
// Counters
// ============================================================================

/// `outcome`: ok, rejected, invalid, rate_limited.
pub fn record_relay_message(message_type: &'static str, outcome: &'static str) {
    counter!("sig_relay_messages_total", "type" => message_type, "outcome" => outcome)
        .increment(1);
}

/// `outcome`: joined, room_not_found, room_full, not_local, forbidden.
pub fn record_join(outcome: &'static str) {
    counter!("sig_joins_total", "outcome" => outcome).increment(1);
}

pub fn record_rooms_reaped(count: usize) {
    counter!("sig_rooms_reaped_total").increment(count as u64);
}

/// A notification could not be queued for a slow connection.
pub fn record_outbox_dropped() {
    counter!("sig_outbox_dropped_total").increment(1);
}

/// `outcome`: success, invalid.
pub fn record_token_verification(outcome: &'static str) {
    counter!("sig_token_verifications_total", "outcome" => outcome).increment(1);
}

/// `outcome`: allowed, rejected, store_error.
pub fn record_rate_limit_decision(class: &'static str, outcome: &'static str) {
    counter!("sig_rate_limit_decisions_total", "class" => class, "outcome" => outcome)
        .increment(1);
}

/// `direction`: published, received, ignored.
pub fn record_event_bus_event(event: &'static str, direction: &'static str) {
    counter!("sig_event_bus_events_total", "event" => event, "direction" => direction)
        .increment(1);
}

// ============================================================================
// Histograms
// ============================================================================

pub fn record_store_latency(operation: &'static str, duration: Duration) {
    histogram!("sig_store_latency_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

pub fn record_http_request(method: String, status: u16, duration: Duration) {
    histogram!(
        "sig_http_request_duration_seconds",
        "method" => method,
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());
}
