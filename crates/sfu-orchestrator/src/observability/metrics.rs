//! Metrics definitions for the SFU orchestrator.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `request_type`: bounded by signaling request types (~20 values)
//! - `status`: success, error
//! - `error_type`: bounded by `SfuError::kind()` (~11 values)
//! - `channel`: instance, channel
//! - `resource`: producer, consumer
//! - `outcome`: bounded by spawn-near-inviter outcomes (5 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling round trips include engine calls (p99 < 250ms)
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_signaling".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        // Queued pause/resume wait plus engine call
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_queue".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500,
            ],
        )
        .map_err(|e| format!("Failed to set queue latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Session Gauges
// ============================================================================

/// Set the number of registered peers.
///
/// Metric: `sfu_peers_active`
pub fn set_peers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_peers_active").set(count as f64);
}

/// Metric: `sfu_transports_active`
pub fn set_transports_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_transports_active").set(count as f64);
}

/// Metric: `sfu_producers_active`
pub fn set_producers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_producers_active").set(count as f64);
}

/// Metric: `sfu_consumers_active`
pub fn set_consumers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_consumers_active").set(count as f64);
}

// ============================================================================
// Signaling
// ============================================================================

/// Record one handled signaling request.
///
/// Metrics: `sfu_signaling_request_duration_seconds`, `sfu_signaling_requests_total`
/// Labels: `request_type`, `status`
pub fn record_signaling_request(request_type: &str, status: &str, duration: Duration) {
    histogram!(
        "sfu_signaling_request_duration_seconds",
        "request_type" => request_type.to_string(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());

    counter!(
        "sfu_signaling_requests_total",
        "request_type" => request_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a signaling error by kind.
///
/// Metric: `sfu_errors_total`
/// Labels: `request_type`, `error_type`
pub fn record_error(request_type: &str, error_type: &str) {
    counter!(
        "sfu_errors_total",
        "request_type" => request_type.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a server push dropped because the peer's outbound mailbox was full.
///
/// Metric: `sfu_pushes_dropped_total`
pub fn record_push_dropped() {
    counter!("sfu_pushes_dropped_total").increment(1);
}

// ============================================================================
// Resources
// ============================================================================

/// Record a router selection.
///
/// Metric: `sfu_router_selections_total`
/// Labels: `channel` (instance, channel)
pub fn record_router_selection(channel: &str) {
    counter!("sfu_router_selections_total", "channel" => channel.to_string()).increment(1);
}

/// Record time spent by a pause/resume in the per-resource queue, including the engine call.
///
/// Metric: `sfu_queue_operation_duration_seconds`
/// Labels: `resource` (producer, consumer)
pub fn record_queue_operation(resource: &str, duration: Duration) {
    histogram!(
        "sfu_queue_operation_duration_seconds",
        "resource" => resource.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an inbound data message dropped because the queue was full.
///
/// Metric: `sfu_inbound_data_dropped_total`
pub fn record_inbound_dropped() {
    counter!("sfu_inbound_data_dropped_total").increment(1);
}

/// Record the outcome of a spawn-near-inviter attempt.
///
/// Metric: `sfu_spawn_near_inviter_total`
/// Labels: `outcome`
pub fn record_spawn_outcome(outcome: &str) {
    counter!("sfu_spawn_near_inviter_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record engine events missed because the event pump lagged.
///
/// Metric: `sfu_engine_events_skipped_total`
pub fn record_engine_events_skipped(skipped: u64) {
    counter!("sfu_engine_events_skipped_total").increment(skipped);
}

/// Record a peer disconnected by the liveness sweep.
///
/// Metric: `sfu_peers_expired_total`
pub fn record_peer_expired() {
    counter!("sfu_peers_expired_total").increment(1);
}
