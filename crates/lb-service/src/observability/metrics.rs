//! Metrics definitions for the load balancer.
//!
//! Naming follows Prometheus conventions:
//! - `lb_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `method`: HTTP methods
//! - `endpoint`: the fixed route table, everything else is `/other`
//! - `status`: small fixed vocabularies per metric
//! - `to`: the three server health states
//!
//! Server ids are deliberately not used as labels; per-server detail is in
//! the logs and the admin status view.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used by the
/// `/metrics` endpoint.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("lb_http_request".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set HTTP request buckets: {e}"))?
        // Bounded above by the poll timeout
        .set_buckets_for_metric(
            Matcher::Prefix("lb_poll".to_string()),
            &[0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000],
        )
        .map_err(|e| format!("Failed to set poll buckets: {e}"))?
        // Selection is in-memory; anything above a millisecond is contention
        .set_buckets_for_metric(
            Matcher::Prefix("lb_selection".to_string()),
            &[0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.010],
        )
        .map_err(|e| format!("Failed to set selection buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("lb_backend_create".to_string()),
            &[0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000],
        )
        .map_err(|e| format!("Failed to set backend create buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("lb_db_query".to_string()),
            &[0.001, 0.002, 0.005, 0.010, 0.020, 0.050, 0.100, 0.250, 0.500, 1.000],
        )
        .map_err(|e| format!("Failed to set DB query buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

// ============================================================================
// HTTP Request Metrics
// ============================================================================

/// Record HTTP request completion.
///
/// Metric: `lb_http_requests_total`, `lb_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status`
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let normalized_endpoint = normalize_endpoint(endpoint);
    let status = categorize_status_code(status_code);

    histogram!("lb_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("lb_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

fn normalize_endpoint(path: &str) -> &'static str {
    match path {
        "/health" => "/health",
        "/ready" => "/ready",
        "/metrics" => "/metrics",
        "/bigbluebutton/api" | "/bigbluebutton/api/" => "/bigbluebutton/api",
        "/bigbluebutton/api/create" => "/bigbluebutton/api/create",
        "/bbblb/api/v1/recordings/upload" => "/bbblb/api/v1/recordings/upload",
        _ if path.starts_with("/bigbluebutton/api/") => "/bigbluebutton/api/{call}",
        _ => "/other",
    }
}

// ============================================================================
// Poller Metrics
// ============================================================================

/// Record one backend poll.
///
/// Metric: `lb_polls_total`, `lb_poll_duration_seconds`
/// Labels: `status` (success, error, timeout)
pub fn record_poll(status: &str, duration: Duration) {
    histogram!("lb_poll_duration_seconds",
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("lb_polls_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a server health state change.
///
/// Metric: `lb_server_health_transitions_total`
/// Labels: `to` (unknown, healthy, unreachable)
pub fn record_health_transition(to: &str) {
    counter!("lb_server_health_transitions_total",
        "to" => to.to_string()
    )
    .increment(1);
}

/// Set the number of servers currently in each health state.
///
/// Metric: `lb_servers`
/// Labels: `health`
pub fn set_servers(health: &str, count: usize) {
    gauge!("lb_servers",
        "health" => health.to_string()
    )
    .set(count as f64);
}

// ============================================================================
// Selection and Meeting Metrics
// ============================================================================

/// Record a load balancer selection.
///
/// Metric: `lb_selections_total`, `lb_selection_duration_seconds`
/// Labels: `status` (success, no_server)
pub fn record_selection(status: &str, duration: Duration) {
    histogram!("lb_selection_duration_seconds").record(duration.as_secs_f64());

    counter!("lb_selections_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a rejected API checksum.
///
/// Metric: `lb_checksum_failures_total`
pub fn record_checksum_failure() {
    counter!("lb_checksum_failures_total").increment(1);
}

/// Record the outcome of a create call.
///
/// Metric: `lb_meetings_created_total`
/// Labels: `status` (created, reused, backend_failed, error)
pub fn record_meeting_created(status: &str) {
    counter!("lb_meetings_created_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a forwarded backend create call.
///
/// Metric: `lb_backend_create_duration_seconds`
/// Labels: `status` (success, failed, error)
pub fn record_backend_create(status: &str, duration: Duration) {
    histogram!("lb_backend_create_duration_seconds",
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set the number of open meetings tracked in memory.
///
/// Metric: `lb_open_meetings`
pub fn set_open_meetings(count: usize) {
    gauge!("lb_open_meetings").set(count as f64);
}

// ============================================================================
// Database Metrics
// ============================================================================

/// Record a store query.
///
/// Metric: `lb_db_query_duration_seconds`, `lb_db_queries_total`
/// Labels: `operation`, `status`
pub fn record_db_query(operation: &str, status: &str, duration: Duration) {
    histogram!("lb_db_query_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("lb_db_queries_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

// ============================================================================
// Recording Metrics
// ============================================================================

/// Record the outcome of a recording upload.
///
/// Metric: `lb_recording_uploads_total`
/// Labels: `status` (accepted, or the error kind of a rejected upload)
pub fn record_recording_upload(status: &str) {
    counter!("lb_recording_uploads_total",
        "status" => status.to_string()
    )
    .increment(1);
}
