//! Metrics definitions for the hub.
//!
//! All metrics follow Prometheus naming conventions:
//! - `hub_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 4 values (registry, room, connection, persister)
//! - `message_type` / `kind`: bounded by the wire type union (~16 values)
//! - `outcome`, `reason`, `cache`: 2-5 values each
//! - `store`: 2 values (redis, memory)
//!
//! Room, peer and identity ids are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// Must be called before any metrics are recorded. Message handling latency
/// targets p99 < 100ms.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("hub_message".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Room & Peer Metrics (Gauges)
// ============================================================================

/// Metric: `hub_rooms_active`
pub fn set_rooms_active(count: u64) {
    // u64 to f64 conversion is safe for realistic room counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("hub_rooms_active").set(count as f64);
}

/// Metric: `hub_peers_active`
///
/// Updated by the room actors as peers join and leave.
pub fn set_peers_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("hub_peers_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `hub_actor_mailbox_depth`
/// Labels: `actor_type`
///
/// High values indicate the actor is falling behind.
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("hub_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Message Metrics
// ============================================================================

/// Record inbound frame handling latency, from decode to fan-out.
///
/// Metric: `hub_message_latency_seconds`
/// Labels: `message_type`
pub fn record_message_latency(message_type: &str, duration: Duration) {
    histogram!("hub_message_latency_seconds", "message_type" => message_type.to_string())
        .record(duration.as_secs_f64());
}

/// Record a signaling relay attempt.
///
/// Metric: `hub_messages_relayed_total`
/// Labels: `kind` (offer, answer, ice-candidate), `outcome` (delivered, rejected)
pub fn record_signal_relayed(kind: &str, outcome: &str) {
    counter!("hub_messages_relayed_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a published chat event.
///
/// Metric: `hub_chat_events_total`
/// Labels: `kind`
pub fn record_chat_event(kind: &str) {
    counter!("hub_chat_events_total", "kind" => kind.to_string()).increment(1);
}

/// Record a frame that could not be enqueued for a peer.
///
/// Metric: `hub_deliveries_dropped_total`
/// Labels: `reason` (overflow, closed)
///
/// Each drop removes the peer from its room.
pub fn record_delivery_dropped(reason: &str) {
    counter!("hub_deliveries_dropped_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Persistence & Credential Metrics
// ============================================================================

/// Record a chat write that exhausted its retries or was never queued.
///
/// Metric: `hub_persist_failures_total`
/// Labels: `store`
///
/// Each failure leaves a sequence pending reconciliation.
pub fn record_persist_failure(store: &str) {
    counter!("hub_persist_failures_total", "store" => store.to_string()).increment(1);
}

/// Record an issued TURN credential.
///
/// Metric: `hub_turn_credentials_issued_total`
/// Labels: `cache` (hit, miss)
pub fn record_turn_credential(cache: &str) {
    counter!("hub_turn_credentials_issued_total", "cache" => cache.to_string()).increment(1);
}

// ============================================================================
// Failure Metrics
// ============================================================================

/// Record an actor panic event.
///
/// Metric: `hub_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &str) {
    counter!("hub_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Record error by category.
///
/// Metric: `hub_errors_total`
/// Labels: `operation`, `error_type`, `status_code`
pub fn record_error(operation: &str, error_type: &str, status_code: u16) {
    counter!("hub_errors_total",
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string(),
        "status_code" => status_code.to_string()
    )
    .increment(1);
}
