//! Metrics definitions for the messaging core.
//!
//! All metrics follow Prometheus naming conventions:
//! - `roomcast_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Dynamic namespaces are unbounded, so the `nsp` label carries the parent
//! namespace name for children of a parent namespace. Static namespaces are
//! registered by application code and use their own name. Remaining labels
//! are bounded by code:
//! - `outcome`: accepted, rejected / completed, timed_out
//! - `kind`: plain, ack
//! - `event`: persisted, restored, expired, missing, error
//! - `reason`: bounded by `DisconnectReason`

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a tokio runtime, before any metric is recorded.
///
/// # Errors
///
/// Returns error if the recorder cannot be installed (e.g., already installed).
pub fn init_metrics_recorder(bind_address: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(bind_address)
        // Recovery reads one key and a list, like a DB query
        .set_buckets_for_metric(
            Matcher::Prefix("roomcast_session_restore".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set session restore buckets: {e}"))?
        .install()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Connection lifecycle
// ============================================================================

/// Namespace connection attempt outcome (`accepted`, `rejected`).
pub fn record_connection(outcome: &'static str) {
    counter!("roomcast_connections_total", "outcome" => outcome).increment(1);
}

/// Active sockets per namespace label.
pub fn record_socket_connected(nsp: &str) {
    gauge!("roomcast_sockets_active", "nsp" => nsp.to_string()).increment(1.0);
}

pub fn record_socket_disconnected(nsp: &str, reason: &'static str) {
    gauge!("roomcast_sockets_active", "nsp" => nsp.to_string()).decrement(1.0);
    counter!("roomcast_disconnections_total", "reason" => reason).increment(1);
}

pub fn set_namespaces_active(count: usize) {
    gauge!("roomcast_namespaces_active").set(count as f64);
}

// ============================================================================
// Broadcast & acknowledgements
// ============================================================================

/// Broadcast issued through an adapter (`plain`, `ack`).
pub fn record_broadcast(kind: &'static str, recipients: usize) {
    counter!("roomcast_broadcasts_total", "kind" => kind).increment(1);
    histogram!("roomcast_broadcast_recipients").record(recipients as f64);
}

/// A write to one recipient failed; delivery to the others continued.
pub fn record_delivery_failure() {
    counter!("roomcast_delivery_failures_total").increment(1);
}

/// Ack request resolution (`completed`, `timed_out`).
pub fn record_ack_outcome(outcome: &'static str) {
    counter!("roomcast_ack_requests_total", "outcome" => outcome).increment(1);
}

// ============================================================================
// Connection-state recovery
// ============================================================================

/// Session store event (`persisted`, `restored`, `expired`, `missing`, `error`).
pub fn record_session_event(event: &'static str) {
    counter!("roomcast_sessions_total", "event" => event).increment(1);
}

pub fn record_missed_packets_buffered(count: usize) {
    counter!("roomcast_missed_packets_total").increment(count as u64);
}

pub fn record_session_restore_duration(duration: Duration) {
    histogram!("roomcast_session_restore_duration_seconds").record(duration.as_secs_f64());
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // Without an installed recorder these go to the global no-op recorder,
    // which is enough to execute every recording path.

    #[test]
    fn test_record_connection() {
        record_connection("accepted");
        record_connection("rejected");
    }

    #[test]
    fn test_socket_gauge_helpers() {
        record_socket_connected("/");
        record_socket_disconnected("/", "transport close");
        set_namespaces_active(0);
        set_namespaces_active(12);
    }

    #[test]
    fn test_broadcast_and_ack_helpers() {
        record_broadcast("plain", 0);
        record_broadcast("ack", 250);
        record_delivery_failure();
        record_ack_outcome("completed");
        record_ack_outcome("timed_out");
    }

    #[test]
    fn test_session_helpers() {
        for event in ["persisted", "restored", "expired", "missing", "error"] {
            record_session_event(event);
        }
        record_missed_packets_buffered(3);
        record_session_restore_duration(Duration::from_millis(4));
    }

    #[test]
    fn test_metrics_are_captured_by_recorder() {
        use metrics_util::debugging::{DebugValue, DebuggingRecorder};

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_connection("accepted");
            record_socket_connected("/chat");
            record_socket_connected("/chat");
            record_socket_connected("/_0");
            record_broadcast("plain", 2);
            record_ack_outcome("completed");
            record_session_event("persisted");
            record_missed_packets_buffered(1);
            record_session_restore_duration(Duration::from_millis(1));
        });

        let metrics = snapshotter.snapshot().into_vec();

        let chat_sockets = metrics.iter().find_map(|(key, _, _, value)| {
            let labelled_chat = key.key().name() == "roomcast_sockets_active"
                && key.key().labels().any(|l| l.key() == "nsp" && l.value() == "/chat");
            match value {
                DebugValue::Gauge(v) if labelled_chat => Some(v.into_inner()),
                _ => None,
            }
        });
        assert_eq!(chat_sockets, Some(2.0));
        let names: Vec<String> = metrics
            .iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();

        for expected in [
            "roomcast_connections_total",
            "roomcast_sockets_active",
            "roomcast_broadcasts_total",
            "roomcast_ack_requests_total",
            "roomcast_sessions_total",
            "roomcast_missed_packets_total",
            "roomcast_session_restore_duration_seconds",
        ] {
            assert!(
                names.iter().any(|n| n == expected),
                "missing metric {expected}, got {names:?}"
            );
        }
    }
}
