//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Connections**: accepted, rejected and active client connections
//! - **Protocol**: commands by kind, malformed lines, lines sent by type
//! - **Back-pressure**: record lines dropped and gap notices sent
//! - **Store**: fetch errors and fetch latency
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::application::services::DisconnectReason;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if another global recorder is already installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Connections
    describe_counter!(
        "iqfeed_replay_connections_accepted_total",
        "Total client connections accepted"
    );
    describe_counter!(
        "iqfeed_replay_connections_rejected_total",
        "Total client connections rejected by reason"
    );
    describe_gauge!(
        "iqfeed_replay_active_connections",
        "Number of connected clients"
    );
    describe_counter!(
        "iqfeed_replay_sessions_closed_total",
        "Total sessions closed by reason"
    );
    describe_histogram!(
        "iqfeed_replay_session_duration_seconds",
        "Client session lifetime"
    );

    // Protocol
    describe_counter!(
        "iqfeed_replay_commands_total",
        "Total client commands by kind"
    );
    describe_counter!(
        "iqfeed_replay_protocol_errors_total",
        "Total malformed client lines"
    );
    describe_counter!(
        "iqfeed_replay_lines_sent_total",
        "Total lines written to clients by message type"
    );

    // Back-pressure
    describe_counter!(
        "iqfeed_replay_records_dropped_total",
        "Total record lines evicted from slow client queues"
    );
    describe_counter!(
        "iqfeed_replay_gaps_total",
        "Total gap notices sent to clients"
    );

    // Store
    describe_counter!(
        "iqfeed_replay_store_errors_total",
        "Total history store fetch failures"
    );
    describe_histogram!(
        "iqfeed_replay_store_fetch_seconds",
        "History store fetch latency"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for rejected connections.
#[derive(Debug, Clone, Copy)]
pub enum RejectReason {
    /// Connection limit reached.
    ServerBusy,
    /// Accept failed at the socket level.
    AcceptError,
}

impl RejectReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::ServerBusy => "server_busy",
            Self::AcceptError => "accept_error",
        }
    }
}

/// Record an accepted client connection.
pub fn record_connection_accepted() {
    counter!("iqfeed_replay_connections_accepted_total").increment(1);
}

/// Record a rejected client connection.
pub fn record_connection_rejected(reason: RejectReason) {
    counter!(
        "iqfeed_replay_connections_rejected_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Update the connected client count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_connections(count: usize) {
    gauge!("iqfeed_replay_active_connections").set(count as f64);
}

/// Record a finished session.
pub fn record_session_closed(reason: DisconnectReason, lifetime: Duration) {
    counter!(
        "iqfeed_replay_sessions_closed_total",
        "reason" => reason.as_str()
    )
    .increment(1);
    histogram!("iqfeed_replay_session_duration_seconds").record(lifetime.as_secs_f64());
}

/// Record a parsed client command.
pub fn record_command(command: &'static str) {
    counter!("iqfeed_replay_commands_total", "command" => command).increment(1);
}

/// Record a malformed client line.
pub fn record_protocol_error() {
    counter!("iqfeed_replay_protocol_errors_total").increment(1);
}

/// Record a line written to a client.
pub fn record_line_sent(message_type: &'static str) {
    counter!(
        "iqfeed_replay_lines_sent_total",
        "message_type" => message_type
    )
    .increment(1);
}

/// Record record lines evicted from a client queue.
pub fn record_records_dropped(count: u64) {
    counter!("iqfeed_replay_records_dropped_total").increment(count);
}

/// Record a gap notice sent to a client.
pub fn record_gap() {
    counter!("iqfeed_replay_gaps_total").increment(1);
}

/// Record a history store fetch.
pub fn record_store_fetch(store: &'static str, duration: Duration, ok: bool) {
    histogram!("iqfeed_replay_store_fetch_seconds", "store" => store)
        .record(duration.as_secs_f64());
    if !ok {
        counter!("iqfeed_replay_store_errors_total", "store" => store).increment(1);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reason_as_str() {
        assert_eq!(RejectReason::ServerBusy.as_str(), "server_busy");
        assert_eq!(RejectReason::AcceptError.as_str(), "accept_error");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_connection_accepted();
        record_line_sent("status");
        record_store_fetch("memory", Duration::from_millis(3), false);
        set_active_connections(2);
    }
}
