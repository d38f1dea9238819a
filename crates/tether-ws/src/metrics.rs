//! Metric names recorded through the `metrics` facade.
//!
//! The composing application installs the recorder; nothing here exports.

use metrics::counter;

use crate::errors::WsError;

// Metric name constants to avoid typos across crates.

/// Connections established total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Connections closed total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Admission rejections total (counter, labels: reason).
pub const WS_ADMISSION_REJECTED_TOTAL: &str = "ws_admission_rejected_total";
/// Messages written to sockets (counter).
pub const WS_MESSAGES_SENT_TOTAL: &str = "ws_messages_sent_total";
/// Data messages read from sockets (counter).
pub const WS_MESSAGES_RECEIVED_TOTAL: &str = "ws_messages_received_total";
/// Payload bytes written (counter).
pub const WS_BYTES_SENT_TOTAL: &str = "ws_bytes_sent_total";
/// Payload bytes read (counter).
pub const WS_BYTES_RECEIVED_TOTAL: &str = "ws_bytes_received_total";
/// Non-blocking sends rejected because the queue was full (counter).
pub const WS_SEND_QUEUE_FULL_TOTAL: &str = "ws_send_queue_full_total";
/// Fan-out deliveries skipped for slow subscribers (counter).
pub const WS_SUBSCRIBER_DROPS_TOTAL: &str = "ws_subscriber_drops_total";
/// Handler failures (counter, labels: kind).
pub const WS_HANDLER_ERRORS_TOTAL: &str = "ws_handler_errors_total";
/// Unanswered liveness pings (counter).
pub const WS_HEARTBEAT_MISSED_TOTAL: &str = "ws_heartbeat_missed_total";
/// Heartbeat timeouts declared (counter).
pub const WS_HEARTBEAT_TIMEOUTS_TOTAL: &str = "ws_heartbeat_timeouts_total";
/// Reconnect dials attempted (counter).
pub const WS_RECONNECT_ATTEMPTS_TOTAL: &str = "ws_reconnect_attempts_total";
/// Reconnect episodes that ended connected (counter).
pub const WS_RECONNECT_SUCCESS_TOTAL: &str = "ws_reconnect_success_total";
/// Reconnect episodes that exhausted their budget (counter).
pub const WS_RECONNECT_FAILURES_TOTAL: &str = "ws_reconnect_failures_total";
/// Errors observed by category (counter, labels: category).
pub const WS_ERRORS_TOTAL: &str = "ws_errors_total";

/// Count `err` under its category label.
pub fn record_error(err: &WsError) {
    counter!(WS_ERRORS_TOTAL, "category" => err.category().as_str()).increment(1);
}
