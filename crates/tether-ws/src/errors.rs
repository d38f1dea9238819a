//! Error taxonomy for the WebSocket subsystem.
//!
//! - [`WsError`]: everything a caller of `Send`, `Connect`, admission, or the
//!   retry loop can observe. Cloneable so a connection's close error can be
//!   handed to every disconnect observer.
//! - [`HandlerError`]: failures raised by application handlers and middleware.
//!   These are logged by the read loop and never close the connection.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Coarse classification used for metrics labels and log fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid URL, settings, or TLS material.
    Config,
    /// Pool full or per-address limit.
    Admission,
    /// Not connected, already connected, closed.
    State,
    /// Queue full, message too large, send/write timeout.
    Transfer,
    /// Heartbeat or read timeout.
    Liveness,
    /// Retry budget exhausted.
    Recovery,
    /// Upgrade request rejected or failed.
    Handshake,
    /// Socket-level I/O or protocol failure.
    Transport,
}

impl ErrorCategory {
    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Admission => "admission",
            Self::State => "state",
            Self::Transfer => "transfer",
            Self::Liveness => "liveness",
            Self::Recovery => "recovery",
            Self::Handshake => "handshake",
            Self::Transport => "transport",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by connections, the pool, the server, and the client.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum WsError {
    /// Invalid configuration (URL, headers, TLS material, limits).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The pool is at its global capacity.
    #[error("pool full: {max} connections")]
    PoolFull {
        /// Configured global maximum.
        max: usize,
    },

    /// The source address is at its per-address cap.
    #[error("per-address limit reached for {address}: {max} connections")]
    PerAddressLimit {
        /// Source address (IP) that hit the cap.
        address: String,
        /// Configured per-address maximum.
        max: usize,
    },

    /// The pool has been closed and admits nothing.
    #[error("pool closed")]
    PoolClosed,

    /// No live connection to delegate to.
    #[error("not connected")]
    NotConnected,

    /// A connection (or connection attempt) is already in place.
    #[error("already connected")]
    AlreadyConnected,

    /// The connection or client is closed.
    #[error("connection closed")]
    Closed,

    /// A loop was started twice on the same connection.
    #[error("{0} already running")]
    AlreadyRunning(&'static str),

    /// The bounded outbound queue has no capacity.
    #[error("send queue full")]
    QueueFull,

    /// Payload exceeds the configured maximum.
    #[error("message too large: {size} bytes exceeds limit of {limit}")]
    MessageTooLarge {
        /// Payload size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// Enqueueing did not complete in time.
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    /// A socket write did not complete before its deadline.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// Nothing was read before the read deadline.
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// The peer stopped answering liveness pings.
    #[error("heartbeat timeout: {missed} missed pongs, last pong {since:?} ago")]
    HeartbeatTimeout {
        /// Consecutive unanswered pings.
        missed: u32,
        /// Time since the last pong.
        since: Duration,
    },

    /// The reconnect budget is exhausted.
    #[error("max reconnect retries exceeded after {attempts} attempts")]
    MaxRetriesExceeded {
        /// Attempts made in this failure episode.
        attempts: u32,
    },

    /// The dial did not complete in time.
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),

    /// The upgrade request failed or was rejected.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The operation was cancelled by its owner.
    #[error("operation cancelled")]
    Cancelled,
}

impl WsError {
    /// Classification for metrics and logs.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Config,
            Self::PoolFull { .. } | Self::PerAddressLimit { .. } | Self::PoolClosed => {
                ErrorCategory::Admission
            }
            Self::NotConnected
            | Self::AlreadyConnected
            | Self::Closed
            | Self::AlreadyRunning(_)
            | Self::Cancelled => ErrorCategory::State,
            Self::QueueFull
            | Self::MessageTooLarge { .. }
            | Self::SendTimeout(_)
            | Self::WriteTimeout(_) => ErrorCategory::Transfer,
            Self::ReadTimeout(_) | Self::HeartbeatTimeout { .. } => ErrorCategory::Liveness,
            Self::MaxRetriesExceeded { .. } => ErrorCategory::Recovery,
            Self::Handshake(_) | Self::DialTimeout(_) => ErrorCategory::Handshake,
            Self::Transport(_) => ErrorCategory::Transport,
        }
    }

    /// Whether a reconnect attempt could plausibly fix this.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Handshake | ErrorCategory::Liveness
        ) || matches!(self, Self::PoolFull { .. } | Self::PerAddressLimit { .. })
    }
}

impl From<tether_settings::SettingsError> for WsError {
    fn from(err: tether_settings::SettingsError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for the WebSocket subsystem.
pub type Result<T> = std::result::Result<T, WsError>;

/// Failure raised while processing one inbound message.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A handler panicked; the panic was contained.
    #[error("handler panicked: {0}")]
    Panicked(String),
    /// The connection exceeded its message rate.
    #[error("rate limit exceeded: {limit} messages per {window:?}")]
    RateLimited {
        /// Messages allowed per window.
        limit: u32,
        /// Window length.
        window: Duration,
    },
    /// The connection is not authorized to send this message.
    #[error("unauthorized")]
    Unauthorized,
    /// The inbound message is larger than the middleware allows.
    #[error("message too large: {size} bytes exceeds limit of {limit}")]
    TooLarge {
        /// Payload size in bytes.
        size: usize,
        /// Limit in bytes.
        limit: usize,
    },
    /// The handler did not finish in time.
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
    /// A transport operation inside the handler failed.
    #[error(transparent)]
    Ws(#[from] WsError),
    /// Application-defined failure.
    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    /// Build an application-defined error from anything displayable.
    pub fn other(message: impl fmt::Display) -> Self {
        Self::Other(message.to_string())
    }

    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Panicked(_) => "panicked",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unauthorized => "unauthorized",
            Self::TooLarge { .. } => "too_large",
            Self::Timeout(_) => "timeout",
            Self::Ws(_) => "transport",
            Self::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert_eq!(WsError::PoolFull { max: 1 }.category(), ErrorCategory::Admission);
        assert_eq!(WsError::NotConnected.category(), ErrorCategory::State);
        assert_eq!(WsError::QueueFull.category(), ErrorCategory::Transfer);
        assert_eq!(
            WsError::HeartbeatTimeout {
                missed: 3,
                since: Duration::from_secs(1)
            }
            .category(),
            ErrorCategory::Liveness
        );
        assert_eq!(
            WsError::MaxRetriesExceeded { attempts: 3 }.category(),
            ErrorCategory::Recovery
        );
        assert_eq!(WsError::Handshake("403".into()).category(), ErrorCategory::Handshake);
    }

    #[test]
    fn retryable() {
        assert!(WsError::Transport("reset".into()).is_retryable());
        assert!(WsError::PoolFull { max: 1 }.is_retryable());
        assert!(!WsError::Config("bad url".into()).is_retryable());
        assert!(!WsError::Closed.is_retryable());
    }

    #[test]
    fn display_messages() {
        assert_eq!(WsError::PoolFull { max: 2 }.to_string(), "pool full: 2 connections");
        assert_eq!(
            WsError::MessageTooLarge { size: 10, limit: 4 }.to_string(),
            "message too large: 10 bytes exceeds limit of 4"
        );
        assert_eq!(
            WsError::MaxRetriesExceeded { attempts: 3 }.to_string(),
            "max reconnect retries exceeded after 3 attempts"
        );
    }

    #[test]
    fn settings_error_maps_to_config() {
        let err: WsError = tether_settings::SettingsError::InvalidValue("x".into()).into();
        assert_eq!(err.category(), ErrorCategory::Config);
    }

    #[test]
    fn handler_error_kinds() {
        assert_eq!(HandlerError::Unauthorized.kind(), "unauthorized");
        assert_eq!(HandlerError::other("boom").to_string(), "boom");
        let wrapped: HandlerError = WsError::QueueFull.into();
        assert_eq!(wrapped.kind(), "transport");
        assert_eq!(wrapped.to_string(), "send queue full");
    }

    #[test]
    fn category_labels_are_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::Admission).unwrap();
        assert_eq!(json, "\"admission\"");
        assert_eq!(ErrorCategory::Transport.to_string(), "transport");
    }
}
