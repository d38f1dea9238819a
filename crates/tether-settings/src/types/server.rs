//! Server-side socket, timeout, and admission settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Admission limits for the server connection pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolSettings {
    /// Maximum number of live connections.
    pub max_connections: usize,
    /// Maximum number of live connections from one source address.
    pub max_per_address: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_per_address: 100,
        }
    }
}

/// WebSocket server settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` auto-assigns).
    pub port: u16,
    /// Route that accepts upgrade requests.
    pub path: String,
    /// Socket read buffer size in bytes.
    pub read_buffer_size: usize,
    /// Socket write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Largest inbound or outbound message in bytes.
    pub max_message_size: usize,
    /// Upper bound on the upgrade request in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Read deadline in milliseconds; `0` disables it.
    pub read_timeout_ms: u64,
    /// Per-write deadline in milliseconds.
    pub write_timeout_ms: u64,
    /// Close a connection that has not answered a ping for this long.
    pub pong_timeout_ms: u64,
    /// Interval between server pings in milliseconds.
    pub ping_interval_ms: u64,
    /// Request permessage-deflate.
    pub enable_compression: bool,
    /// Compression level (1–9) when compression is enabled.
    pub compression_level: u32,
    /// Admission limits.
    pub pool: PoolSettings,
    /// Outbound queue capacity per connection.
    pub send_queue_size: usize,
    /// Capacity of each subscriber queue.
    pub receive_queue_size: usize,
    /// Allowed `Origin` header values; empty allows any origin.
    pub allowed_origins: Vec<String>,
    /// How long shutdown waits for connection tasks before aborting them.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            path: "/ws".to_string(),
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            max_message_size: 512 * 1024,
            handshake_timeout_ms: 10_000,
            read_timeout_ms: 60_000,
            write_timeout_ms: 10_000,
            pong_timeout_ms: 60_000,
            ping_interval_ms: 54_000,
            enable_compression: false,
            compression_level: 1,
            pool: PoolSettings::default(),
            send_queue_size: 256,
            receive_queue_size: 256,
            allowed_origins: Vec::new(),
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl ServerSettings {
    /// `host:port` string suitable for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Read deadline, `None` when disabled.
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    /// Write deadline as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Pong timeout as a [`Duration`].
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    /// Ping interval as a [`Duration`].
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Shutdown timeout as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Reject settings that would make the server unusable.
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server path must start with '/', got {:?}",
                self.path
            )));
        }
        if self.pool.max_connections == 0 || self.pool.max_per_address == 0 {
            return Err(SettingsError::InvalidValue(
                "pool limits must be greater than zero".into(),
            ));
        }
        if self.send_queue_size == 0 || self.receive_queue_size == 0 {
            return Err(SettingsError::InvalidValue(
                "queue sizes must be greater than zero".into(),
            ));
        }
        if self.ping_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "ping interval must be greater than zero".into(),
            ));
        }
        if self.enable_compression && !(1..=9).contains(&self.compression_level) {
            return Err(SettingsError::InvalidValue(format!(
                "compression level must be within 1..=9, got {}",
                self.compression_level
            )));
        }
        Ok(())
    }
}
