//! Settings type definitions.
//!
//! Every struct uses `#[serde(rename_all = "camelCase", default)]`, so a
//! settings file only needs to name the values it changes.

mod client;
mod server;

pub use client::{ClientSettings, HeartbeatSettings, ReconnectSettings, TlsSettings};
pub use server::{PoolSettings, ServerSettings};

use serde::{Deserialize, Serialize};

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Root settings document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Server-side settings.
    pub server: ServerSettings,
    /// Client-side settings.
    pub client: ClientSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}
