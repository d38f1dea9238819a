//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `TETHER_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::TetherSettings;

/// Resolve the settings file path.
///
/// `TETHER_CONFIG` wins; otherwise `~/.tether/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Ok(path) = std::env::var("TETHER_CONFIG") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TETHER_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    apply_overrides_with(settings, |key| std::env::var(key).ok());
}

/// Apply overrides using `lookup` as the variable source.
///
/// Invalid or out-of-range values are ignored (the file/default value stays).
pub fn apply_overrides_with(settings: &mut TetherSettings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let u64_in = |key: &str, min: u64, max: u64| string(key).and_then(|v| parse_u64_range(&v, min, max));
    let usize_in = |key: &str, min: usize, max: usize| {
        string(key).and_then(|v| parse_usize_range(&v, min, max))
    };
    let boolean = |key: &str| string(key).and_then(|v| parse_bool(&v));

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = string("TETHER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = string("TETHER_PORT").and_then(|v| parse_u16_range(&v, 0, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = string("TETHER_PATH").filter(|p| p.starts_with('/')) {
        settings.server.path = v;
    }
    if let Some(v) = usize_in("TETHER_MAX_CONNECTIONS", 1, 10_000_000) {
        settings.server.pool.max_connections = v;
    }
    if let Some(v) = usize_in("TETHER_MAX_PER_ADDRESS", 1, 10_000_000) {
        settings.server.pool.max_per_address = v;
    }
    if let Some(v) = usize_in("TETHER_MAX_MESSAGE_SIZE", 1, 1 << 30) {
        settings.server.max_message_size = v;
        settings.client.max_message_size = v;
    }
    if let Some(v) = u64_in("TETHER_PING_INTERVAL_MS", 100, 3_600_000) {
        settings.server.ping_interval_ms = v;
    }
    if let Some(v) = u64_in("TETHER_PONG_TIMEOUT_MS", 100, 3_600_000) {
        settings.server.pong_timeout_ms = v;
    }

    // ── Client ──────────────────────────────────────────────────────
    if let Some(v) = string("TETHER_URL") {
        settings.client.url = v;
    }
    if let Some(v) = u64_in("TETHER_DIAL_TIMEOUT_MS", 1, 600_000) {
        settings.client.dial_timeout_ms = v;
    }
    if let Some(v) = boolean("TETHER_HEARTBEAT") {
        settings.client.heartbeat.enable = v;
    }
    if let Some(v) = u64_in("TETHER_HEARTBEAT_INTERVAL_MS", 100, 3_600_000) {
        settings.client.heartbeat.interval_ms = v;
    }
    if let Some(v) = boolean("TETHER_RECONNECT") {
        settings.client.reconnect.enable = v;
    }
    if let Some(v) = string("TETHER_MAX_RETRIES").and_then(|v| v.parse::<u32>().ok()) {
        settings.client.reconnect.max_retries = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = boolean("TETHER_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
