//! Client dial, liveness, and reconnect settings.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::BackoffPolicy;
use url::Url;

use crate::errors::{Result, SettingsError};

/// Liveness probing for an outbound connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Run the heartbeat loop at all.
    pub enable: bool,
    /// Interval between pings in milliseconds.
    pub interval_ms: u64,
    /// Declare timeout when no pong arrived for this long; `0` disables the check.
    pub timeout_ms: u64,
    /// Declare timeout after this many consecutive unanswered pings; `0` disables the check.
    pub max_miss_count: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enable: true,
            interval_ms: 30_000,
            timeout_ms: 90_000,
            max_miss_count: 3,
        }
    }
}

impl HeartbeatSettings {
    /// Ping interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Silence timeout, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// Automatic reconnection policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    /// Reconnect automatically after an unexpected disconnect.
    pub enable: bool,
    /// Attempt budget per failure episode; `0` retries forever.
    pub max_retries: u32,
    /// First retry delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
    /// Proportional jitter (0.0–1.0).
    pub random_factor: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enable: true,
            max_retries: 0,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            random_factor: 0.1,
        }
    }
}

impl ReconnectSettings {
    /// Backoff policy described by these settings.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter_factor: self.random_factor,
        }
    }
}

/// TLS material for `wss://` targets.
///
/// Only existence is checked here; the dialer parses the PEM files each time
/// it builds a connector.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsSettings {
    /// Client certificate (PEM).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<String>,
    /// Client private key (PEM).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    /// Extra trust anchor (PEM).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_path: Option<String>,
    /// Minimum protocol version (`"1.2"` or `"1.3"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    /// Skip server certificate verification.
    pub insecure_skip_verify: bool,
}

impl TlsSettings {
    /// Check that every configured file exists and the version is known.
    pub fn validate(&self) -> Result<()> {
        for (kind, path) in [
            ("cert", &self.cert_path),
            ("key", &self.key_path),
            ("ca", &self.ca_path),
        ] {
            if let Some(path) = path {
                if !Path::new(path).exists() {
                    return Err(SettingsError::MissingTlsMaterial {
                        kind,
                        path: path.clone(),
                    });
                }
            }
        }
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(SettingsError::InvalidValue(
                "TLS cert and key must be configured together".into(),
            ));
        }
        if let Some(v) = &self.min_version {
            if v != "1.2" && v != "1.3" {
                return Err(SettingsError::InvalidValue(format!(
                    "unsupported TLS min version {v:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Outbound client settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Target `ws://` or `wss://` URL.
    pub url: String,
    /// Dial (TCP + TLS + upgrade) timeout in milliseconds.
    pub dial_timeout_ms: u64,
    /// Read deadline in milliseconds; `0` disables it.
    pub read_timeout_ms: u64,
    /// Per-write deadline in milliseconds.
    pub write_timeout_ms: u64,
    /// Largest inbound or outbound message in bytes.
    pub max_message_size: usize,
    /// Liveness probing.
    pub heartbeat: HeartbeatSettings,
    /// Automatic reconnection.
    pub reconnect: ReconnectSettings,
    /// Request permessage-deflate.
    pub enable_compression: bool,
    /// Extra headers sent with the upgrade request.
    pub headers: BTreeMap<String, String>,
    /// Outbound queue capacity.
    pub send_queue_size: usize,
    /// Pull-queue capacity for `Client::recv` consumers.
    pub receive_queue_size: usize,
    /// TLS material for `wss://`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSettings>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            dial_timeout_ms: 10_000,
            read_timeout_ms: 60_000,
            write_timeout_ms: 10_000,
            max_message_size: 512 * 1024,
            heartbeat: HeartbeatSettings::default(),
            reconnect: ReconnectSettings::default(),
            enable_compression: false,
            headers: BTreeMap::new(),
            send_queue_size: 256,
            receive_queue_size: 256,
            tls: None,
        }
    }
}

impl ClientSettings {
    /// Settings targeting `url` with every other value at its default.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Dial timeout as a [`Duration`].
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Read deadline, `None` when disabled.
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    /// Write deadline as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Whether the target uses TLS.
    pub fn is_secure(&self) -> bool {
        Url::parse(&self.url).is_ok_and(|u| u.scheme() == "wss")
    }

    /// Reject unusable URLs, queue sizes, backoff, and TLS material.
    pub fn validate(&self) -> Result<()> {
        validate_url(&self.url)?;
        if self.send_queue_size == 0 || self.receive_queue_size == 0 {
            return Err(SettingsError::InvalidValue(
                "queue sizes must be greater than zero".into(),
            ));
        }
        if self.heartbeat.enable && self.heartbeat.interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeat interval must be greater than zero".into(),
            ));
        }
        self.reconnect
            .backoff()
            .validate()
            .map_err(|e| SettingsError::InvalidValue(e.to_string()))?;
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }
}

fn validate_url(raw: &str) -> Result<()> {
    let invalid = |reason: String| SettingsError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(invalid(format!("scheme must be ws or wss, got {}", url.scheme())));
    }
    // The parser folds `ws:///path` into host `path`; keep an empty authority an error.
    let authority = raw.split_once("://").map_or("", |(_, rest)| rest);
    if authority.starts_with('/') || !url.host_str().is_some_and(|h| !h.is_empty()) {
        return Err(invalid("missing host".into()));
    }
    if url.port_or_known_default().is_none() {
        return Err(invalid("missing port".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_validate() {
        let s = ClientSettings::default();
        assert!(s.validate().is_ok());
        assert!(s.heartbeat.enable);
        assert_eq!(s.heartbeat.max_miss_count, 3);
        assert!(s.reconnect.enable);
        assert_eq!(s.reconnect.max_retries, 0);
        assert!(!s.is_secure());
    }

    #[test]
    fn rejects_http_scheme() {
        let s = ClientSettings::for_url("http://example.com/ws");
        assert_matches!(s.validate(), Err(SettingsError::InvalidUrl { .. }));
    }

    #[test]
    fn rejects_missing_host() {
        let s = ClientSettings::for_url("ws:///ws");
        assert_matches!(s.validate(), Err(SettingsError::InvalidUrl { .. }));
    }

    #[test]
    fn rejects_malformed_authority() {
        for url in [
            "ws://host:notaport/ws",
            "ws://host:99999/ws",
            "ws://[::1/ws",
            "ws://@/x",
            "ws://%%%/",
            "ws://exa mple.com/ws",
        ] {
            let s = ClientSettings::for_url(url);
            assert_matches!(
                s.validate(),
                Err(SettingsError::InvalidUrl { .. }),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn accepts_ipv6_and_default_port() {
        assert!(ClientSettings::for_url("ws://[::1]:9000/ws").validate().is_ok());
        assert!(ClientSettings::for_url("ws://example.com").validate().is_ok());
        assert!(ClientSettings::for_url("WSS://example.com/ws").is_secure());
    }

    #[test]
    fn accepts_wss_with_query() {
        let s = ClientSettings::for_url("wss://example.com:443/ws?token=abc");
        assert!(s.validate().is_ok());
        assert!(s.is_secure());
    }

    #[test]
    fn rejects_missing_tls_file() {
        let s = ClientSettings {
            tls: Some(TlsSettings {
                ca_path: Some("/definitely/not/here.pem".into()),
                ..TlsSettings::default()
            }),
            ..ClientSettings::for_url("wss://example.com/ws")
        };
        assert_matches!(
            s.validate(),
            Err(SettingsError::MissingTlsMaterial { kind: "ca", .. })
        );
    }

    #[test]
    fn accepts_existing_tls_files() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "cert").unwrap();
        std::fs::write(&key, "key").unwrap();
        let tls = TlsSettings {
            cert_path: Some(cert.display().to_string()),
            key_path: Some(key.display().to_string()),
            min_version: Some("1.3".into()),
            ..TlsSettings::default()
        };
        assert!(tls.validate().is_ok());
    }

    #[test]
    fn rejects_cert_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        std::fs::write(&cert, "cert").unwrap();
        let tls = TlsSettings {
            cert_path: Some(cert.display().to_string()),
            ..TlsSettings::default()
        };
        assert_matches!(tls.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn reconnect_backoff_mapping() {
        let r = ReconnectSettings {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            random_factor: 0.0,
            ..ReconnectSettings::default()
        };
        let p = r.backoff();
        assert_eq!(p.initial_delay, Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn rejects_shrinking_backoff() {
        let s = ClientSettings {
            reconnect: ReconnectSettings {
                multiplier: 0.5,
                ..ReconnectSettings::default()
            },
            ..ClientSettings::default()
        };
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn heartbeat_zero_timeout_disables() {
        let h = HeartbeatSettings {
            timeout_ms: 0,
            ..HeartbeatSettings::default()
        };
        assert!(h.timeout().is_none());
        assert_eq!(h.interval(), Duration::from_secs(30));
    }

    #[test]
    fn headers_deserialize() {
        let s: ClientSettings =
            serde_json::from_str(r#"{"headers":{"Authorization":"Bearer x"}}"#).unwrap();
        assert_eq!(s.headers.get("Authorization").map(String::as_str), Some("Bearer x"));
    }
}
