//! Outbound dialing.

use async_trait::async_trait;
use tether_settings::ClientSettings;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{Connector, MaybeTlsStream, connect_async_tls_with_config, tungstenite};
use tracing::{debug, warn};

use crate::errors::{Result, WsError};
use crate::transport::{Transport, map_tungstenite_error};

/// Opens a socket to the configured URL.
///
/// The client calls this for the first connect and for every reconnect
/// attempt. Tests substitute in-memory implementations.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `settings.url`, completing the upgrade handshake.
    async fn dial(&self, settings: &ClientSettings) -> Result<Transport>;
}

/// Dials over TCP (and TLS for `wss://`) with tokio-tungstenite.
#[derive(Clone, Default)]
pub struct TungsteniteDialer {
    connector: Option<Connector>,
}

impl TungsteniteDialer {
    /// Dialer that builds its `wss://` connector from `settings.tls`, or uses
    /// the built-in webpki trust roots when that is unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dialer using a pre-built TLS connector. `settings.tls` is ignored.
    pub fn with_connector(connector: Connector) -> Self {
        Self {
            connector: Some(connector),
        }
    }
}

impl std::fmt::Debug for TungsteniteDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TungsteniteDialer")
            .field("custom_connector", &self.connector.is_some())
            .finish()
    }
}

#[async_trait]
impl Dialer for TungsteniteDialer {
    async fn dial(&self, settings: &ClientSettings) -> Result<Transport> {
        let mut request = settings
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| WsError::Config(format!("invalid url {:?}: {e}", settings.url)))?;
        for (name, value) in &settings.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| WsError::Config(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| WsError::Config(format!("invalid value for header {name}: {e}")))?;
            let _ = request.headers_mut().insert(name, value);
        }
        if settings.enable_compression {
            warn!("permessage-deflate requested but not supported; dialing uncompressed");
        }

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(settings.max_message_size);
        config.max_frame_size = Some(settings.max_message_size);

        let connector = match (&self.connector, &settings.tls) {
            (Some(connector), _) => Some(connector.clone()),
            (None, Some(tls)) if settings.is_secure() => Some(super::tls::connector(tls)?),
            (None, _) => None,
        };

        let timeout = settings.dial_timeout();
        debug!(url = %settings.url, "dialing");
        let connecting = connect_async_tls_with_config(request, Some(config), true, connector);
        let (ws, _response) = match tokio::time::timeout(timeout, connecting).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(tungstenite::Error::Http(response))) => {
                let status = response.status();
                let body = response
                    .body()
                    .as_deref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                return Err(if body.is_empty() {
                    WsError::Handshake(format!("HTTP {}", status.as_u16()))
                } else {
                    WsError::Handshake(format!("HTTP {}: {}", status.as_u16(), body.trim()))
                });
            }
            Ok(Err(e)) => return Err(map_tungstenite_error(e)),
            Err(_) => return Err(WsError::DialTimeout(timeout)),
        };

        let (local_addr, remote_addr) = match ws.get_ref() {
            MaybeTlsStream::Plain(tcp) => (
                tcp.local_addr().map_or_else(|_| "unknown".to_string(), |a| a.to_string()),
                tcp.peer_addr().map_or_else(|_| settings.url.clone(), |a| a.to_string()),
            ),
            _ => ("unknown".to_string(), settings.url.clone()),
        };
        Ok(Transport::from_tungstenite(ws, local_addr, remote_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let settings = ClientSettings::for_url(format!("ws://{addr}/ws"));
        let err = TungsteniteDialer::new().dial(&settings).await.unwrap_err();
        assert_matches!(err, WsError::Transport(_));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn silent_server_hits_dial_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let settings = ClientSettings {
            dial_timeout_ms: 100,
            ..ClientSettings::for_url(format!("ws://{addr}/ws"))
        };
        let err = TungsteniteDialer::new().dial(&settings).await.unwrap_err();
        assert_matches!(err, WsError::DialTimeout(d) if d == Duration::from_millis(100));
    }

    #[tokio::test]
    async fn broken_tls_material_fails_before_dialing() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        std::fs::write(&ca, "garbage").unwrap();
        let settings = ClientSettings {
            tls: Some(tether_settings::TlsSettings {
                ca_path: Some(ca.display().to_string()),
                ..tether_settings::TlsSettings::default()
            }),
            ..ClientSettings::for_url("wss://127.0.0.1:1/ws")
        };
        let err = TungsteniteDialer::new().dial(&settings).await.unwrap_err();
        assert_matches!(err, WsError::Config(msg) if msg.contains("no certificates"));
    }

    #[tokio::test]
    async fn bad_header_is_config_error() {
        let mut settings = ClientSettings::for_url("ws://127.0.0.1:1/ws");
        let _ = settings.headers.insert("bad header".into(), "x".into());
        let err = TungsteniteDialer::new().dial(&settings).await.unwrap_err();
        assert_matches!(err, WsError::Config(_));
    }
}
