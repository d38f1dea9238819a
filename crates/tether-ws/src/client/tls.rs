//! rustls client configuration from [`TlsSettings`].

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tether_settings::TlsSettings;
use tokio_tungstenite::Connector;
use tracing::warn;

use crate::errors::{Result, WsError};

static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

fn tls_error(what: &str, e: impl std::fmt::Display) -> WsError {
    WsError::Config(format!("tls {what}: {e}"))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(Path::new(path))
        .map_err(|e| tls_error(path, e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(path, e))?;
    if certs.is_empty() {
        return Err(tls_error(path, "no certificates found"));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(Path::new(path)).map_err(|e| tls_error(path, e))
}

/// Build a rustls [`Connector`] from the configured trust anchors, client
/// identity, minimum version, and verification mode.
///
/// The webpki roots are always trusted; `ca_path` adds to them.
pub fn connector(settings: &TlsSettings) -> Result<Connector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(ca) = &settings.ca_path {
        for cert in load_certs(ca)? {
            roots.add(cert).map_err(|e| tls_error(ca, e))?;
        }
    }

    let versions = match settings.min_version.as_deref() {
        Some("1.3") => TLS13_ONLY,
        None | Some("1.2") => rustls::ALL_VERSIONS,
        Some(other) => return Err(tls_error("min version", format!("unsupported {other:?}"))),
    };
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(versions)
        .map_err(|e| tls_error("protocol versions", e))?
        .with_root_certificates(roots);

    let mut config = match (&settings.cert_path, &settings.key_path) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| tls_error("client identity", e))?,
        (None, None) => builder.with_no_client_auth(),
        _ => return Err(tls_error("client identity", "cert and key must be set together")),
    };

    if settings.insecure_skip_verify {
        warn!("TLS server certificate verification disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(SkipServerVerification(provider)));
    }
    Ok(Connector::Rustls(Arc::new(config)))
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
