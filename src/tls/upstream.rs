//! Client-side TLS for the re-encryption leg.

use super::error::TlsError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// How the proxy verifies the real remote's certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamTrust {
    /// System root certificates.
    #[default]
    Native,
    /// Only the certificates in a PEM bundle.
    Bundle(PathBuf),
    /// Accept any server certificate.
    AcceptAny,
}

/// Build the connector used for upstream TLS.
pub fn upstream_connector(trust: &UpstreamTrust) -> Result<TlsConnector, TlsError> {
    let config = match trust {
        UpstreamTrust::Native => ClientConfig::builder()
            .with_root_certificates(native_roots()?)
            .with_no_client_auth(),
        UpstreamTrust::Bundle(path) => ClientConfig::builder()
            .with_root_certificates(bundle_roots(path)?)
            .with_no_client_auth(),
        UpstreamTrust::AcceptAny => {
            warn!("Upstream certificate verification is disabled");
            let provider = rustls::crypto::aws_lc_rs::default_provider();
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(provider)))
                .with_no_client_auth()
        }
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Convert a host name or IP literal to a TLS server name.
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(host.to_string()).map_err(|_| TlsError::InvalidName(host.to_string()))
}

fn native_roots() -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();
    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }
    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if root_store.is_empty() {
        return Err(TlsError::NoRootCertificates);
    }

    debug!("Loaded {} root certificates", root_store.len());
    Ok(root_store)
}

fn bundle_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let pem = fs::read(path).map_err(|source| TlsError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;

    let mut root_store = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        let cert = cert.map_err(|e| TlsError::Pem(format!("{}: {}", path.display(), e)))?;
        root_store.add(cert)?;
    }

    if root_store.is_empty() {
        return Err(TlsError::NoRootCertificates);
    }
    Ok(root_store)
}

/// Verifier that trusts every server certificate.
///
/// Handshake signatures are still checked so the session keys belong to
/// whoever presented the certificate.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: CryptoProvider,
}

impl AcceptAnyServerCert {
    fn new(provider: CryptoProvider) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::CertificateAuthority;

    #[test]
    fn test_trust_deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            upstream: UpstreamTrust,
        }

        let native: Wrapper = toml::from_str(r#"upstream = "native""#).unwrap();
        assert_eq!(native.upstream, UpstreamTrust::Native);

        let any: Wrapper = toml::from_str(r#"upstream = "accept_any""#).unwrap();
        assert_eq!(any.upstream, UpstreamTrust::AcceptAny);

        let bundle: Wrapper = toml::from_str(r#"upstream = { bundle = "/etc/ca.pem" }"#).unwrap();
        assert_eq!(bundle.upstream, UpstreamTrust::Bundle(PathBuf::from("/etc/ca.pem")));
    }

    #[test]
    fn test_accept_any_connector() {
        assert!(upstream_connector(&UpstreamTrust::AcceptAny).is_ok());
    }

    #[test]
    fn test_bundle_connector() {
        let ca = CertificateAuthority::generate().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.pem");
        std::fs::write(&path, ca.cert_pem()).unwrap();

        assert!(upstream_connector(&UpstreamTrust::Bundle(path)).is_ok());
    }

    #[test]
    fn test_empty_bundle_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "").unwrap();

        assert!(matches!(
            upstream_connector(&UpstreamTrust::Bundle(path)),
            Err(TlsError::NoRootCertificates)
        ));
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("api.example.com").is_ok());
        assert!(server_name("10.0.0.5").is_ok());
        assert!(server_name("bad name").is_err());
    }
}
