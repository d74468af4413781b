//! Alias-keyed certificate store.

use super::ca::CertificateAuthority;
use super::error::TlsError;
use super::selector::CertificateSelector;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, trace};

/// Certificates by alias.
///
/// Statically loaded certificates take precedence. Any other alias is minted
/// on demand by the CA, when one is configured, and cached
/// case-insensitively.
pub struct CertificateStore {
    configured: HashMap<String, Arc<CertifiedKey>>,
    minted: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    ca: Option<Arc<CertificateAuthority>>,
}

impl CertificateStore {
    /// Create a store that mints unknown aliases with `ca`.
    pub fn new(ca: Option<Arc<CertificateAuthority>>) -> Self {
        Self {
            configured: HashMap::new(),
            minted: RwLock::new(HashMap::new()),
            ca,
        }
    }

    /// Register a certificate chain and key under `alias`.
    pub fn insert_pem(&mut self, alias: &str, cert_pem: &[u8], key_pem: &[u8]) -> Result<(), TlsError> {
        let key = certified_key_from_pem(cert_pem, key_pem)?;
        self.configured.insert(alias.to_lowercase(), Arc::new(key));
        Ok(())
    }

    /// Load a certificate chain and key from PEM files.
    pub fn load_files(&mut self, alias: &str, cert_path: &Path, key_path: &Path) -> Result<(), TlsError> {
        let cert_pem = fs::read(cert_path).map_err(|source| TlsError::ReadFile {
            path: cert_path.to_path_buf(),
            source,
        })?;
        let key_pem = fs::read(key_path).map_err(|source| TlsError::ReadFile {
            path: key_path.to_path_buf(),
            source,
        })?;
        self.insert_pem(alias, &cert_pem, &key_pem)?;
        debug!("Loaded certificate '{}' from {:?}", alias, cert_path);
        Ok(())
    }

    /// Look up or mint the certificate for `alias`.
    pub fn resolve(&self, alias: &str) -> Result<Arc<CertifiedKey>, TlsError> {
        let alias_lower = alias.to_lowercase();

        if let Some(key) = self.configured.get(&alias_lower) {
            return Ok(key.clone());
        }

        {
            let minted = self.minted.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(key) = minted.get(&alias_lower) {
                trace!("Certificate cache hit for {}", alias);
                return Ok(key.clone());
            }
        }

        let ca = self
            .ca
            .as_ref()
            .ok_or_else(|| TlsError::UnknownAlias(alias.to_string()))?;
        let issued = ca.issue(&alias_lower)?;
        let key = Arc::new(certified_key_from_pem(
            issued.cert_pem.as_bytes(),
            issued.key_pem.as_bytes(),
        )?);

        let mut minted = self.minted.write().unwrap_or_else(PoisonError::into_inner);
        Ok(minted.entry(alias_lower).or_insert(key).clone())
    }

    /// Number of statically configured certificates.
    pub fn configured_len(&self) -> usize {
        self.configured.len()
    }

    /// Number of certificates minted so far.
    pub fn minted_len(&self) -> usize {
        self.minted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey, TlsError> {
    let cert_chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Pem(format!("Failed to parse certificate: {}", e)))?;

    if cert_chain.is_empty() {
        return Err(TlsError::Pem("No certificates found".into()));
    }

    let private_key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| TlsError::Pem(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| TlsError::Pem("No private key found".into()))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)?;

    Ok(CertifiedKey::new(cert_chain, signing_key))
}

/// rustls resolver combining a [`CertificateSelector`] with a store.
pub struct SniCertResolver {
    selector: CertificateSelector,
    store: Arc<CertificateStore>,
}

impl SniCertResolver {
    /// Create a resolver.
    pub fn new(selector: CertificateSelector, store: Arc<CertificateStore>) -> Self {
        Self { selector, store }
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let alias = self.selector.select(&client_hello);
        trace!("Resolving certificate alias {}", alias);

        match self.store.resolve(&alias) {
            Ok(key) => Some(key),
            Err(e) => {
                error!("No certificate for alias {}: {}", alias, e);
                None
            }
        }
    }
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertResolver")
            .field("default_alias", &self.selector.default_alias())
            .field("configured", &self.store.configured_len())
            .field("minted", &self.store.minted_len())
            .finish()
    }
}

/// Build the acceptor for the client-facing TLS leg.
///
/// ALPN is pinned to `http/1.1`: the relay only speaks HTTP/1.1 framing.
pub fn server_acceptor(selector: CertificateSelector, store: Arc<CertificateStore>) -> TlsAcceptor {
    let resolver = Arc::new(SniCertResolver::new(selector, store));

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    TlsAcceptor::from(Arc::new(config))
}
