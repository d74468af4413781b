//! Ephemeral certificate authority for minting host certificates.
//!
//! A fresh CA key pair is generated at startup and kept in memory only.
//! Host certificates are short-lived (24 hours) ECDSA P-384 leaves signed by
//! it. Clients that should accept intercepted TLS must trust the CA
//! certificate, which can be exported with [`CertificateAuthority::write_cert`].

use super::error::TlsError;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType,
};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

/// Validity period for the CA and every host certificate.
const CERT_VALIDITY_DAYS: i64 = 1;

/// In-memory CA used to impersonate arbitrary hosts.
pub struct CertificateAuthority {
    key_pair: KeyPair,
    params: CertificateParams,
    cert_pem: String,
}

/// A host certificate and its private key, PEM encoded.
pub struct IssuedCertificate {
    /// Leaf certificate.
    pub cert_pem: String,
    /// PKCS#8 private key.
    pub key_pem: String,
}

impl CertificateAuthority {
    /// Generate a new CA.
    pub fn generate() -> Result<Self, TlsError> {
        info!("Generating ephemeral CA certificate");

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| TlsError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String("tapwire Interception CA".to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("tapwire".to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(CERT_VALIDITY_DAYS);

        let cert = params
            .clone()
            .self_signed(&key_pair)
            .map_err(|e| TlsError::CertGeneration(e.to_string()))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pair,
            params,
        })
    }

    /// CA certificate as PEM.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Export the CA certificate so clients can add it to their trust store.
    pub fn write_cert(&self, path: &Path) -> Result<(), TlsError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| TlsError::WriteFile {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, &self.cert_pem).map_err(|source| TlsError::WriteFile {
            path: path.to_path_buf(),
            source,
        })?;
        info!("CA certificate written to {:?}", path);
        Ok(())
    }

    /// Issue a certificate for one host name or IP address.
    pub fn issue(&self, name: &str) -> Result<IssuedCertificate, TlsError> {
        if name.is_empty() {
            return Err(TlsError::InvalidName(name.to_string()));
        }

        debug!("Issuing certificate for {}", name);

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| TlsError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(name.to_string()));
        params.distinguished_name = dn;
        params.subject_alt_names = vec![subject_alt_name(name)?];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(CERT_VALIDITY_DAYS);

        let issuer = Issuer::from_params(&self.params, &self.key_pair);
        let cert = params
            .signed_by(&key_pair, &issuer)
            .map_err(|e| TlsError::Signing(e.to_string()))?;

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

fn subject_alt_name(name: &str) -> Result<SanType, TlsError> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let dns = name
        .to_string()
        .try_into()
        .map_err(|_| TlsError::InvalidName(name.to_string()))?;
    Ok(SanType::DnsName(dns))
}
