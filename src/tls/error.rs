//! Error types for certificate material and TLS configuration.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while minting, loading or selecting certificates.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Failed to generate a key pair.
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Failed to build the CA certificate.
    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    /// Failed to sign a host certificate with the CA.
    #[error("Failed to sign certificate: {0}")]
    Signing(String),

    /// The requested name cannot appear in a certificate.
    #[error("Invalid certificate name: {0}")]
    InvalidName(String),

    /// No certificate is configured for the alias and no CA can mint one.
    #[error("No certificate available for alias '{0}'")]
    UnknownAlias(String),

    /// Failed to read a PEM file.
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        /// File that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write a PEM file.
    #[error("Failed to write {path}: {source}")]
    WriteFile {
        /// File that could not be written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// PEM content was malformed or missing the expected item.
    #[error("Invalid PEM: {0}")]
    Pem(String),

    /// No usable trust anchors were found for upstream verification.
    #[error("No root certificates found for upstream verification")]
    NoRootCertificates,

    /// rustls rejected the configuration.
    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
}
