//! TLS interception.
//!
//! This module provides:
//! - [`CertificateSelector`]: picks a certificate alias from the handshake's SNI
//! - [`CertificateStore`]: configured certificates plus CA-minted ones, by alias
//! - [`CertificateAuthority`]: in-memory CA that signs host certificates
//! - [`upstream_connector`]: client TLS for the re-encryption leg
//!
//! # Example
//!
//! ```ignore
//! use tapwire::tls::{server_acceptor, CertificateAuthority, CertificateSelector, CertificateStore};
//! use std::sync::Arc;
//!
//! let ca = Arc::new(CertificateAuthority::generate()?);
//! let store = Arc::new(CertificateStore::new(Some(ca)));
//! let acceptor = server_acceptor(CertificateSelector::new("api.example.com"), store);
//! ```

mod ca;
mod error;
mod selector;
mod store;
mod upstream;

pub use ca::{CertificateAuthority, IssuedCertificate};
pub use error::TlsError;
pub use selector::{CertificateSelector, HandshakeSession};
pub use store::{server_acceptor, CertificateStore, SniCertResolver};
pub use upstream::{server_name, upstream_connector, UpstreamTrust};
