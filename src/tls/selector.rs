//! Handshake-time certificate alias selection.

use rustls::server::ClientHello;

/// What a TLS handshake exposes to certificate selection.
pub trait HandshakeSession {
    /// Server names requested by the client.
    ///
    /// `None` when the session cannot carry SNI at all.
    fn requested_server_names(&self) -> Option<Vec<String>>;
}

impl HandshakeSession for ClientHello<'_> {
    fn requested_server_names(&self) -> Option<Vec<String>> {
        Some(self.server_name().map(str::to_string).into_iter().collect())
    }
}

/// Maps a requested SNI host name to a certificate alias.
///
/// Exactly one requested name selects that name. No name, several names, or
/// a session without SNI support select the default alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSelector {
    default_alias: String,
}

impl CertificateSelector {
    /// Create a selector falling back to `default_alias`.
    pub fn new(default_alias: impl Into<String>) -> Self {
        Self {
            default_alias: default_alias.into(),
        }
    }

    /// The fallback alias.
    pub fn default_alias(&self) -> &str {
        &self.default_alias
    }

    /// Choose the alias to present for this handshake.
    pub fn select(&self, session: &dyn HandshakeSession) -> String {
        match session.requested_server_names() {
            Some(names) if names.len() == 1 => names.into_iter().next().unwrap_or_default(),
            _ => self.default_alias.clone(),
        }
    }
}
