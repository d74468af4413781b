//! Error types for proxy operations.
//!
//! This module defines structured error types for the relay:
//! - Route errors (resolution, half-specified local address)
//! - Lifecycle errors (double start, bind, loopback alias)
//! - Connection errors (handshake, backend establishment, oversized messages)

use crate::loopback::AliasError;
use crate::tls::TlsError;
use thiserror::Error;

/// Errors raised while resolving a [`ConnectionRoute`](super::ConnectionRoute).
#[derive(Debug, Error)]
pub enum RouteError {
    /// Only one of `local_host` / `local_port` was given.
    #[error("Route {0}: local_host and local_port must be set together")]
    HalfSpecifiedLocal(uuid::Uuid),

    /// Host name lookup failed.
    #[error("Failed to resolve '{host}': {source}")]
    Resolve {
        /// The host being resolved.
        host: String,
        /// The underlying lookup error.
        #[source]
        source: std::io::Error,
    },

    /// The host resolved to no address.
    #[error("'{0}' did not resolve to any address")]
    NoAddress(String),

    /// The host resolved to more than one distinct address.
    #[error("'{host}' resolved to {count} addresses; exactly one is required")]
    AmbiguousRemote {
        /// The host being resolved.
        host: String,
        /// How many distinct addresses were returned.
        count: usize,
    },
}

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// The route could not be resolved.
    #[error(transparent)]
    Route(#[from] RouteError),

    /// `start()` was called while a listener is starting or running.
    #[error("Proxy {0} is already running")]
    AlreadyRunning(uuid::Uuid),

    /// Binding the listening socket failed.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// The address we tried to bind.
        addr: std::net::SocketAddr,
        /// The underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// Adding or removing the loopback alias failed.
    #[error("Loopback alias failed: {0}")]
    Alias(#[from] AliasError),

    /// Certificate material or TLS configuration is missing or invalid.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// A TLS binding was started without the material it needs.
    #[error("TLS unavailable: {0}")]
    TlsUnavailable(String),

    /// The client-facing TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// The backend connection to the remote could not be established.
    #[error("Failed to connect to remote '{addr}': {message}")]
    RelayEstablishment {
        /// The remote we tried to reach.
        addr: String,
        /// Error message.
        message: String,
    },

    /// An aggregated message exceeded the size cap.
    #[error("Message exceeds {limit} bytes")]
    OversizedMessage {
        /// The cap that was exceeded.
        limit: usize,
    },

    /// Failed to build a relayed message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A background task failed to complete.
    #[error("Task failed: {0}")]
    Task(String),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<tokio::task::JoinError> for ProxyError {
    fn from(err: tokio::task::JoinError) -> Self {
        ProxyError::Task(err.to_string())
    }
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        ProxyError::InvalidMessage(err.to_string())
    }
}

impl ProxyError {
    /// Whether this error is a routine peer disconnect.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            ProxyError::Http(e) => e.is_incomplete_message() || e.is_canceled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_establishment_error() {
        let err = ProxyError::RelayEstablishment {
            addr: "api.example.com:443".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("api.example.com:443"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_oversized_message_error() {
        let err = ProxyError::OversizedMessage { limit: 1024 };
        assert!(err.to_string().contains("1024"));
    }

    #[test]
    fn test_ambiguous_remote_error() {
        let err = RouteError::AmbiguousRemote {
            host: "multi.example.com".to_string(),
            count: 2,
        };
        let proxy_err: ProxyError = err.into();
        assert!(proxy_err.to_string().contains("multi.example.com"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let proxy_err: ProxyError = io_err.into();
        assert!(matches!(proxy_err, ProxyError::Io(_)));
        assert!(!proxy_err.is_disconnect());
    }

    #[test]
    fn test_reset_is_disconnect() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(ProxyError::from(io_err).is_disconnect());
    }
}
