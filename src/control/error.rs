//! Error types for the control API.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised while running the control API.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The API listener could not be bound.
    #[error("Failed to bind control API on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Socket-level failure after binding.
    #[error("Control API I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_names_address() {
        let err = ControlError::Bind {
            addr: "127.0.0.1:8080".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().contains("127.0.0.1:8080"));
    }
}
