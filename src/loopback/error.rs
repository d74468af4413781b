//! Error types for loopback alias management.

use thiserror::Error;

/// Errors raised while adding or removing a loopback alias.
///
/// Every variant is treated as a privilege failure by the proxy: fatal when
/// starting a route, logged and swallowed when stopping one.
#[derive(Debug, Error)]
pub enum AliasError {
    /// The alias command could not be spawned at all.
    #[error("Failed to run '{cmd}': {source}")]
    CommandFailed {
        /// The command line that was attempted.
        cmd: String,
        /// The underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The alias command ran but exited unsuccessfully.
    #[error("'{cmd}' failed: {stderr}")]
    CommandError {
        /// The command line that failed.
        cmd: String,
        /// Captured standard error output.
        stderr: String,
    },

    /// The current platform has no alias implementation.
    #[error("Loopback aliasing is not supported on {0}")]
    Unsupported(&'static str),

    /// The blocking task running the command was cancelled or panicked.
    #[error("Alias task failed: {0}")]
    Task(String),

    /// Injected failure (test doubles).
    #[error("Alias operation rejected: {0}")]
    Rejected(String),
}
