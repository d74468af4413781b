//! Error types for components and the registry.

use crate::proxy::ProxyError;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Errors from a component's start/stop capability.
#[derive(Debug, Error)]
pub enum ComponentError {
    /// A proxy failed to start or stop.
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// Any other component failure.
    #[error("{0}")]
    Failed(String),
}

/// Errors returned by [`ComponentRegistry`](super::ComponentRegistry).
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A component with this id is already registered.
    #[error("Component {0} is already registered")]
    DuplicateId(Uuid),

    /// No component with this id is registered.
    #[error("Component {0} not found")]
    NotFound(Uuid),
}

/// Errors raised while loading a script or running one of its hooks.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The script URL uses a scheme other than `file`, `http` or `https`.
    #[error("Unsupported script URL '{0}'")]
    UnsupportedUrl(String),

    /// The script URL is malformed or names no usable location.
    #[error("Invalid script URL '{0}'")]
    InvalidUrl(String),

    /// A remote script could not be downloaded.
    #[error("Failed to fetch script {url}: {message}")]
    Fetch {
        /// Script URL.
        url: String,
        /// What went wrong.
        message: String,
    },

    /// The script file could not be read.
    #[error("Failed to read script {path}: {source}")]
    Read {
        /// Script path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The script failed to parse.
    #[error("Failed to compile {script}: {message}")]
    Compile {
        /// Script URL.
        script: String,
        /// Parser message.
        message: String,
    },

    /// Top-level evaluation or a hook raised an error.
    #[error("{script}: {hook} failed: {message}")]
    Runtime {
        /// Script URL.
        script: String,
        /// Hook or phase that failed.
        hook: String,
        /// Script error message.
        message: String,
    },

    /// The event could not be converted for the script.
    #[error("Failed to project event: {0}")]
    Projection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_id_display() {
        let id = Uuid::nil();
        let err = RegistryError::DuplicateId(id);
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_runtime_error_display() {
        let err = ScriptError::Runtime {
            script: "file:///tmp/a.rhai".to_string(),
            hook: "on_message".to_string(),
            message: "boom".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("on_message"));
        assert!(msg.contains("boom"));
    }
}
