//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the file that couldn't be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse a TOML configuration file.
    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the file that couldn't be parsed.
        path: PathBuf,
        /// The underlying TOML parse error.
        source: toml::de::Error,
    },

    /// A configuration value is invalid.
    #[error("Invalid config value for {field}: {message}")]
    InvalidValue {
        /// The field name that has an invalid value.
        field: String,
        /// Description of why the value is invalid.
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_value_names_field() {
        let err = ConfigError::invalid("components[0].local_port", "set without local_host");
        let msg = err.to_string();
        assert!(msg.contains("components[0].local_port"));
        assert!(msg.contains("without local_host"));
    }
}
