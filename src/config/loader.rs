//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. System config: `/etc/tapwire/config.toml`
//! 2. User config: `~/.config/tapwire/config.toml`
//! 3. Additional config file (via `--config` flag)
//!
//! Lists (components, certificates) are **merged** (appended).
//! Scalars (log_level, settle_delay_ms) are **overridden**.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::Config;
use crate::cli::Cli;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/tapwire/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "tapwire";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Load, merge and validate configuration from all sources.
    ///
    /// Missing system and user files are skipped. A missing `--config` file
    /// and invalid TOML are errors.
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        for path in [&self.system_path, &self.user_path] {
            if let Some(file_config) = self.load_file(path)? {
                config.merge(file_config);
                debug!("Loaded config from {:?}", path);
            } else {
                debug!("No config found at {:?}", path);
            }
        }

        if let Some(ref cli_config_path) = cli.config {
            match self.load_file(cli_config_path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    // Unlike system/user config, a missing CLI-specified config is an error
                    return Err(ConfigError::ReadError {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
