//! Configuration system for tapwire.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. System config: `/etc/tapwire/config.toml`
//! 2. User config: `~/.config/tapwire/config.toml`
//! 3. Additional config file (via `--config` flag)
//!
//! Missing system and user files are skipped; a missing `--config` file is
//! an error.
//!
//! # Merge Behavior
//!
//! - **Lists** (components, certificates) are **merged** (appended)
//! - **Scalars** (log_level, settle_delay_ms, upstream, etc.) are **overridden**
//!
//! # Components
//!
//! Proxies are declared in `[[components]]` tables:
//!
//! ```toml
//! [[components]]
//! kind = "proxy_server"
//! remote_host = "api.example.com"
//! scripts = ["file:///etc/tapwire/log_requests.rhai"]
//!
//! [components.protocol]
//! kind = "http"
//! ssl = true
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    CertificateEntry, ComponentConfig, Config, GeneralConfig, ProxyServerConfig, ScriptingConfig,
    TlsConfig,
};
