//! Configuration schema definitions.
//!
//! This module defines the structure of the tapwire configuration files.
//! Every scalar is optional so that a later file only overrides what it
//! names; accessor methods apply the defaults.

use crate::component::{ScriptLimits, DEFAULT_MAX_CALL_LEVELS, DEFAULT_MAX_OPERATIONS};
use crate::proxy::{ConnectionRoute, HttpBinding, ProtocolBinding, DEFAULT_SETTLE_DELAY};
use crate::tls::UpstreamTrust;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use super::error::ConfigError;

/// Log levels accepted by `general.log_level`.
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Certificate material and upstream trust.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Script engine limits.
    #[serde(default)]
    pub scripting: ScriptingConfig,

    /// Configured components, in declaration order.
    #[serde(default)]
    pub components: Vec<ComponentConfig>,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Lists (components, certificates) are merged (appended).
    /// Scalars are overridden when the other config sets them.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.tls.merge(other.tls);
        self.scripting.merge(other.scripting);
        self.components.extend(other.components);
    }

    /// Check every value that deserialization alone cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.scripting.validate()?;

        let mut ids = HashSet::new();
        for (index, component) in self.components.iter().enumerate() {
            let ComponentConfig::ProxyServer(proxy) = component;
            proxy.route(index)?;
            if let Some(id) = proxy.id
                && !ids.insert(id)
            {
                return Err(ConfigError::invalid(
                    format!("components[{}].id", index),
                    format!("duplicate component id {}", id),
                ));
            }
        }
        Ok(())
    }

    /// Whether any configured proxy terminates TLS toward clients.
    pub fn needs_server_certificates(&self) -> bool {
        self.components.iter().any(|component| {
            let ComponentConfig::ProxyServer(proxy) = component;
            matches!(&proxy.protocol, ProtocolBinding::Http(http) if http.ssl)
        })
    }

    /// Whether any configured proxy uses TLS toward the remote.
    pub fn needs_upstream_tls(&self) -> bool {
        self.components.iter().any(|component| {
            let ComponentConfig::ProxyServer(proxy) = component;
            matches!(&proxy.protocol, ProtocolBinding::Http(http) if http.upstream_ssl())
        })
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub log_level: Option<String>,

    /// Delay between adding a loopback alias and binding it, in milliseconds.
    #[serde(default)]
    pub settle_delay_ms: Option<u64>,

    /// Worker threads of the runtime; tokio's default when unset.
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Prefix for alias commands, e.g. `["sudo", "-n"]`.
    ///
    /// Treated as a single value: a later file replaces it.
    #[serde(default)]
    pub elevation: Option<Vec<String>>,

    /// Address of the HTTP control API; disabled when unset.
    #[serde(default)]
    pub control_addr: Option<SocketAddr>,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if other.log_level.is_some() {
            self.log_level = other.log_level;
        }
        if other.settle_delay_ms.is_some() {
            self.settle_delay_ms = other.settle_delay_ms;
        }
        if other.worker_threads.is_some() {
            self.worker_threads = other.worker_threads;
        }
        if other.elevation.is_some() {
            self.elevation = other.elevation;
        }
        if other.control_addr.is_some() {
            self.control_addr = other.control_addr;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(level) = &self.log_level
            && !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str())
        {
            return Err(ConfigError::invalid(
                "general.log_level",
                format!("'{}' is not one of {:?}", level, LOG_LEVELS),
            ));
        }
        if self.worker_threads == Some(0) {
            return Err(ConfigError::invalid("general.worker_threads", "must be at least 1"));
        }
        Ok(())
    }

    /// Effective settle delay.
    pub fn settle_delay(&self) -> Duration {
        self.settle_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SETTLE_DELAY)
    }
}

/// A statically configured certificate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CertificateEntry {
    /// Alias (usually a host name) the certificate is served for.
    pub alias: String,
    /// PEM certificate chain.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
}

/// TLS settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TlsConfig {
    /// Mint certificates for unknown aliases with an ephemeral CA.
    #[serde(default)]
    pub mint: Option<bool>,

    /// Where to write the ephemeral CA certificate.
    #[serde(default)]
    pub ca_cert_out: Option<PathBuf>,

    /// Statically configured certificates.
    #[serde(default)]
    pub certificates: Vec<CertificateEntry>,

    /// Trust applied to real remotes.
    #[serde(default)]
    pub upstream: Option<UpstreamTrust>,
}

impl TlsConfig {
    fn merge(&mut self, other: TlsConfig) {
        if other.mint.is_some() {
            self.mint = other.mint;
        }
        if other.ca_cert_out.is_some() {
            self.ca_cert_out = other.ca_cert_out;
        }
        self.certificates.extend(other.certificates);
        if other.upstream.is_some() {
            self.upstream = other.upstream;
        }
    }

    /// Whether the ephemeral CA is enabled (default `true`).
    pub fn mint(&self) -> bool {
        self.mint.unwrap_or(true)
    }

    /// Effective upstream trust.
    pub fn upstream(&self) -> UpstreamTrust {
        self.upstream.clone().unwrap_or_default()
    }
}

/// Script engine settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ScriptingConfig {
    /// Operations a single hook invocation may perform (0 = unlimited).
    #[serde(default)]
    pub max_operations: Option<u64>,

    /// Maximum function call depth.
    #[serde(default)]
    pub max_call_levels: Option<usize>,
}

impl ScriptingConfig {
    fn merge(&mut self, other: ScriptingConfig) {
        if other.max_operations.is_some() {
            self.max_operations = other.max_operations;
        }
        if other.max_call_levels.is_some() {
            self.max_call_levels = other.max_call_levels;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_call_levels == Some(0) {
            return Err(ConfigError::invalid("scripting.max_call_levels", "must be at least 1"));
        }
        Ok(())
    }

    /// Engine limits with defaults applied.
    pub fn limits(&self) -> ScriptLimits {
        ScriptLimits {
            max_operations: self.max_operations.unwrap_or(DEFAULT_MAX_OPERATIONS),
            max_call_levels: self.max_call_levels.unwrap_or(DEFAULT_MAX_CALL_LEVELS),
        }
    }
}

/// A configured component.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComponentConfig {
    /// A relaying proxy.
    ProxyServer(ProxyServerConfig),
}

/// Settings of one proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyServerConfig {
    /// Component id; generated when absent.
    #[serde(default)]
    pub id: Option<Uuid>,

    /// Attached script URLs.
    #[serde(default)]
    pub scripts: Vec<String>,

    /// Start the proxy right after loading.
    #[serde(default = "default_autostart")]
    pub autostart: bool,

    /// True destination host.
    pub remote_host: String,

    /// True destination port; the protocol's default when absent.
    #[serde(default)]
    pub remote_port: Option<u16>,

    /// Explicit listen host.
    #[serde(default)]
    pub local_host: Option<String>,

    /// Explicit listen port.
    #[serde(default)]
    pub local_port: Option<u16>,

    /// Source host for backend connections.
    #[serde(default)]
    pub via_host: Option<String>,

    /// Source port for backend connections.
    #[serde(default)]
    pub via_port: Option<u16>,

    /// Protocol binding.
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolBinding,
}

fn default_autostart() -> bool {
    true
}

fn default_protocol() -> ProtocolBinding {
    ProtocolBinding::Http(HttpBinding::default())
}

impl ProxyServerConfig {
    /// Build the route, naming the offending field on error.
    ///
    /// `index` is the component's position in `[[components]]`.
    pub fn route(&self, index: usize) -> Result<ConnectionRoute, ConfigError> {
        self.route_in(&format!("components[{}]", index))
    }

    /// Build the route; errors name fields as `<scope>.<field>`.
    pub fn route_in(&self, scope: &str) -> Result<ConnectionRoute, ConfigError> {
        let field = |name: &str| format!("{}.{}", scope, name);

        if self.remote_host.trim().is_empty() {
            return Err(ConfigError::invalid(field("remote_host"), "must not be empty"));
        }

        let remote_port = self
            .remote_port
            .or_else(|| self.protocol.default_port())
            .ok_or_else(|| {
                ConfigError::invalid(
                    field("remote_port"),
                    format!("required for the {} protocol", self.protocol.kind()),
                )
            })?;

        let mut route = ConnectionRoute::new(self.remote_host.clone(), remote_port);

        match (&self.local_host, self.local_port) {
            (Some(host), Some(port)) => route = route.with_local(host.clone(), port),
            (None, None) => {}
            (Some(_), None) => {
                return Err(ConfigError::invalid(
                    field("local_port"),
                    "local_host and local_port must be set together",
                ));
            }
            (None, Some(_)) => {
                return Err(ConfigError::invalid(
                    field("local_host"),
                    "local_host and local_port must be set together",
                ));
            }
        }

        if self.via_host.is_some() || self.via_port.is_some() {
            let host = self
                .via_host
                .clone()
                .unwrap_or_else(|| route.via_host.clone());
            let port = self.via_port.unwrap_or(route.via_port);
            route = route.with_via(host, port);
        }

        Ok(route)
    }
}
