//! Loopback aliasing through the platform's network configuration tool.

use super::error::AliasError;
use super::{LoopbackAlias, LoopbackAliaser};
use std::net::IpAddr;
use std::process::Command;
use tracing::{debug, info};

/// Operating systems with a known alias command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Platform {
    Linux,
    MacOs,
    Windows,
    Other(&'static str),
}

impl Platform {
    pub(crate) fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Platform::Linux,
            "macos" => Platform::MacOs,
            "windows" => Platform::Windows,
            other => Platform::Other(other),
        }
    }

    /// Command line that adds `alias` to the loopback interface.
    pub(crate) fn add_command(&self, alias: &LoopbackAlias) -> Result<Vec<String>, AliasError> {
        let addr = alias.addr().to_string();
        let cmd = match self {
            Platform::Linux => vec!["ip".into(), "addr".into(), "add".into(), alias.to_string(), "dev".into(), "lo".into()],
            Platform::MacOs => match alias.addr() {
                IpAddr::V4(_) => vec!["ifconfig".into(), "lo0".into(), "alias".into(), alias.to_string()],
                IpAddr::V6(_) => vec![
                    "ifconfig".into(),
                    "lo0".into(),
                    "inet6".into(),
                    "alias".into(),
                    addr,
                    "prefixlen".into(),
                    alias.prefix_len().to_string(),
                ],
            },
            Platform::Windows => {
                let family = match alias.addr() {
                    IpAddr::V4(_) => "ip",
                    IpAddr::V6(_) => "ipv6",
                };
                vec![
                    "netsh".into(),
                    "interface".into(),
                    family.into(),
                    "add".into(),
                    "address".into(),
                    "Loopback".into(),
                    alias.to_string(),
                ]
            }
            Platform::Other(os) => return Err(AliasError::Unsupported(*os)),
        };
        Ok(cmd)
    }

    /// Command line that lists the addresses of the loopback interface.
    pub(crate) fn show_command(&self, alias: &LoopbackAlias) -> Result<Vec<String>, AliasError> {
        let cmd = match self {
            Platform::Linux => vec!["ip".into(), "-o".into(), "addr".into(), "show".into(), "dev".into(), "lo".into()],
            Platform::MacOs => vec!["ifconfig".into(), "lo0".into()],
            Platform::Windows => {
                let family = match alias.addr() {
                    IpAddr::V4(_) => "ip",
                    IpAddr::V6(_) => "ipv6",
                };
                vec![
                    "netsh".into(),
                    "interface".into(),
                    family.into(),
                    "show".into(),
                    "address".into(),
                    "Loopback".into(),
                ]
            }
            Platform::Other(os) => return Err(AliasError::Unsupported(*os)),
        };
        Ok(cmd)
    }

    /// Command line that removes `alias` from the loopback interface.
    pub(crate) fn remove_command(&self, alias: &LoopbackAlias) -> Result<Vec<String>, AliasError> {
        let addr = alias.addr().to_string();
        let cmd = match self {
            Platform::Linux => vec!["ip".into(), "addr".into(), "del".into(), alias.to_string(), "dev".into(), "lo".into()],
            Platform::MacOs => match alias.addr() {
                IpAddr::V4(_) => vec!["ifconfig".into(), "lo0".into(), "-alias".into(), addr],
                IpAddr::V6(_) => vec!["ifconfig".into(), "lo0".into(), "inet6".into(), "-alias".into(), addr],
            },
            Platform::Windows => {
                let family = match alias.addr() {
                    IpAddr::V4(_) => "ip",
                    IpAddr::V6(_) => "ipv6",
                };
                vec![
                    "netsh".into(),
                    "interface".into(),
                    family.into(),
                    "delete".into(),
                    "address".into(),
                    "Loopback".into(),
                    addr,
                ]
            }
            Platform::Other(os) => return Err(AliasError::Unsupported(*os)),
        };
        Ok(cmd)
    }
}

/// Aliaser that runs the platform's network configuration command.
#[derive(Debug, Clone)]
pub struct CommandAliaser {
    platform: Platform,
    /// Prepended to every command, e.g. `["sudo", "-n"]`.
    elevation: Vec<String>,
}

impl CommandAliaser {
    /// Create an aliaser for the current platform without elevation.
    pub fn new() -> Self {
        Self {
            platform: Platform::current(),
            elevation: Vec::new(),
        }
    }

    /// Run every command through the given elevation prefix.
    pub fn with_elevation(mut self, elevation: Vec<String>) -> Self {
        self.elevation = elevation;
        self
    }

    fn full_command(&self, cmd: Vec<String>) -> Vec<String> {
        self.elevation.iter().cloned().chain(cmd).collect()
    }

    /// Whether the loopback interface already carries the aliased address.
    ///
    /// Listing needs no privileges, so the elevation prefix is not applied.
    /// A listing that cannot be obtained counts as absent.
    fn is_present(&self, alias: &LoopbackAlias) -> Result<bool, AliasError> {
        let cmd = self.platform.show_command(alias)?;
        match run(&cmd) {
            Ok(listing) => Ok(lists_address(&listing, alias.addr())),
            Err(e) => {
                debug!("Could not list loopback addresses: {}", e);
                Ok(false)
            }
        }
    }
}

impl Default for CommandAliaser {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackAliaser for CommandAliaser {
    fn ensure_alias(&self, alias: &LoopbackAlias) -> Result<bool, AliasError> {
        if self.is_present(alias)? {
            info!("Loopback alias {} already present", alias);
            return Ok(false);
        }

        let cmd = self.full_command(self.platform.add_command(alias)?);
        if let Err(e) = run(&cmd) {
            // Another process may have added it between the listing and the add.
            if self.is_present(alias)? {
                info!("Loopback alias {} already present", alias);
                return Ok(false);
            }
            return Err(e);
        }
        info!("Loopback alias {} added", alias);
        Ok(true)
    }

    fn remove_alias(&self, alias: &LoopbackAlias) -> Result<(), AliasError> {
        let cmd = self.full_command(self.platform.remove_command(alias)?);
        run(&cmd)?;
        info!("Loopback alias {} removed", alias);
        Ok(())
    }
}

/// Whether an interface listing mentions `addr`.
///
/// Tokens may carry a prefix length (`10.0.0.5/32`) or a zone
/// (`fe80::1%lo0`); both are ignored.
fn lists_address(listing: &str, addr: IpAddr) -> bool {
    listing
        .split_whitespace()
        .filter_map(|token| {
            let token = token.split(['/', '%']).next().unwrap_or(token);
            token.parse::<IpAddr>().ok()
        })
        .any(|listed| listed == addr)
}

/// Run a command line, returning stdout and capturing stderr on failure.
fn run(cmd: &[String]) -> Result<String, AliasError> {
    let cmd_str = cmd.join(" ");
    debug!("Running: {}", cmd_str);

    let (program, args) = cmd
        .split_first()
        .ok_or_else(|| AliasError::Task("empty command".to_string()))?;

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| AliasError::CommandFailed {
            cmd: cmd_str.clone(),
            source: e,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(AliasError::CommandError { cmd: cmd_str, stderr });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
