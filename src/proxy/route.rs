//! Relay addressing and bind-target resolution.

use super::error::RouteError;
use crate::loopback::LoopbackAlias;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use tokio::net::lookup_host;
use tracing::debug;
use uuid::Uuid;

/// Default outbound source host: any interface.
pub const DEFAULT_VIA_HOST: &str = "0.0.0.0";

/// Where a relay listens, where it connects, and which local address it
/// connects from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRoute {
    /// Route identifier.
    pub id: Uuid,
    /// Local source host the backend socket binds before connecting.
    pub via_host: String,
    /// Local source port for the backend socket (0 = ephemeral).
    pub via_port: u16,
    /// True destination host.
    pub remote_host: String,
    /// True destination port.
    pub remote_port: u16,
    /// Explicit listen host; set together with `local_port`.
    pub local_host: Option<String>,
    /// Explicit listen port; set together with `local_host`.
    pub local_port: Option<u16>,
}

/// A route with every host resolved to a socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRoute {
    /// Address the listener binds.
    pub bind_addr: SocketAddr,
    /// Address the backend connects to.
    pub remote_addr: SocketAddr,
    /// Source address of the backend socket.
    pub via_addr: SocketAddr,
    /// Alias that must exist before binding, when no local address was given.
    pub alias: Option<LoopbackAlias>,
}

impl ConnectionRoute {
    /// Route to `remote_host:remote_port` over any local interface, binding
    /// the remote address itself through a loopback alias.
    pub fn new(remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            via_host: DEFAULT_VIA_HOST.to_string(),
            via_port: 0,
            remote_host: remote_host.into(),
            remote_port,
            local_host: None,
            local_port: None,
        }
    }

    /// Listen on an explicit local address instead of aliasing the remote.
    pub fn with_local(mut self, host: impl Into<String>, port: u16) -> Self {
        self.local_host = Some(host.into());
        self.local_port = Some(port);
        self
    }

    /// Connect to the remote from a specific local address.
    pub fn with_via(mut self, host: impl Into<String>, port: u16) -> Self {
        self.via_host = host.into();
        self.via_port = port;
        self
    }

    /// `remote_host:remote_port`, for logs and errors.
    pub fn remote_target(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// Whether binding requires a loopback alias.
    pub fn needs_alias(&self) -> bool {
        self.local_host.is_none() && self.local_port.is_none()
    }

    /// Resolve every host of the route.
    ///
    /// The remote host must resolve to exactly one distinct address.
    pub async fn resolve(&self) -> Result<ResolvedRoute, RouteError> {
        let local = match (&self.local_host, self.local_port) {
            (Some(host), Some(port)) => Some((host.as_str(), port)),
            (None, None) => None,
            _ => return Err(RouteError::HalfSpecifiedLocal(self.id)),
        };

        let remote_ip = resolve_single(&self.remote_host, self.remote_port).await?;
        let remote_addr = SocketAddr::new(remote_ip, self.remote_port);

        let (bind_addr, alias) = match local {
            Some((host, port)) => {
                let ip = resolve_first(host, port).await?;
                (SocketAddr::new(ip, port), None)
            }
            None => (remote_addr, Some(LoopbackAlias::new(remote_ip))),
        };

        let via_ip = match resolve_first(&self.via_host, self.via_port).await? {
            IpAddr::V4(v4) if v4.is_unspecified() && remote_ip.is_ipv6() => {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            }
            ip => ip,
        };
        let via_addr = SocketAddr::new(via_ip, self.via_port);

        debug!(
            "Route {} resolved: bind={} remote={} via={}",
            self.id, bind_addr, remote_addr, via_addr
        );

        Ok(ResolvedRoute {
            bind_addr,
            remote_addr,
            via_addr,
            alias,
        })
    }
}

async fn lookup(host: &str, port: u16) -> Result<BTreeSet<IpAddr>, RouteError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(BTreeSet::from([ip]));
    }
    let addrs = lookup_host((host, port))
        .await
        .map_err(|source| RouteError::Resolve {
            host: host.to_string(),
            source,
        })?;
    Ok(addrs.map(|addr| addr.ip()).collect())
}

async fn resolve_single(host: &str, port: u16) -> Result<IpAddr, RouteError> {
    let ips = lookup(host, port).await?;
    let count = ips.len();
    match (ips.into_iter().next(), count) {
        (Some(ip), 1) => Ok(ip),
        (None, _) => Err(RouteError::NoAddress(host.to_string())),
        (Some(_), count) => Err(RouteError::AmbiguousRemote {
            host: host.to_string(),
            count,
        }),
    }
}

async fn resolve_first(host: &str, port: u16) -> Result<IpAddr, RouteError> {
    lookup(host, port)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| RouteError::NoAddress(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_without_local_aliases_remote() {
        let route = ConnectionRoute::new("10.0.0.5", 443);
        let resolved = route.resolve().await.unwrap();

        assert_eq!(resolved.bind_addr, "10.0.0.5:443".parse().unwrap());
        assert_eq!(resolved.remote_addr, "10.0.0.5:443".parse().unwrap());
        assert_eq!(resolved.via_addr, "0.0.0.0:0".parse().unwrap());
        assert_eq!(resolved.alias.unwrap().to_string(), "10.0.0.5/32");
    }

    #[tokio::test]
    async fn test_resolve_with_local_skips_alias() {
        let route = ConnectionRoute::new("10.0.0.5", 443).with_local("127.0.0.1", 8443);
        let resolved = route.resolve().await.unwrap();

        assert_eq!(resolved.bind_addr, "127.0.0.1:8443".parse().unwrap());
        assert!(resolved.alias.is_none());
        assert!(!route.needs_alias());
    }

    #[tokio::test]
    async fn test_half_specified_local_rejected() {
        let mut route = ConnectionRoute::new("10.0.0.5", 443);
        route.local_host = Some("127.0.0.1".to_string());

        assert!(matches!(
            route.resolve().await,
            Err(RouteError::HalfSpecifiedLocal(_))
        ));
    }

    #[tokio::test]
    async fn test_ipv6_remote_uses_ipv6_via() {
        let route = ConnectionRoute::new("fd00::7", 443);
        let resolved = route.resolve().await.unwrap();

        assert_eq!(resolved.via_addr, "[::]:0".parse().unwrap());
        assert_eq!(resolved.alias.unwrap().to_string(), "fd00::7/128");
    }

    #[tokio::test]
    async fn test_explicit_via() {
        let route = ConnectionRoute::new("10.0.0.5", 80)
            .with_local("127.0.0.1", 0)
            .with_via("127.0.0.1", 0);
        let resolved = route.resolve().await.unwrap();
        assert_eq!(resolved.via_addr, "127.0.0.1:0".parse().unwrap());
    }

    #[test]
    fn test_remote_target() {
        let route = ConnectionRoute::new("api.example.com", 443);
        assert_eq!(route.remote_target(), "api.example.com:443");
        assert!(route.needs_alias());
    }
}
