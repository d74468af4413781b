//! Protocol bindings.
//!
//! A [`ProtocolBinding`] supplies everything protocol specific about a
//! proxy: how the listening socket is configured, what admission control
//! applies at accept, and the per-connection relay pipeline. The set of
//! bindings is closed; supporting a new protocol means adding a variant.

use super::error::{ProxyError, ProxyResult};
use super::http::HttpPipeline;
use super::pump::EventPump;
use super::route::{ConnectionRoute, ResolvedRoute};
use super::server::ProxyEnv;
use super::tcp::TcpPipeline;
use crate::tls::{server_acceptor, server_name, CertificateSelector};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Default remote port of the HTTP binding.
pub const DEFAULT_HTTP_PORT: u16 = 443;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Protocol-specific relay strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolBinding {
    /// HTTP/1.1 with optional TLS termination and re-origination.
    Http(HttpBinding),
    /// Raw bidirectional byte relay.
    Tcp(TcpBinding),
}

/// Settings of the HTTP binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpBinding {
    /// Negotiate TLS with clients.
    #[serde(default = "default_true")]
    pub ssl: bool,

    /// Use TLS toward the remote; defaults to `ssl`.
    #[serde(default)]
    pub upstream_ssl: Option<bool>,

    /// Certificate alias for clients sending no usable SNI; defaults to the
    /// route's remote host.
    #[serde(default)]
    pub default_alias: Option<String>,

    /// Maximum concurrently relayed connections.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

/// Settings of the TCP binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpBinding {
    /// Maximum concurrently relayed connections.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl Default for HttpBinding {
    fn default() -> Self {
        Self {
            ssl: true,
            upstream_ssl: None,
            default_alias: None,
            max_connections: None,
        }
    }
}

impl HttpBinding {
    /// Whether the backend leg uses TLS.
    pub fn upstream_ssl(&self) -> bool {
        self.upstream_ssl.unwrap_or(self.ssl)
    }
}

impl ProtocolBinding {
    /// Discriminator used in configuration.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolBinding::Http(_) => "http",
            ProtocolBinding::Tcp(_) => "tcp",
        }
    }

    /// Remote port assumed when the route does not name one.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            ProtocolBinding::Http(_) => Some(DEFAULT_HTTP_PORT),
            ProtocolBinding::Tcp(_) => None,
        }
    }

    fn max_connections(&self) -> Option<usize> {
        match self {
            ProtocolBinding::Http(http) => http.max_connections,
            ProtocolBinding::Tcp(tcp) => tcp.max_connections,
        }
    }

    /// Factory for the listening socket.
    pub fn channel_factory(&self) -> ChannelFactory {
        ChannelFactory::default()
    }

    /// Accept-time admission control, if any.
    pub fn parent_handler(&self, route: &ConnectionRoute) -> Option<ConnectionLimit> {
        let limit = self.max_connections()?;
        tracing::debug!("Route {} limited to {} connections", route.id, limit);
        Some(ConnectionLimit::new(limit))
    }

    /// Build the per-connection pipeline.
    ///
    /// Fails when a TLS leg is required but its material is missing.
    pub fn child_pipeline(
        &self,
        route: &ConnectionRoute,
        resolved: &ResolvedRoute,
        emitter_id: Uuid,
        env: &ProxyEnv,
    ) -> ProxyResult<ChildPipeline> {
        match self {
            ProtocolBinding::Http(http) => {
                let acceptor = if http.ssl {
                    let store = env.certificates.clone().ok_or_else(|| {
                        ProxyError::TlsUnavailable("no certificate store configured".into())
                    })?;
                    let alias = http
                        .default_alias
                        .clone()
                        .unwrap_or_else(|| route.remote_host.clone());
                    Some(server_acceptor(CertificateSelector::new(alias), store))
                } else {
                    None
                };

                let upstream = if http.upstream_ssl() {
                    let connector = env.upstream.clone().ok_or_else(|| {
                        ProxyError::TlsUnavailable("no upstream TLS connector configured".into())
                    })?;
                    Some((connector, server_name(&route.remote_host)?))
                } else {
                    None
                };

                Ok(ChildPipeline::Http(Arc::new(HttpPipeline::new(
                    resolved.remote_addr,
                    resolved.via_addr,
                    acceptor,
                    upstream,
                    EventPump::new(emitter_id, env.bus.clone()),
                ))))
            }
            ProtocolBinding::Tcp(_) => Ok(ChildPipeline::Tcp(Arc::new(TcpPipeline::new(
                resolved.remote_addr,
                resolved.via_addr,
            )))),
        }
    }
}

/// Creates and configures listening sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFactory {
    /// Set `TCP_NODELAY` on accepted connections.
    pub nodelay: bool,
    /// Listen backlog.
    pub backlog: u32,
}

impl Default for ChannelFactory {
    fn default() -> Self {
        Self {
            nodelay: true,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl ChannelFactory {
    /// Bind and listen on `addr`.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(self.backlog)
    }

    /// Apply per-connection socket options to an accepted stream.
    pub fn configure(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)
    }
}

/// Caps the number of concurrently relayed connections.
#[derive(Debug, Clone)]
pub struct ConnectionLimit {
    semaphore: Arc<Semaphore>,
}

impl ConnectionLimit {
    /// Allow at most `max` concurrent connections.
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
        }
    }

    /// Take a slot, or `None` when the limit is reached.
    pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Per-connection relay pipeline.
#[derive(Clone)]
pub enum ChildPipeline {
    /// HTTP relay.
    Http(Arc<HttpPipeline>),
    /// Raw TCP relay.
    Tcp(Arc<TcpPipeline>),
}

impl ChildPipeline {
    /// Relay one accepted connection until either side closes.
    pub async fn serve(&self, stream: TcpStream, peer: SocketAddr) -> ProxyResult<()> {
        match self {
            ChildPipeline::Http(pipeline) => pipeline.serve(stream, peer).await,
            ChildPipeline::Tcp(pipeline) => pipeline.serve(stream, peer).await,
        }
    }
}

/// Connect the backend socket from `via` to `remote`.
pub(crate) async fn connect_backend(via: SocketAddr, remote: SocketAddr) -> ProxyResult<TcpStream> {
    let establish = async {
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if !via.ip().is_unspecified() || via.port() != 0 {
            socket.bind(via)?;
        }
        let stream = socket.connect(remote).await?;
        stream.set_nodelay(true)?;
        Ok::<_, io::Error>(stream)
    };

    establish
        .await
        .map_err(|e| ProxyError::RelayEstablishment {
            addr: remote.to_string(),
            message: e.to_string(),
        })
}
