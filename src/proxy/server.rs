//! Proxy server component.
//!
//! A [`ProxyServer`] owns one listening socket for one [`ConnectionRoute`]
//! and relays every accepted connection through the pipeline of its
//! [`ProtocolBinding`].
//!
//! # Lifecycle
//!
//! ```text
//! Stopped --start()--> Starting --bound--> Running --stop()--> Stopping --> Stopped
//! ```
//!
//! - `start()` resolves the route, adds the loopback alias when no local
//!   address is configured and the address is not already on the interface,
//!   waits the settle delay, then binds. `start()` on a running server fails
//!   with `AlreadyRunning`.
//! - `stop()` closes the listener, waits for the accept task, then removes
//!   the alias if `start()` added it. Accepted connections are left to drain.
//!   Stopping a stopped server does nothing.
//!
//! Transitions are serialized: a `stop()` issued while a `start()` is still
//! aliasing or binding waits for it and then tears the new listener down.
//!
//! # Example
//!
//! ```ignore
//! use tapwire::event::EventBus;
//! use tapwire::proxy::{ConnectionRoute, HttpBinding, ProtocolBinding, ProxyEnv, ProxyServer};
//!
//! let env = ProxyEnv::new(EventBus::new());
//! let server = ProxyServer::new(
//!     ConnectionRoute::new("api.example.com", 443),
//!     ProtocolBinding::Http(HttpBinding::default()),
//!     env,
//! );
//! server.start().await?;
//! // ...
//! server.stop().await?;
//! ```

use super::binding::{ChannelFactory, ChildPipeline, ConnectionLimit, ProtocolBinding};
use super::error::{ProxyError, ProxyResult};
use super::route::ConnectionRoute;
use crate::component::{Component, ComponentError, StartStop};
use crate::config::{ConfigError, ProxyServerConfig};
use crate::event::EventBus;
use crate::loopback::{AliasError, CommandAliaser, LoopbackAlias, LoopbackAliaser};
use crate::tls::CertificateStore;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Wait after adding a loopback alias before binding it.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Process-wide collaborators shared by every proxy.
#[derive(Clone)]
pub struct ProxyEnv {
    /// Bus receiving intercepted messages.
    pub bus: EventBus,
    /// Adds and removes loopback aliases.
    pub aliaser: Arc<dyn LoopbackAliaser>,
    /// Delay between adding an alias and binding it.
    pub settle_delay: Duration,
    /// Certificates presented to clients; required by TLS-terminating bindings.
    pub certificates: Option<Arc<CertificateStore>>,
    /// Connector for the re-encryption leg; required when upstream TLS is on.
    pub upstream: Option<TlsConnector>,
}

impl ProxyEnv {
    /// Environment with the platform aliaser, the default settle delay and
    /// no TLS material.
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            aliaser: Arc::new(CommandAliaser::new()),
            settle_delay: DEFAULT_SETTLE_DELAY,
            certificates: None,
            upstream: None,
        }
    }

    /// Replace the aliaser.
    pub fn with_aliaser(mut self, aliaser: Arc<dyn LoopbackAliaser>) -> Self {
        self.aliaser = aliaser;
        self
    }

    /// Replace the settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the certificate store.
    pub fn with_certificates(mut self, store: Arc<CertificateStore>) -> Self {
        self.certificates = Some(store);
        self
    }

    /// Set the upstream TLS connector.
    pub fn with_upstream(mut self, connector: TlsConnector) -> Self {
        self.upstream = Some(connector);
        self
    }
}

/// Counters for one proxy, kept across restarts.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Connections admitted.
    pub accepted: AtomicU64,
    /// Connections currently relaying.
    pub active: AtomicU64,
    /// Connections refused by the connection limit.
    pub rejected: AtomicU64,
    /// Connections closed because the backend could not be reached.
    pub relay_failures: AtomicU64,
}

enum ServerState {
    Stopped,
    Starting,
    Running(RunningChannel),
    Stopping,
}

struct RunningChannel {
    local_addr: SocketAddr,
    /// Alias added by this start; `None` when none was needed or it existed.
    alias: Option<LoopbackAlias>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// A component relaying one route with one protocol binding.
pub struct ProxyServer {
    id: Uuid,
    scripts: Vec<String>,
    route: ConnectionRoute,
    binding: ProtocolBinding,
    env: ProxyEnv,
    state: Mutex<ServerState>,
    lifecycle: AsyncMutex<()>,
    stats: Arc<ListenerStats>,
}

impl ProxyServer {
    /// Create a stopped proxy with a random id.
    pub fn new(route: ConnectionRoute, binding: ProtocolBinding, env: ProxyEnv) -> Self {
        Self::with_id(Uuid::new_v4(), Vec::new(), route, binding, env)
    }

    /// Create a stopped proxy with an explicit id and attached scripts.
    pub fn with_id(
        id: Uuid,
        scripts: Vec<String>,
        route: ConnectionRoute,
        binding: ProtocolBinding,
        env: ProxyEnv,
    ) -> Self {
        Self {
            id,
            scripts,
            route,
            binding,
            env,
            state: Mutex::new(ServerState::Stopped),
            lifecycle: AsyncMutex::new(()),
            stats: Arc::new(ListenerStats::default()),
        }
    }

    /// Build a stopped proxy from a component table.
    ///
    /// Errors name fields as `<scope>.<field>`. The id is generated when the
    /// table has none.
    pub fn from_config(
        config: &ProxyServerConfig,
        scope: &str,
        env: ProxyEnv,
    ) -> Result<Self, ConfigError> {
        let route = config.route_in(scope)?;
        Ok(Self::with_id(
            config.id.unwrap_or_else(Uuid::new_v4),
            config.scripts.clone(),
            route,
            config.protocol.clone(),
            env,
        ))
    }

    /// The relayed route.
    pub fn route(&self) -> &ConnectionRoute {
        &self.route
    }

    /// The protocol binding.
    pub fn binding(&self) -> &ProtocolBinding {
        &self.binding
    }

    /// Connection counters.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Whether a listener is currently bound.
    pub fn is_running(&self) -> bool {
        matches!(*self.lock_state(), ServerState::Running(_))
    }

    /// Address of the live listener, if running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lock_state() {
            ServerState::Running(channel) => Some(channel.local_addr),
            _ => None,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the listener and start accepting.
    ///
    /// Returns the bound address.
    pub async fn start(&self) -> ProxyResult<SocketAddr> {
        let _transition = self.lifecycle.lock().await;
        {
            let mut state = self.lock_state();
            if !matches!(*state, ServerState::Stopped) {
                return Err(ProxyError::AlreadyRunning(self.id));
            }
            *state = ServerState::Starting;
        }

        match self.open().await {
            Ok(channel) => {
                let addr = channel.local_addr;
                *self.lock_state() = ServerState::Running(channel);
                info!("Proxy {} listening on {} -> {}", self.id, addr, self.route.remote_target());
                Ok(addr)
            }
            Err(e) => {
                *self.lock_state() = ServerState::Stopped;
                Err(e)
            }
        }
    }

    async fn open(&self) -> ProxyResult<RunningChannel> {
        let resolved = self.route.resolve().await?;
        let pipeline = self
            .binding
            .child_pipeline(&self.route, &resolved, self.id, &self.env)?;
        let limit = self.binding.parent_handler(&self.route);
        let factory = self.binding.channel_factory();

        let mut added = None;
        if let Some(alias) = resolved.alias {
            if self.add_alias(alias).await? {
                added = Some(alias);
                tokio::time::sleep(self.env.settle_delay).await;
            } else {
                debug!("Alias {} already present; leaving it in place", alias);
            }
        }

        let bound = factory
            .bind(resolved.bind_addr)
            .and_then(|listener| Ok((listener.local_addr()?, listener)));
        let (local_addr, listener) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                if let Some(alias) = added {
                    if let Err(e) = self.remove_alias(alias).await {
                        warn!("Failed to remove alias {} after bind failure: {}", alias, e);
                    }
                }
                return Err(ProxyError::Bind {
                    addr: resolved.bind_addr,
                    source,
                });
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            self.id,
            listener,
            factory,
            limit,
            pipeline,
            self.stats.clone(),
            shutdown_rx,
        ));

        Ok(RunningChannel {
            local_addr,
            alias: added,
            shutdown_tx,
            accept_task,
        })
    }

    /// Close the listener and remove the alias.
    ///
    /// Already accepted connections keep relaying until their peers close.
    pub async fn stop(&self) -> ProxyResult<()> {
        let _transition = self.lifecycle.lock().await;
        let channel = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, ServerState::Stopping) {
                ServerState::Running(channel) => channel,
                other => {
                    *state = other;
                    return Ok(());
                }
            }
        };

        let _ = channel.shutdown_tx.send(true);
        if let Err(e) = channel.accept_task.await {
            warn!("Accept task for proxy {} ended abnormally: {}", self.id, e);
        }

        if let Some(alias) = channel.alias {
            if let Err(e) = self.remove_alias(alias).await {
                warn!("Failed to remove alias {}: {}", alias, e);
            }
        }

        *self.lock_state() = ServerState::Stopped;
        info!("Proxy {} stopped", self.id);
        Ok(())
    }

    async fn add_alias(&self, alias: LoopbackAlias) -> Result<bool, AliasError> {
        let aliaser = self.env.aliaser.clone();
        tokio::task::spawn_blocking(move || aliaser.ensure_alias(&alias))
            .await
            .map_err(|e| AliasError::Task(e.to_string()))?
    }

    async fn remove_alias(&self, alias: LoopbackAlias) -> Result<(), AliasError> {
        let aliaser = self.env.aliaser.clone();
        tokio::task::spawn_blocking(move || aliaser.remove_alias(&alias))
            .await
            .map_err(|e| AliasError::Task(e.to_string()))?
    }
}

async fn accept_loop(
    id: Uuid,
    listener: TcpListener,
    factory: ChannelFactory,
    limit: Option<ConnectionLimit>,
    pipeline: ChildPipeline,
    stats: Arc<ListenerStats>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, peer) = match accept_result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Proxy {} accept error: {}", id, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                let permit = match &limit {
                    Some(limit) => match limit.try_admit() {
                        Some(permit) => Some(permit),
                        None => {
                            stats.rejected.fetch_add(1, Ordering::Relaxed);
                            warn!("Connection from {} rejected: max connections reached", peer);
                            continue;
                        }
                    },
                    None => None,
                };

                if let Err(e) = factory.configure(&stream) {
                    debug!("Failed to configure socket for {}: {}", peer, e);
                }

                stats.accepted.fetch_add(1, Ordering::Relaxed);
                stats.active.fetch_add(1, Ordering::Relaxed);

                let pipeline = pipeline.clone();
                let stats = stats.clone();
                tokio::spawn(
                    async move {
                        debug!("Accepted connection");
                        match pipeline.serve(stream, peer).await {
                            Ok(()) => debug!("Connection closed"),
                            Err(e @ ProxyError::RelayEstablishment { .. }) => {
                                stats.relay_failures.fetch_add(1, Ordering::Relaxed);
                                debug!("Connection dropped: {}", e);
                            }
                            Err(e) if e.is_disconnect() => debug!("Connection ended: {}", e),
                            Err(e) => debug!("Connection error: {}", e),
                        }
                        stats.active.fetch_sub(1, Ordering::Relaxed);
                        drop(permit);
                    }
                    .instrument(tracing::debug_span!("connection", proxy = %id, peer = %peer)),
                );
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("Proxy {} accept loop shutting down", id);
                    break;
                }
            }
        }
    }
}

impl Component for ProxyServer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> &'static str {
        "proxy_server"
    }

    fn scripts(&self) -> &[String] {
        &self.scripts
    }

    fn controls(&self) -> Option<&dyn StartStop> {
        Some(self)
    }
}

#[async_trait]
impl StartStop for ProxyServer {
    async fn start(&self) -> Result<(), ComponentError> {
        ProxyServer::start(self).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ComponentError> {
        ProxyServer::stop(self).await?;
        Ok(())
    }
}
