//! Intercepting relay.
//!
//! This module provides the proxy half of tapwire:
//! - [`ConnectionRoute`]: where to listen, where to connect, where to connect from
//! - [`ProtocolBinding`]: the protocol-specific pipeline (HTTP or raw TCP)
//! - [`ProxyServer`]: one listener per route, with loopback aliasing around bind
//! - [`EventPump`]: publishes relayed HTTP messages on the event bus
//!
//! # Architecture
//!
//! ```text
//!  client ──► [alias addr:port] ──► ProxyServer ──► pipeline ──► [via] ──► remote
//!                                                     │
//!                                                 EventPump
//!                                                     │
//!                                                     ▼
//!                                                 EventBus
//! ```
//!
//! When a route has no local address, the remote's own address is added to
//! the loopback interface so clients reach the proxy without reconfiguration.

pub mod binding;
pub mod error;
pub mod http;
pub mod pump;
pub mod route;
pub mod server;
pub mod tcp;

pub use binding::{
    ChannelFactory, ChildPipeline, ConnectionLimit, HttpBinding, ProtocolBinding, TcpBinding,
    DEFAULT_HTTP_PORT,
};
pub use error::{ProxyError, ProxyResult, RouteError};
pub use http::MAX_AGGREGATED_BYTES;
pub use pump::EventPump;
pub use route::{ConnectionRoute, ResolvedRoute, DEFAULT_VIA_HOST};
pub use server::{ListenerStats, ProxyEnv, ProxyServer, DEFAULT_SETTLE_DELAY};
