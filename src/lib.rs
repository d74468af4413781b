//! tapwire: local interception proxy framework
//!
//! tapwire relays traffic for configured remotes so that it can be observed.
//! Each relay is a [`proxy::ProxyServer`] that binds either an explicit local
//! address or the remote's own address (made reachable through a loopback
//! alias), forwards connections to the real remote, and publishes every
//! relayed HTTP message on an [`event::EventBus`]. User scripts attached to
//! components receive those events through the
//! [`component::ComponentRegistry`].
//!
//! # Architecture
//!
//! - **Proxy**: routes, protocol bindings (HTTP, TCP) and the listener lifecycle
//! - **Loopback**: per-platform loopback alias management
//! - **TLS**: SNI certificate selection, certificate minting, upstream trust
//! - **Event**: relayed-message events and the latest-wins bus
//! - **Component**: component registry, script retrieval and the rhai script host
//! - **Control**: optional HTTP API to add, remove and list components and
//!   to publish or stream events
//! - **Config**: Hierarchical TOML configuration

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod component;
pub mod config;
pub mod control;
pub mod event;
pub mod loopback;
pub mod proxy;
pub mod tls;
