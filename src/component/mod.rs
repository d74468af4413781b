//! Components and their scripts.
//!
//! A [`Component`] is a configured unit with an immutable id and a list of
//! attached script URLs. Components that can be started and stopped expose
//! [`StartStop`]. The [`ComponentRegistry`] owns every component, loads its
//! scripts (from files or over http) into the rhai host, and fans events from the bus out to the
//! scripts' `on_message` hooks.
//!
//! # Example
//!
//! ```ignore
//! use tapwire::component::{ComponentRegistry, ScriptEngine};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(ComponentRegistry::new(ScriptEngine::default(), bus.clone()));
//! registry.add(Arc::new(proxy)).await?;
//! let dispatch = registry.spawn(shutdown_rx);
//! // ...
//! registry.shutdown().await;
//! ```

mod error;
mod registry;
mod script;
mod source;

use async_trait::async_trait;
use uuid::Uuid;

pub use error::{ComponentError, RegistryError, ScriptError};
pub use registry::{ComponentRegistry, DispatchReport};
pub use script::{
    project_event, ComponentHandle, HookSet, LoadedScript, ScriptEngine, ScriptLimits,
    DEFAULT_MAX_CALL_LEVELS, DEFAULT_MAX_OPERATIONS,
};
pub use source::{ScriptFetcher, ScriptLocation, MAX_SCRIPT_BYTES};

/// A registry-owned unit of configuration.
pub trait Component: Send + Sync + 'static {
    /// Primary key; never changes.
    fn id(&self) -> Uuid;

    /// Short kind name, e.g. `proxy_server`.
    fn kind(&self) -> &'static str;

    /// URLs of attached scripts.
    fn scripts(&self) -> &[String];

    /// Start/stop capability, if the component has one.
    fn controls(&self) -> Option<&dyn StartStop> {
        None
    }
}

/// Lifecycle control of a component.
#[async_trait]
pub trait StartStop: Send + Sync {
    /// Acquire resources and begin work.
    async fn start(&self) -> Result<(), ComponentError>;

    /// Release resources. Must be safe to call when already stopped.
    async fn stop(&self) -> Result<(), ComponentError>;
}
