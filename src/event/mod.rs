//! Process-wide event bus.
//!
//! Protocol pipelines turn intercepted messages into [`Event`] values and
//! publish them on an [`EventBus`]; the component registry subscribes and
//! fans each event out to script hooks.
//!
//! # Delivery
//!
//! The bus is "latest wins": it holds at most one pending event, each publish
//! replaces it, and a slow subscriber skips intermediate events. It never
//! applies backpressure to the network path.
//!
//! # Event Format
//!
//! Events serialize as JSON with a `type` discriminator:
//!
//! ```json
//! {"emitter_id":"5f0c...","emitted_at":1767796321000,"type":"http_request","method":"GET","uri":"/status","headers":{"host":"a.example.com"}}
//! ```

mod bus;
mod events;

pub use bus::{EventBus, EventSubscriber};
pub use events::{flatten_headers, Event, EventPayload, HttpRequestEvent, HttpResponseEvent};
