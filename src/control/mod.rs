//! HTTP control API.
//!
//! Enabled by `general.control_addr`. Serves JSON over HTTP/1.1:
//!
//! | Method   | Path              | Effect                                             |
//! |----------|-------------------|----------------------------------------------------|
//! | `POST`   | `/component`      | Register a component (a `[[components]]` table as JSON) |
//! | `DELETE` | `/component/{id}` | Remove and stop a component; `404` when absent     |
//! | `GET`    | `/component/`     | List registered components                         |
//! | `POST`   | `/message`        | Publish an event on the bus                        |
//! | `GET`    | `/message`        | WebSocket; every observed event as a JSON text frame |
//!
//! The WebSocket follows the bus: a slow client skips to the latest event.
//!
//! # Example
//!
//! ```text
//! curl -X POST localhost:8080/component -d '{"kind":"proxy_server","remote_host":"api.example.com"}'
//! {"id":"8c0e..."}
//! ```

mod api;
mod error;
mod stream;

pub use api::{ComponentSummary, ControlServer, MAX_BODY_BYTES};
pub use error::ControlError;
