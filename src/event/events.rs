//! Event types published on the bus.

use chrono::{DateTime, Utc};
use hyper::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A structured observation attributed to one emitter at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Id of the component that produced the event.
    pub emitter_id: Uuid,

    /// When the event was built, serialized as epoch milliseconds.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub emitted_at: DateTime<Utc>,

    /// The event body (flattened, carries the `type` discriminator).
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Stamp a payload with its emitter and the current time.
    pub fn now(emitter_id: Uuid, payload: EventPayload) -> Self {
        Self {
            emitter_id,
            emitted_at: Utc::now(),
            payload,
        }
    }

    /// The serialized discriminator of this event's payload.
    pub fn kind(&self) -> &'static str {
        match self.payload {
            EventPayload::HttpRequest(_) => "http_request",
            EventPayload::HttpResponse(_) => "http_response",
        }
    }
}

/// Closed set of event bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// An aggregated HTTP request on its way to the remote.
    HttpRequest(HttpRequestEvent),
    /// An aggregated HTTP response read from the remote.
    HttpResponse(HttpResponseEvent),
}

/// Request line and headers of an intercepted HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestEvent {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Request target as sent by the client.
    pub uri: String,
    /// Header name to value; repeated names are joined with `", "`.
    pub headers: BTreeMap<String, String>,
}

/// Status line and headers of an intercepted HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponseEvent {
    /// Numeric status code.
    pub status: u16,
    /// Reason phrase.
    pub message: String,
    /// Header name to value; repeated names are joined with `", "`.
    pub headers: BTreeMap<String, String>,
}

/// Flatten a header map into the event representation.
pub fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}
