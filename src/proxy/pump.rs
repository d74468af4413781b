//! Turns relayed HTTP messages into bus events.

use crate::event::{flatten_headers, Event, EventBus, EventPayload, HttpRequestEvent, HttpResponseEvent};
use hyper::ext::ReasonPhrase;
use hyper::{Request, Response};
use tracing::trace;
use uuid::Uuid;

/// Observer on the backend leg of an HTTP relay.
///
/// Each aggregated request written toward the remote and each response read
/// back from it is published as an [`Event`] stamped with the owning proxy's
/// id. Messages pass through unchanged.
#[derive(Debug, Clone)]
pub struct EventPump {
    emitter_id: Uuid,
    bus: EventBus,
}

impl EventPump {
    /// Create a pump publishing on `bus` on behalf of `emitter_id`.
    pub fn new(emitter_id: Uuid, bus: EventBus) -> Self {
        Self { emitter_id, bus }
    }

    /// Publish a request event and hand the request back.
    pub fn request<B>(&self, req: Request<B>) -> Request<B> {
        let payload = EventPayload::HttpRequest(HttpRequestEvent {
            method: req.method().as_str().to_string(),
            uri: req.uri().to_string(),
            headers: flatten_headers(req.headers()),
        });
        trace!("{} {} -> remote", req.method(), req.uri());
        self.bus.publish(Event::now(self.emitter_id, payload));
        req
    }

    /// Publish a response event and hand the response back.
    pub fn response<B>(&self, resp: Response<B>) -> Response<B> {
        let message = resp
            .extensions()
            .get::<ReasonPhrase>()
            .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned())
            .or_else(|| resp.status().canonical_reason().map(str::to_string))
            .unwrap_or_default();

        let payload = EventPayload::HttpResponse(HttpResponseEvent {
            status: resp.status().as_u16(),
            message,
            headers: flatten_headers(resp.headers()),
        });
        trace!("{} <- remote", resp.status());
        self.bus.publish(Event::now(self.emitter_id, payload));
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;

    #[test]
    fn test_request_published_and_returned() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let id = Uuid::new_v4();
        let pump = EventPump::new(id, bus);

        let req = Request::builder()
            .method("GET")
            .uri("/status")
            .header("host", "a.example.com")
            .body("payload")
            .unwrap();
        let req = pump.request(req);
        assert_eq!(*req.body(), "payload");

        let event = sub.try_recv().unwrap();
        assert_eq!(event.emitter_id, id);
        match &event.payload {
            EventPayload::HttpRequest(r) => {
                assert_eq!(r.method, "GET");
                assert_eq!(r.uri, "/status");
                assert_eq!(r.headers.len(), 1);
                assert_eq!(r.headers["host"], "a.example.com");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_response_uses_canonical_reason() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let pump = EventPump::new(Uuid::nil(), bus);

        let resp = Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(())
            .unwrap();
        let resp = pump.response(resp);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let event = sub.try_recv().unwrap();
        match &event.payload {
            EventPayload::HttpResponse(r) => {
                assert_eq!(r.status, 404);
                assert_eq!(r.message, "Not Found");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
