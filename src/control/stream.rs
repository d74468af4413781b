//! WebSocket event stream on `GET /message`.

use crate::event::{EventBus, EventSubscriber};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::header::{
    HeaderMap, HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

fn header_has_token(headers: &HeaderMap, name: hyper::header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

fn plain(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *resp.status_mut() = status;
    resp
}

/// Answer a WebSocket handshake and stream bus events to the client.
///
/// The subscription is taken before the `101` is sent, so every event
/// published after the client sees the upgrade is delivered.
pub(super) fn upgrade<B>(
    mut req: Request<B>,
    bus: &EventBus,
    shutdown: watch::Receiver<bool>,
) -> Response<Full<Bytes>> {
    let headers = req.headers();
    if !header_has_token(headers, UPGRADE, "websocket")
        || !header_has_token(headers, CONNECTION, "upgrade")
    {
        let mut resp = plain(
            StatusCode::UPGRADE_REQUIRED,
            "GET /message expects a WebSocket upgrade",
        );
        resp.headers_mut()
            .insert(UPGRADE, HeaderValue::from_static("websocket"));
        return resp;
    }
    if headers.get(SEC_WEBSOCKET_VERSION).map(|v| v.as_bytes()) != Some(b"13") {
        return plain(StatusCode::BAD_REQUEST, "Unsupported WebSocket version");
    }
    let accept = match headers.get(SEC_WEBSOCKET_KEY) {
        Some(key) => derive_accept_key(key.as_bytes()),
        None => return plain(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key"),
    };
    let accept = match HeaderValue::from_str(&accept) {
        Ok(accept) => accept,
        Err(_) => return plain(StatusCode::BAD_REQUEST, "Invalid Sec-WebSocket-Key"),
    };

    let subscriber = bus.subscribe();
    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                forward(ws, subscriber, shutdown).await;
            }
            Err(e) => debug!("WebSocket upgrade failed: {}", e),
        }
    });

    let mut resp = plain(StatusCode::SWITCHING_PROTOCOLS, "");
    let headers = resp.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    resp
}

/// Send every event as a JSON text frame until the client leaves.
async fn forward(
    ws: WebSocketStream<TokioIo<Upgraded>>,
    mut subscriber: EventSubscriber,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut sink, mut incoming) = ws.split();
    debug!("Event stream opened");

    loop {
        tokio::select! {
            event = subscriber.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(event.as_ref()) {
                    Ok(text) => text,
                    Err(e) => {
                        debug!("Failed to encode event: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::text(text)).await {
                    debug!("Event stream send failed: {}", e);
                    break;
                }
            }
            frame = incoming.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Event stream read failed: {}", e);
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }
    debug!("Event stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&'static str, &'static str)]) -> Request<()> {
        let mut builder = Request::get("/message");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_header_tokens() {
        let req = request(&[("connection", "keep-alive, Upgrade")]);
        assert!(header_has_token(req.headers(), CONNECTION, "upgrade"));
        assert!(!header_has_token(req.headers(), UPGRADE, "websocket"));
    }

    #[tokio::test]
    async fn test_plain_get_needs_upgrade() {
        let bus = EventBus::new();
        let (_tx, rx) = watch::channel(false);
        let resp = upgrade(request(&[]), &bus, rx);
        assert_eq!(resp.status(), StatusCode::UPGRADE_REQUIRED);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake_accept_key() {
        let bus = EventBus::new();
        let (_tx, rx) = watch::channel(false);
        let req = request(&[
            ("connection", "Upgrade"),
            ("upgrade", "websocket"),
            ("sec-websocket-version", "13"),
            ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ]);
        let resp = upgrade(req, &bus, rx);
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            resp.headers()[SEC_WEBSOCKET_ACCEPT],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_key_rejected() {
        let bus = EventBus::new();
        let (_tx, rx) = watch::channel(false);
        let req = request(&[
            ("connection", "Upgrade"),
            ("upgrade", "websocket"),
            ("sec-websocket-version", "13"),
        ]);
        assert_eq!(upgrade(req, &bus, rx).status(), StatusCode::BAD_REQUEST);
    }
}
