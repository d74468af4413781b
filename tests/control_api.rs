//! End-to-end tests of the HTTP control API.

use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tapwire::component::{ComponentRegistry, ScriptEngine};
use tapwire::control::ControlServer;
use tapwire::event::{Event, EventBus, EventPayload, HttpResponseEvent};
use tapwire::loopback::RecordingAliaser;
use tapwire::proxy::ProxyEnv;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    addr: SocketAddr,
    registry: Arc<ComponentRegistry>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

async fn harness() -> Harness {
    let bus = EventBus::new();
    let env = ProxyEnv::new(bus.clone())
        .with_aliaser(Arc::new(RecordingAliaser::new()))
        .with_settle_delay(Duration::ZERO);
    let registry = Arc::new(ComponentRegistry::new(ScriptEngine::default(), bus));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (addr, task) = ControlServer::new(registry.clone(), env)
        .spawn("127.0.0.1:0".parse().unwrap(), shutdown_rx)
        .await
        .unwrap();
    Harness {
        addr,
        registry,
        shutdown,
        task,
    }
}

/// Send one request on a fresh connection; returns the status and body.
async fn call(addr: SocketAddr, method: &str, path: &str, body: Option<&str>) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let body = body.unwrap_or("");
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        addr,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let raw = String::from_utf8(raw).unwrap();
    let status = raw[9..12].parse().unwrap();
    let body = raw
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

fn tcp_component(id: Uuid) -> String {
    json!({
        "kind": "proxy_server",
        "id": id,
        "remote_host": "127.0.0.1",
        "remote_port": 9,
        "local_host": "127.0.0.1",
        "local_port": 0,
        "protocol": { "kind": "tcp" }
    })
    .to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_add_list_remove_component() {
    let h = harness().await;
    let id = Uuid::new_v4();

    let (status, body) = call(h.addr, "POST", "/component", Some(&tcp_component(id))).await;
    assert_eq!(status, 200, "{}", body);
    let added: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(added["id"], id.to_string());
    let listening: SocketAddr = added["listening"].as_str().unwrap().parse().unwrap();
    assert!(TcpStream::connect(listening).await.is_ok());
    assert!(h.registry.contains(id));

    let (status, body) = call(h.addr, "GET", "/component/", None).await;
    assert_eq!(status, 200);
    let listed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["id"], id.to_string());
    assert_eq!(listed[0]["kind"], "proxy_server");

    let (status, _) = call(h.addr, "POST", "/component", Some(&tcp_component(id))).await;
    assert_eq!(status, 409);

    let path = format!("/component/{}", id);
    let (status, _) = call(h.addr, "DELETE", &path, None).await;
    assert_eq!(status, 200);
    assert!(!h.registry.contains(id));
    // Removal also stops the proxy.
    assert!(TcpStream::connect(listening).await.is_err());

    let (status, _) = call(h.addr, "DELETE", &path, None).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_rejects_bad_requests() {
    let h = harness().await;

    let (status, body) = call(h.addr, "POST", "/component", Some("{\"kind\":\"bogus\"}")).await;
    assert_eq!(status, 400);
    assert!(body.contains("error"));

    let missing_port = json!({
        "kind": "proxy_server",
        "remote_host": "db.internal",
        "protocol": { "kind": "tcp" }
    })
    .to_string();
    let (status, body) = call(h.addr, "POST", "/component", Some(&missing_port)).await;
    assert_eq!(status, 400);
    assert!(body.contains("component.remote_port"), "{}", body);

    let (status, _) = call(h.addr, "DELETE", "/component/not-a-uuid", None).await;
    assert_eq!(status, 400);

    let (status, _) = call(h.addr, "PUT", "/component", None).await;
    assert_eq!(status, 405);

    let (status, _) = call(h.addr, "GET", "/nowhere", None).await;
    assert_eq!(status, 404);

    let (status, _) = call(h.addr, "GET", "/message", None).await;
    assert_eq!(status, 426);

    assert!(h.registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_posted_message_reaches_websocket() {
    let h = harness().await;

    let (mut ws, _) = timeout(
        WAIT,
        tokio_tungstenite::connect_async(format!("ws://{}/message", h.addr)),
    )
    .await
    .unwrap()
    .unwrap();

    let event = Event::now(
        Uuid::new_v4(),
        EventPayload::HttpResponse(HttpResponseEvent {
            status: 418,
            message: "I'm a teapot".to_string(),
            headers: BTreeMap::new(),
        }),
    );
    let encoded = serde_json::to_string(&event).unwrap();
    let (status, _) = call(h.addr, "POST", "/message", Some(&encoded)).await;
    assert_eq!(status, 200);

    let frame = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Text(text) = frame else {
        panic!("expected a text frame, got {:?}", frame);
    };
    let received: Event = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(received.emitter_id, event.emitter_id);
    assert_eq!(received.kind(), "http_response");

    let (status, _) = call(h.addr, "POST", "/message", Some("{}")).await;
    assert_eq!(status, 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_api_and_streams() {
    let h = harness().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/message", h.addr))
        .await
        .unwrap();

    h.shutdown.send(true).unwrap();
    timeout(WAIT, h.task).await.unwrap().unwrap();

    // The stream ends with a close frame or a closed socket.
    loop {
        match timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
            Some(Ok(_)) => {}
        }
    }
    assert!(TcpStream::connect(h.addr).await.is_err());
}
