use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tapwire::event::{EventBus, EventPayload};
use tapwire::loopback::RecordingAliaser;
use tapwire::proxy::{ConnectionRoute, HttpBinding, ProtocolBinding, ProxyEnv, ProxyServer};
use tapwire::tls::{
    server_acceptor, upstream_connector, CertificateAuthority, CertificateSelector,
    CertificateStore, UpstreamTrust,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

const WAIT: Duration = Duration::from_secs(10);

async fn read_until<S: AsyncRead + Unpin>(stream: &mut S, needle: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buf.windows(needle.len()).any(|window| window == needle) {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    buf
}

/// A TLS backend with its own CA that answers one request with `hello`.
async fn tls_backend() -> SocketAddr {
    let store = Arc::new(CertificateStore::new(Some(Arc::new(
        CertificateAuthority::generate().unwrap(),
    ))));
    let acceptor = server_acceptor(CertificateSelector::new("127.0.0.1"), store);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(stream).await.unwrap();
        read_until(&mut tls, b"\r\n\r\n").await;
        tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        tls.flush().await.unwrap();
        let mut rest = Vec::new();
        let _ = tls.read_to_end(&mut rest).await;
    });
    addr
}

fn client_connector(ca: &CertificateAuthority) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca.cert_pem().as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

struct Harness {
    server: ProxyServer,
    store: Arc<CertificateStore>,
    ca: Arc<CertificateAuthority>,
    bus: EventBus,
}

async fn intercepting_proxy() -> Harness {
    let backend = tls_backend().await;

    let ca = Arc::new(CertificateAuthority::generate().unwrap());
    let store = Arc::new(CertificateStore::new(Some(ca.clone())));
    let bus = EventBus::new();
    let env = ProxyEnv::new(bus.clone())
        .with_aliaser(Arc::new(RecordingAliaser::new()))
        .with_settle_delay(Duration::ZERO)
        .with_certificates(store.clone())
        .with_upstream(upstream_connector(&UpstreamTrust::AcceptAny).unwrap());

    let route = ConnectionRoute::new("127.0.0.1", backend.port()).with_local("127.0.0.1", 0);
    let server = ProxyServer::new(route, ProtocolBinding::Http(HttpBinding::default()), env);

    Harness {
        server,
        store,
        ca,
        bus,
    }
}

#[tokio::test]
async fn test_sni_selects_minted_certificate() {
    let harness = intercepting_proxy().await;
    let mut events = harness.bus.subscribe();
    let addr = harness.server.start().await.unwrap();

    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut tls = client_connector(&harness.ca)
        .connect(ServerName::try_from("api.test").unwrap(), tcp)
        .await
        .unwrap();
    tls.write_all(b"GET /secure HTTP/1.1\r\nHost: api.test\r\n\r\n")
        .await
        .unwrap();

    let reply = timeout(WAIT, read_until(&mut tls, b"hello")).await.unwrap();
    assert!(reply.starts_with(b"HTTP/1.1 200 OK"));

    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    let EventPayload::HttpResponse(resp) = &event.payload else {
        panic!("expected response event, got {:?}", event.payload);
    };
    assert_eq!(resp.status, 200);

    // Only the SNI name was minted; the default alias was never needed.
    assert_eq!(harness.store.minted_len(), 1);

    harness.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_sni_uses_default_alias() {
    let harness = intercepting_proxy().await;
    let addr = harness.server.start().await.unwrap();

    // Clients do not send SNI for IP addresses, so the default alias (the
    // remote host, 127.0.0.1) is served.
    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::from(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let mut tls = client_connector(&harness.ca)
        .connect(name, tcp)
        .await
        .unwrap();
    tls.write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
        .await
        .unwrap();

    let reply = timeout(WAIT, read_until(&mut tls, b"hello")).await.unwrap();
    assert!(reply.starts_with(b"HTTP/1.1 200 OK"));
    assert_eq!(harness.store.minted_len(), 1);

    harness.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_untrusted_client_handshake_fails() {
    let harness = intercepting_proxy().await;
    let addr = harness.server.start().await.unwrap();

    // A client trusting a different CA rejects the proxy's certificate.
    let stranger = CertificateAuthority::generate().unwrap();
    let tcp = TcpStream::connect(addr).await.unwrap();
    let result = client_connector(&stranger)
        .connect(ServerName::try_from("api.test").unwrap(), tcp)
        .await;
    assert!(result.is_err());

    assert!(harness.server.is_running());
    harness.server.stop().await.unwrap();
}
