//! HTTP relay: frontend server leg, backend client leg.
//!
//! Per accepted connection:
//!
//! 1. Connect the backend socket (from the via address) and, if configured,
//!    perform the upstream TLS handshake. Nothing is read from the client
//!    until this succeeds; on failure the client connection is dropped.
//! 2. Optionally terminate TLS toward the client, choosing the certificate
//!    from SNI.
//! 3. Serve HTTP/1.1 to the client. Every request is aggregated (capped at
//!    [`MAX_AGGREGATED_BYTES`]), published, and forwarded; the aggregated
//!    response is published and returned.

use super::binding::connect_backend;
use super::error::{ProxyError, ProxyResult};
use super::pump::EventPump;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1::SendRequest;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, trace};

/// Largest request or response body the relay aggregates.
pub const MAX_AGGREGATED_BYTES: usize = 1024 * 1024;

/// Shared, immutable state of an HTTP relay.
pub struct HttpPipeline {
    remote_addr: SocketAddr,
    via_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    upstream: Option<(TlsConnector, ServerName<'static>)>,
    pump: EventPump,
}

impl HttpPipeline {
    pub(crate) fn new(
        remote_addr: SocketAddr,
        via_addr: SocketAddr,
        acceptor: Option<TlsAcceptor>,
        upstream: Option<(TlsConnector, ServerName<'static>)>,
        pump: EventPump,
    ) -> Self {
        Self {
            remote_addr,
            via_addr,
            acceptor,
            upstream,
            pump,
        }
    }

    /// Relay one client connection.
    pub async fn serve(&self, stream: TcpStream, peer: SocketAddr) -> ProxyResult<()> {
        let backend = connect_backend(self.via_addr, self.remote_addr).await?;
        debug!("{} -> backend {} connected", peer, self.remote_addr);

        let sender = match &self.upstream {
            Some((connector, name)) => {
                let tls = connector
                    .connect(name.clone(), backend)
                    .await
                    .map_err(|e| ProxyError::RelayEstablishment {
                        addr: self.remote_addr.to_string(),
                        message: e.to_string(),
                    })?;
                client_handshake(tls).await?
            }
            None => client_handshake(backend).await?,
        };

        let relay = Arc::new(Relay {
            sender: Mutex::new(sender),
            pump: self.pump.clone(),
        });

        match &self.acceptor {
            Some(acceptor) => {
                let tls = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| ProxyError::Handshake(e.to_string()))?;
                trace!("{} TLS established", peer);
                serve_frontend(tls, relay).await
            }
            None => serve_frontend(stream, relay).await,
        }
    }
}

/// Backend half of one relayed connection.
struct Relay {
    sender: Mutex<SendRequest<Full<Bytes>>>,
    pump: EventPump,
}

impl Relay {
    async fn forward(&self, req: Request<Incoming>) -> ProxyResult<Response<Full<Bytes>>> {
        let (mut parts, body) = req.into_parts();
        let body = aggregate(body).await?;
        reframe(&mut parts.headers, body.len());

        let req = self.pump.request(Request::from_parts(parts, Full::new(body)));

        let resp = {
            let mut sender = self.sender.lock().await;
            sender.ready().await?;
            let resp = sender.send_request(req).await?;
            let (mut parts, body) = resp.into_parts();
            let body = aggregate(body).await?;
            reframe(&mut parts.headers, body.len());
            Response::from_parts(parts, Full::new(body))
        };

        Ok(self.pump.response(resp))
    }
}

async fn client_handshake<T>(io: T) -> ProxyResult<SendRequest<Full<Bytes>>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(io))
        .await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Backend connection ended: {}", e);
        }
    });

    Ok(sender)
}

async fn serve_frontend<T>(io: T, relay: Arc<Relay>) -> ProxyResult<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let relay = relay.clone();
        async move { relay.forward(req).await }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(io), service)
        .await
        .map_err(ProxyError::from)
}

/// Collect a body, failing once it exceeds [`MAX_AGGREGATED_BYTES`].
async fn aggregate<B>(body: B) -> ProxyResult<Bytes>
where
    B: Body<Data = Bytes, Error = hyper::Error>,
{
    match Limited::new(body, MAX_AGGREGATED_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(ProxyError::OversizedMessage {
            limit: MAX_AGGREGATED_BYTES,
        }),
        Err(e) => match e.downcast::<hyper::Error>() {
            Ok(e) => Err(ProxyError::Http(*e)),
            Err(e) => Err(ProxyError::InvalidMessage(e.to_string())),
        },
    }
}

/// Replace chunked framing with a fixed length after aggregation.
fn reframe(headers: &mut HeaderMap, len: usize) {
    if headers.remove(TRANSFER_ENCODING).is_some() {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    }
}
