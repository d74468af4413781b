//! Script locations and retrieval.
//!
//! A script is named by a URL. `file:` URLs and bare paths are read from
//! disk; `http:` and `https:` URLs are fetched with a single GET.

use super::error::ScriptError;
use crate::tls::server_name;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, LengthLimitError, Limited};
use hyper::header::{HOST, USER_AGENT};
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::{Host, Position, Url};

/// Largest script body accepted from a remote URL.
pub const MAX_SCRIPT_BYTES: usize = 1024 * 1024;

/// Where a script lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptLocation {
    /// A local file.
    File(PathBuf),
    /// An `http` or `https` URL.
    Remote(Url),
}

impl ScriptLocation {
    /// Classify a script URL.
    ///
    /// Strings without a scheme are relative or absolute file paths.
    pub fn parse(raw: &str) -> Result<Self, ScriptError> {
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                return Ok(ScriptLocation::File(PathBuf::from(raw)));
            }
            Err(e) => return Err(ScriptError::InvalidUrl(format!("{}: {}", raw, e))),
        };

        match url.scheme() {
            "file" => url
                .to_file_path()
                .map(ScriptLocation::File)
                .map_err(|_| ScriptError::InvalidUrl(raw.to_string())),
            "http" | "https" => Ok(ScriptLocation::Remote(url)),
            // A Windows drive letter parses as a one-letter scheme.
            scheme if scheme.len() == 1 => Ok(ScriptLocation::File(PathBuf::from(raw))),
            _ => Err(ScriptError::UnsupportedUrl(raw.to_string())),
        }
    }
}

/// Reads script source from files and web servers.
#[derive(Clone, Default)]
pub struct ScriptFetcher {
    tls: Option<TlsConnector>,
}

impl ScriptFetcher {
    /// Fetcher for files and plain `http` URLs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also fetch `https` URLs through `connector`.
    pub fn with_tls(mut self, connector: TlsConnector) -> Self {
        self.tls = Some(connector);
        self
    }

    /// Read the source behind a script URL.
    pub async fn fetch(&self, raw: &str) -> Result<String, ScriptError> {
        match ScriptLocation::parse(raw)? {
            ScriptLocation::File(path) => tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| ScriptError::Read { path, source }),
            ScriptLocation::Remote(url) => self.fetch_remote(&url).await,
        }
    }

    async fn fetch_remote(&self, url: &Url) -> Result<String, ScriptError> {
        let fetch_error = |message: String| ScriptError::Fetch {
            url: url.to_string(),
            message,
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(ScriptError::InvalidUrl(url.to_string())),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ScriptError::InvalidUrl(url.to_string()))?;
        let authority = &url[Position::BeforeHost..Position::AfterPort];

        // host_str keeps IPv6 brackets, which the socket address parser needs.
        let target = format!("{}:{}", url.host_str().unwrap_or_default(), port);
        let stream = TcpStream::connect(target)
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        let body = if url.scheme() == "https" {
            let connector = self
                .tls
                .as_ref()
                .ok_or_else(|| fetch_error("no TLS connector for https scripts".to_string()))?;
            let name = server_name(&host).map_err(|e| fetch_error(e.to_string()))?;
            let tls = connector
                .connect(name, stream)
                .await
                .map_err(|e| fetch_error(e.to_string()))?;
            get(tls, url, authority).await
        } else {
            get(stream, url, authority).await
        };

        let body = body.map_err(fetch_error)?;
        debug!("Fetched {} byte(s) of script from {}", body.len(), url);
        String::from_utf8(body.to_vec()).map_err(|e| fetch_error(e.to_string()))
    }
}

/// Issue one GET over `io` and collect the body.
async fn get<T>(io: T, url: &Url, authority: &str) -> Result<Bytes, String>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| e.to_string())?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Script fetch connection ended: {}", e);
        }
    });

    let req = Request::get(&url[Position::BeforePath..Position::AfterQuery])
        .header(HOST, authority)
        .header(USER_AGENT, concat!("tapwire/", env!("CARGO_PKG_VERSION")))
        .body(Empty::<Bytes>::new())
        .map_err(|e| e.to_string())?;

    let resp = sender.send_request(req).await.map_err(|e| e.to_string())?;
    let status = resp.status();
    if !status.is_success() {
        return Err(format!("server answered {}", status));
    }

    match Limited::new(resp.into_body(), MAX_SCRIPT_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => {
            Err(format!("script exceeds {} bytes", MAX_SCRIPT_BYTES))
        }
        Err(e) => Err(e.to_string()),
    }
}
