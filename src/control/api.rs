//! Request routing for the control API.

use super::error::ControlError;
use super::stream;
use crate::component::{Component, ComponentRegistry, RegistryError};
use crate::config::ComponentConfig;
use crate::event::Event;
use crate::proxy::{ProxyEnv, ProxyServer};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Largest request body accepted by the API.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// One entry of `GET /component/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentSummary {
    /// Component id.
    pub id: Uuid,
    /// Component kind, e.g. `proxy_server`.
    pub kind: String,
    /// Attached script URLs.
    pub scripts: Vec<String>,
}

impl ComponentSummary {
    fn of(component: &dyn Component) -> Self {
        Self {
            id: component.id(),
            kind: component.kind().to_string(),
            scripts: component.scripts().to_vec(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Added {
    id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    listening: Option<SocketAddr>,
}

#[derive(Debug, Serialize)]
struct Removed {
    id: Uuid,
}

#[derive(Debug, Serialize)]
struct Failure {
    error: String,
}

type ApiResponse = Response<Full<Bytes>>;

/// HTTP front end over a [`ComponentRegistry`].
pub struct ControlServer {
    registry: Arc<ComponentRegistry>,
    env: ProxyEnv,
}

impl ControlServer {
    /// Serve `registry`; components added through the API get `env`.
    pub fn new(registry: Arc<ComponentRegistry>, env: ProxyEnv) -> Self {
        Self { registry, env }
    }

    /// Bind `addr` and serve until `shutdown` flips to true.
    ///
    /// Returns the bound address and the accept task.
    pub async fn spawn(
        self,
        addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(SocketAddr, JoinHandle<()>), ControlError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ControlError::Bind { addr, source })?;
        let local = listener.local_addr()?;
        info!("Control API listening on {}", local);

        let state = Arc::new(State {
            registry: self.registry,
            env: self.env,
            shutdown: shutdown.clone(),
        });
        let task = tokio::spawn(accept_loop(listener, state, shutdown));
        Ok((local, task))
    }
}

struct State {
    registry: Arc<ComponentRegistry>,
    env: ProxyEnv,
    shutdown: watch::Receiver<bool>,
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<State>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, peer) = match accept_result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Control API accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                let state = state.clone();
                tokio::spawn(
                    async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let state = state.clone();
                            async move { Ok::<_, Infallible>(handle(&state, req).await) }
                        });
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .with_upgrades()
                            .await
                        {
                            debug!("Control connection ended: {}", e);
                        }
                    }
                    .instrument(tracing::debug_span!("control", peer = %peer)),
                );
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Control API shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle(state: &State, req: Request<Incoming>) -> ApiResponse {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    debug!("{} {}", method, path);

    match path.trim_end_matches('/') {
        "/component" => match method {
            Method::POST => add_component(state, req).await,
            Method::GET => list_components(state),
            _ => not_allowed("GET, POST"),
        },
        "/message" => match method {
            Method::POST => publish(state, req).await,
            Method::GET => stream::upgrade(req, state.registry.bus(), state.shutdown.clone()),
            _ => not_allowed("GET, POST"),
        },
        other => match other.strip_prefix("/component/") {
            Some(id) if method == Method::DELETE => remove_component(state, id).await,
            Some(_) => not_allowed("DELETE"),
            None => failure(StatusCode::NOT_FOUND, format!("No route for {}", path)),
        },
    }
}

async fn add_component(state: &State, req: Request<Incoming>) -> ApiResponse {
    let body = match read_body(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let config: ComponentConfig = match serde_json::from_slice(&body) {
        Ok(config) => config,
        Err(e) => return failure(StatusCode::BAD_REQUEST, format!("Invalid component: {}", e)),
    };

    let ComponentConfig::ProxyServer(proxy) = config;
    let server = match ProxyServer::from_config(&proxy, "component", state.env.clone()) {
        Ok(server) => Arc::new(server),
        Err(e) => return failure(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let id = server.id();

    match state.registry.add(server.clone()).await {
        Ok(()) => {}
        Err(e @ RegistryError::DuplicateId(_)) => {
            return failure(StatusCode::CONFLICT, e.to_string());
        }
        Err(e) => return failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }

    let listening = if proxy.autostart {
        match server.start().await {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!("Component {} added but failed to start: {}", id, e);
                None
            }
        }
    } else {
        None
    };

    json(StatusCode::OK, &Added { id, listening })
}

async fn remove_component(state: &State, raw_id: &str) -> ApiResponse {
    let id = match Uuid::parse_str(raw_id) {
        Ok(id) => id,
        Err(e) => {
            return failure(
                StatusCode::BAD_REQUEST,
                format!("Invalid component id '{}': {}", raw_id, e),
            )
        }
    };

    let component = match state.registry.remove(id) {
        Ok(component) => component,
        Err(e @ RegistryError::NotFound(_)) => return failure(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => return failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    if let Some(controls) = component.controls() {
        if let Err(e) = controls.stop().await {
            warn!("Failed to stop removed component {}: {}", id, e);
        }
    }

    json(StatusCode::OK, &Removed { id })
}

fn list_components(state: &State) -> ApiResponse {
    let mut summaries: Vec<ComponentSummary> = state
        .registry
        .components()
        .iter()
        .map(|component| ComponentSummary::of(component.as_ref()))
        .collect();
    summaries.sort_by_key(|summary| summary.id);
    json(StatusCode::OK, &summaries)
}

async fn publish(state: &State, req: Request<Incoming>) -> ApiResponse {
    let body = match read_body(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    match serde_json::from_slice::<Event>(&body) {
        Ok(event) => {
            debug!("Publishing {} from {}", event.kind(), event.emitter_id);
            state.registry.bus().publish(event);
            Response::new(Full::new(Bytes::new()))
        }
        Err(e) => failure(StatusCode::BAD_REQUEST, format!("Invalid event: {}", e)),
    }
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, ApiResponse> {
    match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(failure(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("Body exceeds {} bytes", MAX_BODY_BYTES),
        )),
        Err(e) => Err(failure(StatusCode::BAD_REQUEST, e.to_string())),
    }
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> ApiResponse {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(e) => {
            error!("Failed to encode response: {}", e);
            let mut resp = Response::new(Full::new(Bytes::new()));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return resp;
        }
    };
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn failure(status: StatusCode, error: String) -> ApiResponse {
    debug!("Control request failed ({}): {}", status, error);
    json(status, &Failure { error })
}

fn not_allowed(allow: &'static str) -> ApiResponse {
    let mut resp = failure(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string());
    resp.headers_mut()
        .insert(ALLOW, HeaderValue::from_static(allow));
    resp
}
