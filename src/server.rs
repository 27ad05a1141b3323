use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use http::header::{self, HeaderValue};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::access_log::{AccessLogger, RequestObserver, RequestRecord};
use crate::body::{self, ProxyBody};
use crate::config::{Bootstrap, DEFAULT_MAX_REQUEST_BODY};
use crate::constants;
use crate::logging;
use crate::metrics;
use crate::proxy::forward::text_response;
use crate::proxy::{Forwarder, ForwarderSettings, UpstreamSelector};
use crate::storage::CacheStore;
use crate::upstream::UpstreamClient;

/// Everything a request handler needs. Built once at startup.
pub struct AppState {
    forwarder: Arc<Forwarder>,
    observer: Option<Arc<dyn RequestObserver>>,
    max_request_body: usize,
}

impl AppState {
    pub fn new(forwarder: Arc<Forwarder>, observer: Option<Arc<dyn RequestObserver>>) -> Self {
        Self {
            forwarder,
            observer,
            max_request_body: usize::try_from(DEFAULT_MAX_REQUEST_BODY).unwrap_or(usize::MAX),
        }
    }

    pub fn with_max_request_body(mut self, limit: u64) -> Self {
        self.max_request_body = usize::try_from(limit).unwrap_or(usize::MAX);
        self
    }

    pub async fn from_config(cfg: &Bootstrap) -> Result<Self> {
        let selector = Arc::new(UpstreamSelector::new(cfg.upstream.max_resurrections));
        for address in &cfg.upstream.address {
            selector.register(address);
        }
        log::info!("registered {} upstream mirror(s)", selector.len());

        let store = CacheStore::from_config(&cfg.storage);
        store
            .init()
            .await
            .with_context(|| format!("create cache dir {}", cfg.storage.path))?;
        let client = UpstreamClient::new(&cfg.upstream)?;
        let forwarder = Forwarder::new(selector, store, client, ForwarderSettings::from_config(cfg));
        Ok(Self::new(Arc::new(forwarder), build_access_logger(cfg)?)
            .with_max_request_body(cfg.server.max_request_body))
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }
}

pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let state = Arc::new(AppState::from_config(&cfg).await?);
    let addr = listen_addr(&cfg.server.addr);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    log::info!("listening on {}", listener.local_addr().context("local addr")?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx);
    serve(listener, state, shutdown_rx).await?;
    log::info!("shutting down");
    Ok(())
}

/// Accepts connections until `shutdown` flips. Connections already
/// accepted run to completion on their own tasks.
pub async fn serve(listener: TcpListener, state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        continue;
                    }
                };
                if let Err(err) = stream.set_nodelay(true) {
                    log::debug!("set_nodelay for {peer}: {err}");
                }
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&state), peer));
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("connection from {peer} closed: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();
        tokio::select! {
            _ = async {
                match sigterm.as_mut() {
                    Some(sig) => { let _ = sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => log::info!("received SIGTERM"),
            _ = async {
                match sigint.as_mut() {
                    Some(sig) => { let _ = sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => log::info!("received SIGINT"),
        }
        let _ = shutdown.send(true);
    });
}

fn build_access_logger(cfg: &Bootstrap) -> Result<Option<Arc<dyn RequestObserver>>> {
    let Some(access_log) = cfg.server.access_log.as_ref().filter(|a| a.enabled) else {
        return Ok(None);
    };
    let logger = AccessLogger::new(Some(access_log.path.as_str()))?;
    Ok(Some(Arc::new(logger)))
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<AppState>,
    peer: SocketAddr,
) -> Result<Response<ProxyBody>, Infallible> {
    let started = Instant::now();
    let request_id = metrics::request_id_from_headers(req.headers());
    let method = req.method().clone();
    let uri = req.uri().to_string();
    let client = client_ip(&peer.ip().to_string(), req.headers());

    let mut resp = logging::scope(request_id.clone(), route(req, &state)).await;
    if let Ok(val) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(constants::PROTOCOL_REQUEST_ID_KEY, val);
    }
    metrics::record(resp.status());

    if let Some(observer) = &state.observer {
        let cache_status = resp
            .headers()
            .get(constants::PROTOCOL_CACHE_STATUS_KEY)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        observer.observe(&RequestRecord {
            client,
            method,
            uri,
            status: resp.status(),
            cache_status,
            duration: started.elapsed(),
            request_id,
        });
    }
    Ok(resp)
}

async fn route(req: Request<Incoming>, state: &AppState) -> Response<ProxyBody> {
    let path = req.uri().path().to_string();
    if let Some(endpoint) = path.strip_prefix(constants::INTERNAL_PATH_PREFIX) {
        return handle_internal(endpoint, state);
    }
    if req.method().as_str() == "PURGE" {
        return state.forwarder.purge(&path).await;
    }

    let (parts, incoming) = req.into_parts();
    let declared = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > state.max_request_body as u64) {
        return text_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
    }
    let body = match Limited::new(incoming, state.max_request_body).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            return text_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
        Err(err) => {
            log::warn!("reading request body for {path}: {err}");
            return text_response(StatusCode::BAD_REQUEST, "unreadable request body");
        }
    };
    state
        .forwarder
        .forward(parts.method, &parts.uri, &parts.headers, body)
        .await
}

fn handle_internal(endpoint: &str, state: &AppState) -> Response<ProxyBody> {
    match endpoint {
        "healthz" => text_response(StatusCode::OK, "ok"),
        "version" => json_response(&build_info()),
        "metrics" => {
            let snapshot = state.forwarder.selector().snapshot();
            text_response(StatusCode::OK, &metrics::render(&snapshot))
        }
        "upstreams" => json_response(&state.forwarder.selector().snapshot()),
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

#[derive(Debug, Serialize)]
struct BuildInfo {
    name: &'static str,
    version: &'static str,
    commit: &'static str,
}

fn build_info() -> BuildInfo {
    BuildInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_REV").unwrap_or("unknown"),
    }
}

fn json_response<T: Serialize>(payload: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(payload) {
        Ok(bytes) => {
            let mut resp = Response::new(body::full(bytes));
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json; charset=utf-8"),
            );
            resp
        }
        Err(err) => {
            log::error!("encode json response: {err}");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode")
        }
    }
}

fn client_ip(remote_addr: &str, headers: &HeaderMap) -> String {
    headers
        .get("X-Real-IP")
        .or_else(|| headers.get("X-Forwarded-For"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| remote_addr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_listens_on_all_interfaces() {
        assert_eq!(listen_addr(":23000"), "0.0.0.0:23000");
        assert_eq!(listen_addr("127.0.0.1:8080"), "127.0.0.1:8080");
    }

    #[test]
    fn forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip("10.0.0.1", &headers), "10.0.0.1");
        headers.insert("X-Forwarded-For", HeaderValue::from_static("192.0.2.7, 10.0.0.2"));
        assert_eq!(client_ip("10.0.0.1", &headers), "192.0.2.7");
    }
}
