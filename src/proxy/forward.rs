use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;

use crate::body::{self, BodySender, ProxyBody};
use crate::config::Bootstrap;
use crate::constants;
use crate::logging;
use crate::metrics;
use crate::proxy::singleflight::{Flight, FlightGuard, Group};
use crate::proxy::{ForwardError, UpstreamSelector};
use crate::storage::{self, CacheError, CacheSink, CacheStore, Verification};
use crate::upstream::UpstreamClient;

const HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "transfer-encoding",
    "upgrade",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ForwarderSettings {
    pub max_attempts: usize,
    pub flight_wait: Duration,
    pub verify: bool,
    pub token_realm: String,
    pub token_service: String,
}

impl ForwarderSettings {
    pub fn from_config(cfg: &Bootstrap) -> Self {
        Self {
            max_attempts: cfg.upstream.max_attempts.max(1),
            flight_wait: cfg.storage.flight_wait,
            verify: cfg.storage.verify,
            token_realm: cfg.server.token_realm.clone(),
            token_service: cfg.server.token_service.clone(),
        }
    }
}

/// Serves blobs from the cache and everything else, plus cache misses, from
/// the mirror the selector picks.
pub struct Forwarder {
    selector: Arc<UpstreamSelector>,
    store: CacheStore,
    client: UpstreamClient,
    flights: Group,
    settings: ForwarderSettings,
}

impl Forwarder {
    pub fn new(
        selector: Arc<UpstreamSelector>,
        store: CacheStore,
        client: UpstreamClient,
        settings: ForwarderSettings,
    ) -> Self {
        Self {
            selector,
            store,
            client,
            flights: Group::new(),
            settings,
        }
    }

    pub fn selector(&self) -> &Arc<UpstreamSelector> {
        &self.selector
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn flights(&self) -> &Group {
        &self.flights
    }

    pub async fn forward(&self, method: Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> Response<ProxyBody> {
        let path = uri.path();
        let lookup = (method == Method::GET || method == Method::HEAD) && storage::is_cacheable(path);
        if !lookup {
            metrics::record_cache("bypass");
            return self.fetch(method, uri, headers, body, None, CacheStatus::Bypass).await;
        }

        let key = storage::key_for(path);
        logging::tag_key(&key);
        // A leased entry may be committed but not yet verified.
        if let Some(waiter) = self.flights.waiter(&key) {
            if !waiter.wait(self.settings.flight_wait).await {
                log::debug!("gave up waiting on in-flight fetch of {key}");
            }
        }
        if let Some(resp) = self.serve_hit(&method, &key).await {
            return resp;
        }
        metrics::record_cache("miss");
        if method != Method::GET {
            return self.fetch(method, uri, headers, body, None, CacheStatus::Miss).await;
        }

        let lease = match self.flights.join(&key) {
            Flight::Leader(guard) => {
                // Another leader may have committed between the lookup and the join.
                if let Some(resp) = self.serve_hit(&method, &key).await {
                    return resp;
                }
                Some(guard)
            }
            Flight::Follower(waiter) => {
                if !waiter.wait(self.settings.flight_wait).await {
                    log::debug!("gave up waiting on in-flight fetch of {key}");
                }
                if let Some(resp) = self.serve_hit(&method, &key).await {
                    return resp;
                }
                self.flights.try_lead(&key)
            }
        };
        self.fetch(method, uri, headers, body, lease, CacheStatus::Miss).await
    }

    /// `PURGE`: drops the entry for a blob path.
    pub async fn purge(&self, path: &str) -> Response<ProxyBody> {
        if !storage::is_cacheable(path) {
            return text_response(StatusCode::NOT_FOUND, "not a blob path");
        }
        let key = storage::key_for(path);
        match self.store.remove(&key).await {
            Ok(true) => {
                log::info!("purged cache entry {key}");
                text_response(StatusCode::OK, "")
            }
            Ok(false) => text_response(StatusCode::NOT_FOUND, ""),
            Err(CacheError::InvalidKey(reason)) => {
                text_response(StatusCode::BAD_REQUEST, &format!("invalid cache key: {reason}"))
            }
            Err(err) => {
                log::error!("purge {key} failed: {err}");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "purge failed")
            }
        }
    }

    async fn serve_hit(&self, method: &Method, key: &str) -> Option<Response<ProxyBody>> {
        let object = match self.store.read(key).await {
            Ok(object) => object,
            Err(CacheError::NotFound(_)) | Err(CacheError::InvalidKey(_)) => return None,
            Err(err) => {
                log::warn!("cache read {key} failed, going upstream: {err}");
                return None;
            }
        };
        metrics::record_cache("hit");
        log::debug!("cache hit {key}: {} bytes in {} file(s)", object.size(), object.parts());

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(object.size()));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        if let Ok(digest) = HeaderValue::from_str(&format!("{}{key}", constants::DIGEST_MARKER)) {
            headers.insert(constants::DOCKER_CONTENT_DIGEST, digest);
        }
        headers.insert(
            constants::PROTOCOL_CACHE_STATUS_KEY,
            HeaderValue::from_static(CacheStatus::Hit.as_str()),
        );

        let body = if *method == Method::HEAD {
            body::empty()
        } else {
            body::from_object(object)
        };
        let mut resp = Response::new(body);
        *resp.headers_mut() = headers;
        Some(resp)
    }

    async fn fetch(
        &self,
        method: Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
        lease: Option<FlightGuard>,
        status: CacheStatus,
    ) -> Response<ProxyBody> {
        let outbound = forward_headers(headers);
        let resp = match self.send_with_retry(&method, uri, &outbound, body).await {
            Ok(resp) => resp,
            Err(err) => {
                log::warn!("{method} {uri}: {err}");
                return text_response(err.status(), &err.to_string());
            }
        };

        let (mut parts, incoming) = resp.into_parts();
        self.rewrite_challenge(&mut parts.headers);
        parts.headers.insert(
            constants::PROTOCOL_CACHE_STATUS_KEY,
            HeaderValue::from_static(status.as_str()),
        );
        let declared = content_length(&parts.headers);

        if method == Method::HEAD {
            return Response::from_parts(parts, body::empty());
        }

        let tee = match lease {
            Some(lease) if method == Method::GET && parts.status == StatusCode::OK => {
                let key = lease.key().to_string();
                match self.store.begin_write(&key, declared).await {
                    Ok(sink) => Some(Tee {
                        sink,
                        lease,
                        store: self.store.clone(),
                        verify: self.settings.verify,
                    }),
                    Err(err) => {
                        log::warn!("cache write for {key} not started: {err}");
                        None
                    }
                }
            }
            _ => None,
        };

        let expected = tee.as_ref().and(declared);
        let (sender, body) = body::channel();
        tokio::spawn(logging::within(logging::current(), pump(incoming, sender, tee, expected)));
        Response::from_parts(parts, body)
    }

    /// Tries mirrors until one answers with something other than a 404.
    async fn send_with_retry(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Incoming>, ForwardError> {
        let max_attempts = self.settings.max_attempts;
        for attempt in 1..=max_attempts {
            let Some(mirror) = self.selector.acquire() else {
                return Err(ForwardError::Unavailable);
            };
            logging::tag_mirror(&mirror);
            let target = match upstream_uri(&mirror, uri) {
                Ok(target) => target,
                Err(err) => {
                    log::warn!("mirror {mirror} yields no usable uri for {uri}: {err}");
                    metrics::record_attempt("error");
                    self.selector.mark_dead(&mirror);
                    continue;
                }
            };
            let started = Instant::now();
            match self.client.send(method.clone(), target, headers, body.clone()).await {
                Err(err) => {
                    log::warn!("attempt {attempt}/{max_attempts} via {mirror} failed: {err:#}");
                    metrics::record_attempt("error");
                    self.selector.mark_dead(&mirror);
                }
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                    log::info!("attempt {attempt}/{max_attempts}: {mirror} has no {}", uri.path());
                    metrics::record_attempt("not_found");
                    self.selector.mark_dead(&mirror);
                }
                Ok(resp) => {
                    let declared = content_length(resp.headers()).unwrap_or(0);
                    self.selector.release(&mirror, started.elapsed(), declared);
                    metrics::record_attempt("ok");
                    log::debug!("{method} {} answered {} by {mirror}", uri.path(), resp.status());
                    return Ok(resp);
                }
            }
        }
        Err(ForwardError::Exhausted(max_attempts))
    }

    fn rewrite_challenge(&self, headers: &mut HeaderMap) {
        if !headers.contains_key(header::WWW_AUTHENTICATE) {
            return;
        }
        let challenge = format!(
            "Bearer realm=\"{}\",service=\"{}\"",
            self.settings.token_realm, self.settings.token_service
        );
        match HeaderValue::from_str(&challenge) {
            Ok(value) => {
                headers.insert(header::WWW_AUTHENTICATE, value);
            }
            Err(err) => log::warn!("token realm is not a valid header value: {err}"),
        }
    }
}

/// The cache half of a streamed response. Holds the flight lease until the
/// entry is committed and checked.
struct Tee {
    sink: CacheSink,
    lease: FlightGuard,
    store: CacheStore,
    verify: bool,
}

impl Tee {
    async fn abort(self) {
        let key = self.sink.key().to_string();
        if let Err(err) = self.sink.abort().await {
            log::warn!("cleanup of partial entry {key} failed: {err}");
        }
    }

    async fn commit(self) {
        let Tee {
            sink,
            lease,
            store,
            verify,
        } = self;
        let key = lease.key().to_string();
        let committed = match sink.finish().await {
            Ok(committed) => committed,
            Err(err) => {
                log::warn!("commit of cache entry {key} failed: {err}");
                return;
            }
        };
        log::info!(
            "cached {key}: {} bytes in {} file(s)",
            committed.total_size,
            committed.parts
        );
        if !verify {
            return;
        }
        match store.verify(&key).await {
            Ok(result) => {
                metrics::record_verify(result.as_str());
                if result == Verification::Corrupt {
                    log::warn!("cache entry {key} failed digest check and was removed");
                }
            }
            Err(err) => {
                metrics::record_verify("error");
                log::warn!("verify {key} failed: {err}");
            }
        }
        drop(lease);
    }
}

/// Copies the upstream body to the client, feeding the cache on the way.
async fn pump(mut incoming: Incoming, mut sender: BodySender, mut tee: Option<Tee>, expected: Option<u64>) {
    let mut streamed = 0u64;
    while let Some(frame) = incoming.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("upstream body broke after {streamed} bytes: {err}");
                if let Some(tee) = tee.take() {
                    tee.abort().await;
                }
                sender.fail(io::Error::other(err)).await;
                return;
            }
        };
        let Ok(data) = frame.into_data() else {
            continue;
        };
        streamed += data.len() as u64;

        let write_err = match tee.as_mut() {
            Some(tee) => tee.sink.write(&data).await.err(),
            None => None,
        };
        if let Some(err) = write_err {
            log::warn!("cache write failed, continuing uncached: {err}");
            if let Some(tee) = tee.take() {
                tee.abort().await;
            }
        }

        if sender.send(data).await.is_err() {
            log::debug!("client went away after {streamed} bytes");
            if let Some(tee) = tee.take() {
                tee.abort().await;
            }
            return;
        }
    }

    if let Some(expected) = expected {
        if streamed < expected {
            log::warn!("upstream body ended at {streamed} of {expected} bytes");
            if let Some(tee) = tee.take() {
                tee.abort().await;
            }
            let err = io::Error::new(io::ErrorKind::UnexpectedEof, "upstream body truncated");
            sender.fail(err).await;
            return;
        }
    }
    drop(sender);

    if let Some(tee) = tee {
        tee.commit().await;
    }
}

fn forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if is_hop_header(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn is_hop_header(name: &HeaderName) -> bool {
    HOP_HEADERS.contains(&name.as_str())
}

fn upstream_uri(mirror: &str, uri: &Uri) -> Result<Uri, http::uri::InvalidUri> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{mirror}{path}").parse()
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(body::full(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
