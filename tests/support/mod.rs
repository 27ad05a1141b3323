#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blobmirror::config::Bootstrap;
use blobmirror::server::{self, AppState};
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::watch;

pub const DEAD_MIRROR: &str = "http://127.0.0.1:1";

#[derive(Clone, Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// False when the body stream ended with an error.
    pub complete: bool,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Clone)]
pub struct TestClient {
    proxy_addr: SocketAddr,
}

impl TestClient {
    pub fn new(proxy_addr: SocketAddr) -> Self {
        Self { proxy_addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.send(Method::GET, path, HeaderMap::new(), Bytes::new()).await
    }

    pub async fn send(&self, method: Method, path: &str, headers: HeaderMap, body: Bytes) -> TestResponse {
        let stream = tokio::net::TcpStream::connect(self.proxy_addr)
            .await
            .expect("connect proxy");
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, self.proxy_addr.to_string());
        for (k, v) in headers.iter() {
            builder = builder.header(k, v);
        }
        let req = builder.body(Full::new(body)).expect("request");

        let resp = sender.send_request(req).await.expect("send request");
        let status = resp.status();
        let headers = resp.headers().clone();
        let (body, complete) = match resp.into_body().collect().await {
            Ok(collected) => (collected.to_bytes(), true),
            Err(_) => (Bytes::new(), false),
        };

        TestResponse {
            status,
            headers,
            body,
            complete,
        }
    }
}

type Handler = dyn Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync;

/// A stand-in registry mirror that counts the requests it answers.
pub struct MockServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        Self::start_delayed(Duration::ZERO, handler).await
    }

    /// Like [`MockServer::start`] but holds each response head back by `delay`.
    pub async fn start_delayed<F>(delay: Duration, handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler: Arc<Handler> = Arc::new(handler);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        let counter = Arc::clone(&counter);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                counter.fetch_add(1, Ordering::SeqCst);
                                let resp = handler(req);
                                async move {
                                    if !delay.is_zero() {
                                        tokio::time::sleep(delay).await;
                                    }
                                    Ok::<_, hyper::Error>(resp)
                                }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            hits,
            shutdown: Some(shutdown),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// The proxy under test, listening on an ephemeral port with its cache in a
/// temporary directory.
pub struct TestProxy {
    pub client: TestClient,
    pub state: Arc<AppState>,
    cache_dir: tempfile::TempDir,
    shutdown: watch::Sender<bool>,
}

impl TestProxy {
    pub async fn start(mirrors: &[String]) -> Self {
        Self::start_with(mirrors, |_| {}).await
    }

    pub async fn start_with<F>(mirrors: &[String], edit: F) -> Self
    where
        F: FnOnce(&mut Bootstrap),
    {
        let cache_dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = Bootstrap::default();
        cfg.upstream.address = mirrors.to_vec();
        cfg.upstream.connect_timeout = Duration::from_secs(2);
        cfg.upstream.response_timeout = Duration::from_secs(5);
        cfg.storage.path = cache_dir.path().to_string_lossy().into_owned();
        cfg.server.token_realm = "https://mirror.test/token".to_string();
        cfg.server.token_service = "mirror.test".to_string();
        edit(&mut cfg);

        let state = Arc::new(AppState::from_config(&cfg).await.expect("app state"));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, rx) = watch::channel(false);
        let serving = Arc::clone(&state);
        tokio::spawn(async move {
            let _ = server::serve(listener, serving, rx).await;
        });

        Self {
            client: TestClient::new(addr),
            state,
            cache_dir,
            shutdown,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        self.cache_dir.path()
    }

    pub fn cache_files(&self) -> Vec<String> {
        cache_files(self.cache_dir.path())
    }

    /// Waits until no cache write or verification is still holding a lease.
    pub async fn settle(&self) {
        let flights = self.state.forwarder().flights().clone();
        eventually(|| flights.in_flight() == 0).await;
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub fn cache_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.file_name().into_string().ok())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

pub async fn eventually<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..250 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 5s");
}

pub fn random_bytes(size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Random content and the blob path that names it.
pub fn blob(size: usize) -> (Vec<u8>, String, String) {
    let content = random_bytes(size);
    let digest = sha256_hex(&content);
    let path = format!("/v2/library/alpine/blobs/sha256:{digest}");
    (content, digest, path)
}

pub fn serve_bytes(content: Vec<u8>) -> impl Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync {
    let content = Bytes::from(content);
    move |_req: Request<Incoming>| {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", "application/octet-stream".parse().unwrap());
        headers.insert("Content-Length", content.len().to_string().parse().unwrap());
        build_response(StatusCode::OK, headers, content.clone())
    }
}

pub fn respond_status(status: StatusCode) -> impl Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync {
    move |_req: Request<Incoming>| build_response(status, HeaderMap::new(), Bytes::new())
}

pub fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (k, v) in headers.iter() {
        builder = builder.header(k, v);
    }
    builder.body(Full::new(body)).unwrap()
}

/// A mirror that promises `declared` bytes, sends `sent`, then hangs up.
pub async fn truncating_mirror(declared: usize, sent: usize) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind truncating mirror");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {declared}\r\n\r\n"
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(&vec![7u8; sent]).await;
                let _ = stream.flush().await;
            });
        }
    });
    format!("http://{addr}")
}

/// A mirror that promises `declared` bytes and dribbles them out `step`
/// bytes at a time, pausing `every` between writes.
pub async fn trickling_mirror(declared: usize, step: usize, every: Duration) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind trickling mirror");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {declared}\r\n\r\n"
                );
                if stream.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                let mut sent = 0;
                while sent < declared {
                    let n = step.min(declared - sent);
                    if stream.write_all(&vec![3u8; n]).await.is_err() {
                        return;
                    }
                    sent += n;
                    tokio::time::sleep(every).await;
                }
            });
        }
    });
    format!("http://{addr}")
}
