use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::config;

/// HTTP(S) client used to reach mirrors. Responses come back with their
/// body still streaming.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    response_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(cfg: &config::Upstream) -> Result<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(false);
        connector.set_connect_timeout(Some(cfg.connect_timeout));
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .context("load native tls roots")?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);
        let mut builder = Client::builder(TokioExecutor::new());
        if cfg.max_idle_conns_per_host > 0 {
            builder.pool_max_idle_per_host(cfg.max_idle_conns_per_host);
        }
        Ok(Self {
            client: builder.build(https),
            response_timeout: cfg.response_timeout,
        })
    }

    /// Sends one request and waits for the response head.
    pub async fn send(
        &self,
        method: Method,
        uri: Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Incoming>> {
        let mut req = Request::builder().method(method).uri(&uri);
        for (k, v) in headers.iter() {
            req = req.header(k, v);
        }
        let req = req.body(Full::new(body)).context("build upstream request")?;
        match tokio::time::timeout(self.response_timeout, self.client.request(req)).await {
            Ok(resp) => resp.with_context(|| format!("upstream request {uri}")),
            Err(_) => Err(anyhow!("upstream {uri} timed out after {:?}", self.response_timeout)),
        }
    }
}
