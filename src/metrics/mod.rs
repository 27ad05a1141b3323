use std::sync::OnceLock;

use http::{HeaderMap, StatusCode};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::constants;
use crate::proxy::MirrorStatus;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels).expect("metric definition");
    if let Err(err) = registry().register(Box::new(counter.clone())) {
        log::warn!("register metric {name}: {err}");
    }
    counter
}

fn requests_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new("blobmirror_requests_total", "Total requests").expect("metric definition");
        if let Err(err) = registry().register(Box::new(counter.clone())) {
            log::warn!("register metric blobmirror_requests_total: {err}");
        }
        counter
    })
}

fn requests_code_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| counter_vec("blobmirror_requests_code_total", "Requests by status code", &["code"]))
}

fn cache_lookups_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| counter_vec("blobmirror_cache_lookups_total", "Cache lookups by result", &["status"]))
}

fn upstream_attempts_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        counter_vec(
            "blobmirror_upstream_attempts_total",
            "Mirror attempts by outcome",
            &["outcome"],
        )
    })
}

fn mirror_dead_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| counter_vec("blobmirror_mirror_dead_total", "Mirrors marked dead", &["mirror"]))
}

fn resurrections_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new("blobmirror_resurrections_total", "Times every mirror was revived")
            .expect("metric definition");
        if let Err(err) = registry().register(Box::new(counter.clone())) {
            log::warn!("register metric blobmirror_resurrections_total: {err}");
        }
        counter
    })
}

fn verify_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| counter_vec("blobmirror_verify_total", "Post-write verification results", &["result"]))
}

fn mirror_load_gauge() -> &'static IntGaugeVec {
    static METRIC: OnceLock<IntGaugeVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let gauge = IntGaugeVec::new(
            Opts::new("blobmirror_mirror_load", "In-flight requests per mirror"),
            &["mirror"],
        )
        .expect("metric definition");
        if let Err(err) = registry().register(Box::new(gauge.clone())) {
            log::warn!("register metric blobmirror_mirror_load: {err}");
        }
        gauge
    })
}

pub fn record(status: StatusCode) {
    requests_total().inc();
    let code = status.as_u16().to_string();
    requests_code_total().with_label_values(&[code.as_str()]).inc();
}

pub fn record_cache(status: &str) {
    cache_lookups_total().with_label_values(&[status]).inc();
}

pub fn record_attempt(outcome: &str) {
    upstream_attempts_total().with_label_values(&[outcome]).inc();
}

pub fn record_mirror_dead(mirror: &str) {
    mirror_dead_total().with_label_values(&[mirror]).inc();
}

pub fn record_resurrection() {
    resurrections_total().inc();
}

pub fn record_verify(result: &str) {
    verify_total().with_label_values(&[result]).inc();
}

pub fn render(mirrors: &[MirrorStatus]) -> String {
    let _ = requests_total();
    for mirror in mirrors {
        let load = i64::try_from(mirror.load).unwrap_or(i64::MAX);
        mirror_load_gauge().with_label_values(&[mirror.url.as_str()]).set(load);
    }
    let families = registry().gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&families, &mut buf).unwrap_or(());
    String::from_utf8(buf).unwrap_or_default()
}

pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(constants::PROTOCOL_REQUEST_ID_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(generate_request_id)
}

pub fn generate_request_id() -> String {
    let mut buf = [0u8; 16];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
