use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const MIB: u64 = 1024 * 1024;
pub const DEFAULT_SPLIT_THRESHOLD: u64 = 100 * MIB;
pub const DEFAULT_CHUNK_SIZE: u64 = 100 * MIB;
pub const DEFAULT_MAX_ATTEMPTS: usize = 6;
pub const DEFAULT_MAX_REQUEST_BODY: u64 = 256 * MIB;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub upstream: Upstream,
    #[serde(default)]
    pub storage: Storage,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.upstream.address.iter().all(|a| a.trim().is_empty()) {
            return Err(anyhow!("upstream.address must not be empty"));
        }
        if self.server.max_request_body == 0 {
            return Err(anyhow!("server.max_request_body must be greater than zero"));
        }
        if self.upstream.max_attempts == 0 {
            return Err(anyhow!("upstream.max_attempts must be at least 1"));
        }
        if self.storage.chunk_size == 0 {
            return Err(anyhow!("storage.chunk_size must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    /// Stamp request id, blob key and mirror on each line.
    #[serde(default)]
    pub traceid: bool,
    /// Rotate the log file once it grows past this many MiB.
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Realm advertised in rewritten `WWW-Authenticate` challenges.
    #[serde(default = "default_token_realm")]
    pub token_realm: String,
    #[serde(default = "default_token_service")]
    pub token_service: String,
    #[serde(default)]
    pub access_log: Option<ServerAccessLog>,
    /// Largest inbound request body buffered for replay, in bytes. Larger
    /// bodies are refused with 413.
    #[serde(default = "default_max_request_body")]
    pub max_request_body: u64,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            token_realm: default_token_realm(),
            token_service: default_token_service(),
            access_log: None,
            max_request_body: default_max_request_body(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerAccessLog {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct Upstream {
    #[serde(default)]
    pub address: Vec<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// How many times one acquire may revive every mirror before giving up.
    #[serde(default = "default_max_resurrections")]
    pub max_resurrections: usize,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Upper bound on waiting for a mirror's response head.
    #[serde(default = "default_response_timeout", with = "humantime_serde")]
    pub response_timeout: Duration,
    #[serde(default)]
    pub max_idle_conns_per_host: usize,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            address: Vec::new(),
            max_attempts: default_max_attempts(),
            max_resurrections: default_max_resurrections(),
            connect_timeout: default_connect_timeout(),
            response_timeout: default_response_timeout(),
            max_idle_conns_per_host: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Storage {
    #[serde(default = "default_cache_path")]
    pub path: String,
    #[serde(default = "default_split_threshold")]
    pub split_threshold: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default = "default_flight_wait", with = "humantime_serde")]
    pub flight_wait: Duration,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            split_threshold: default_split_threshold(),
            chunk_size: default_chunk_size(),
            verify: true,
            flight_wait: default_flight_wait(),
        }
    }
}

fn default_addr() -> String {
    ":23000".to_string()
}

fn default_token_realm() -> String {
    "http://127.0.0.1:23000/token".to_string()
}

fn default_token_service() -> String {
    "registry.docker.io".to_string()
}

fn default_max_request_body() -> u64 {
    DEFAULT_MAX_REQUEST_BODY
}

fn default_max_attempts() -> usize {
    DEFAULT_MAX_ATTEMPTS
}

fn default_max_resurrections() -> usize {
    1
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_cache_path() -> String {
    "cache".to_string()
}

fn default_split_threshold() -> u64 {
    DEFAULT_SPLIT_THRESHOLD
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_flight_wait() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    parse(&raw).with_context(|| format!("parse config {}", path.display()))
}

pub fn parse(raw: &str) -> Result<(Bootstrap, Vec<String>)> {
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })?;
    Ok((cfg, ignored))
}
