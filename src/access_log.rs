use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use http::{Method, StatusCode};

/// What the server knows about a request once its response head is ready.
#[derive(Clone, Debug)]
pub struct RequestRecord {
    pub client: String,
    pub method: Method,
    pub uri: String,
    pub status: StatusCode,
    pub cache_status: String,
    pub duration: Duration,
    pub request_id: String,
}

/// Optional per-request hook. Nothing in forwarding or caching depends on it.
pub trait RequestObserver: Send + Sync {
    fn observe(&self, record: &RequestRecord);
}

#[derive(Debug)]
pub struct AccessLogger {
    writer: Mutex<AccessWriter>,
}

#[derive(Debug)]
enum AccessWriter {
    File(std::fs::File),
    Stdout(std::io::Stdout),
}

impl AccessLogger {
    pub fn new(path: Option<&str>) -> Result<Self> {
        let writer = match path.filter(|p| !p.is_empty()) {
            Some(path) => {
                let path = Path::new(path);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create access log dir {}", parent.display()))?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("open access log {}", path.display()))?;
                AccessWriter::File(file)
            }
            None => AccessWriter::Stdout(std::io::stdout()),
        };
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }

    pub fn log_line(&self, line: &str) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = match &mut *writer {
                AccessWriter::File(file) => file.write_all(line.as_bytes()),
                AccessWriter::Stdout(stdout) => stdout.write_all(line.as_bytes()),
            };
        }
    }
}

impl RequestObserver for AccessLogger {
    fn observe(&self, record: &RequestRecord) {
        let fields = [
            normalize_field(&record.client),
            Local::now().format("[%d/%b/%Y:%H:%M:%S %z]").to_string(),
            normalize_field_replace(&format!("{} {}", record.method, record.uri)),
            record.status.as_u16().to_string(),
            normalize_field(&record.cache_status),
            record.duration.as_millis().to_string(),
            normalize_field(&record.request_id),
        ];
        self.log_line(&format!("{}\n", fields.join(" ")));
    }
}

fn normalize_field(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.to_string()
    }
}

fn normalize_field_replace(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.replace(' ', "+")
    }
}
