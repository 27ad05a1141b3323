use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use flexi_logger::{Cleanup, Criterion, DeferredNow, Duplicate, FileSpec, Logger as FlexiLogger, Naming, WriteMode};
use log::LevelFilter;
use tokio::task_local;

use crate::config::Logger;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";
const KEY_PREFIX_LEN: usize = 12;

static CONTEXT_FIELDS: AtomicBool = AtomicBool::new(false);

task_local! {
    static CONTEXT: Arc<RequestContext>;
}

/// Per-request fields stamped on every log line emitted while the request
/// is served: the request id, plus the blob key and mirror once known.
#[derive(Debug, Default)]
pub struct RequestContext {
    request_id: String,
    tags: Mutex<Tags>,
}

#[derive(Clone, Debug, Default)]
struct Tags {
    key: Option<String>,
    mirror: Option<String>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            tags: Mutex::default(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    fn tags(&self) -> Tags {
        self.tags.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn update(&self, f: impl FnOnce(&mut Tags)) {
        if let Ok(mut tags) = self.tags.lock() {
            f(&mut tags);
        }
    }

    fn render(&self) -> String {
        let tags = self.tags();
        let mut out = format!("req={}", self.request_id);
        if let Some(key) = tags.key {
            let short = key.get(..KEY_PREFIX_LEN).unwrap_or(&key);
            out.push_str(" key=");
            out.push_str(short);
        }
        if let Some(mirror) = tags.mirror {
            out.push_str(" mirror=");
            out.push_str(&mirror);
        }
        out
    }
}

pub fn init(config: &Logger, verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        parse_level(&config.level)
    };
    CONTEXT_FIELDS.store(config.traceid, Ordering::Relaxed);

    let mut logger = FlexiLogger::try_with_str(level.as_str())
        .context("init logger")?
        .duplicate_to_stderr(Duplicate::Warn)
        .format_for_stdout(format_line);

    if !config.path.trim().is_empty() {
        let spec = FileSpec::try_from(Path::new(&config.path))
            .with_context(|| format!("log path {}", config.path))?;
        let mut file_logger = logger.log_to_file(spec).format(format_line);
        if config.max_size > 0 {
            let cleanup = match config.max_backups {
                0 => Cleanup::Never,
                n => Cleanup::KeepLogFiles(n as usize),
            };
            file_logger = file_logger.rotate(Criterion::Size(config.max_size * 1024 * 1024), Naming::Numbers, cleanup);
        }
        logger = file_logger.write_mode(WriteMode::BufferAndFlush);
    }

    logger.start().context("start logger")?;
    Ok(())
}

fn parse_level(raw: &str) -> LevelFilter {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

fn format_line(writer: &mut dyn Write, now: &mut DeferredNow, record: &log::Record) -> std::io::Result<()> {
    let ts = now.now_utc_owned().format(TIMESTAMP_FORMAT);
    write!(writer, "{ts} {:<5}", record.level())?;
    if CONTEXT_FIELDS.load(Ordering::Relaxed) {
        if let Some(fields) = current().map(|ctx| ctx.render()) {
            write!(writer, " [{fields}]")?;
        }
    }
    writeln!(writer, " {}", record.args())
}

/// Runs `fut` inside a fresh request context for `request_id`.
pub async fn scope<T>(request_id: String, fut: impl Future<Output = T>) -> T {
    CONTEXT.scope(Arc::new(RequestContext::new(request_id)), fut).await
}

/// Runs `fut` inside `ctx`, typically one captured with [`current`] before
/// spawning a task that keeps serving the same request.
pub async fn within<T>(ctx: Option<Arc<RequestContext>>, fut: impl Future<Output = T>) -> T {
    match ctx {
        Some(ctx) => CONTEXT.scope(ctx, fut).await,
        None => fut.await,
    }
}

pub fn current() -> Option<Arc<RequestContext>> {
    CONTEXT.try_with(Arc::clone).ok()
}

/// Names the blob the current request is about.
pub fn tag_key(key: &str) {
    if let Some(ctx) = current() {
        ctx.update(|tags| tags.key = Some(key.to_string()));
    }
}

/// Names the mirror the current request is talking to.
pub fn tag_mirror(mirror: &str) {
    if let Some(ctx) = current() {
        ctx.update(|tags| tags.mirror = Some(mirror.to_string()));
    }
}
