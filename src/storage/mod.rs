use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{self, File};

use crate::config;

pub mod key;
pub mod layout;
pub mod object;
pub mod record;
pub mod sink;
pub mod verify;

pub use key::{is_cacheable, key_for};
pub use layout::Layout;
pub use object::CacheObject;
pub use record::Record;
pub use sink::{CacheSink, Committed, WriteMode};
pub use verify::Verification;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache entry not found: {0}")]
    NotFound(String),

    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Content-addressed blob cache on the local filesystem. Membership is
/// decided purely by which files exist; there is no index.
#[derive(Clone, Debug)]
pub struct CacheStore {
    layout: Layout,
    split_threshold: u64,
    chunk_size: u64,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, split_threshold: u64, chunk_size: u64) -> Self {
        Self {
            layout: Layout::new(root, chunk_size),
            split_threshold,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn from_config(cfg: &config::Storage) -> Self {
        Self::new(&cfg.path, cfg.split_threshold, cfg.chunk_size)
    }

    pub async fn init(&self) -> CacheResult<()> {
        fs::create_dir_all(self.layout.root()).await?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn split_threshold(&self) -> u64 {
        self.split_threshold
    }

    /// Unknown lengths are written split so no single file can outgrow the
    /// chunk size.
    pub fn mode_for(&self, declared_length: Option<u64>) -> WriteMode {
        match declared_length {
            Some(len) if len <= self.split_threshold => WriteMode::Flat,
            _ => WriteMode::Split,
        }
    }

    pub async fn begin_write(&self, key: &str, declared_length: Option<u64>) -> CacheResult<CacheSink> {
        key::validate(key)?;
        let mode = self.mode_for(declared_length);
        CacheSink::create(self.layout.clone(), key, mode, self.chunk_size).await
    }

    /// Opens a complete entry. A record that is unreadable or inconsistent,
    /// names a missing part, or whose parts do not add up to the recorded
    /// size reads as not-found.
    pub async fn read(&self, key: &str) -> CacheResult<CacheObject> {
        key::validate(key)?;
        match self.layout.load_record(key).await {
            Ok(Some(record)) => self.open_split(key, record).await,
            Ok(None) => {
                log::warn!("cache record for {key} is unreadable or inconsistent");
                Err(CacheError::NotFound(key.to_string()))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => self.open_flat(key).await,
            Err(err) => Err(err.into()),
        }
    }

    async fn open_split(&self, key: &str, record: Record) -> CacheResult<CacheObject> {
        let mut files = Vec::new();
        let mut size = 0u64;
        for index in 0..record.parts {
            let file = open_existing(key, &self.layout.part(key, index)).await?;
            size += file.metadata().await?.len();
            files.push(file);
        }
        if size != record.total_size {
            log::warn!(
                "cache entry {key} holds {size} bytes but its record says {}",
                record.total_size
            );
            return Err(CacheError::NotFound(key.to_string()));
        }
        Ok(CacheObject::new(key, size, files))
    }

    async fn open_flat(&self, key: &str) -> CacheResult<CacheObject> {
        let file = open_existing(key, &self.layout.flat(key)).await?;
        let size = file.metadata().await?.len();
        Ok(CacheObject::new(key, size, vec![file]))
    }

    /// Re-hashes the whole entry and deletes it on mismatch.
    pub async fn verify(&self, key: &str) -> CacheResult<Verification> {
        key::validate(key)?;
        let object = match self.read(key).await {
            Ok(object) => object,
            Err(CacheError::NotFound(_)) => {
                if self.has_committed_files(key).await {
                    self.layout.remove_committed(key).await?;
                    return Ok(Verification::Corrupt);
                }
                return Ok(Verification::Missing);
            }
            Err(err) => return Err(err),
        };
        let digest = match verify::sha256_hex(object).await {
            Ok(digest) => digest,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                self.layout.remove_committed(key).await?;
                return Ok(Verification::Corrupt);
            }
            Err(err) => return Err(err.into()),
        };
        if digest.eq_ignore_ascii_case(key) {
            return Ok(Verification::Ok);
        }
        log::warn!("cache entry {key} hashed to {digest}, removing");
        self.layout.remove_committed(key).await?;
        Ok(Verification::Corrupt)
    }

    /// Deletes temporary files left by an unfinished write of `key`.
    pub async fn abort(&self, key: &str) -> CacheResult<()> {
        key::validate(key)?;
        self.layout.remove_partial(key).await?;
        Ok(())
    }

    /// Explicit invalidation. Returns whether anything was deleted.
    pub async fn remove(&self, key: &str) -> CacheResult<bool> {
        key::validate(key)?;
        Ok(self.layout.remove_committed(key).await?)
    }

    async fn has_committed_files(&self, key: &str) -> bool {
        let candidates = [
            self.layout.record(key),
            self.layout.flat(key),
            self.layout.part(key, 0),
        ];
        for path in candidates {
            if fs::try_exists(&path).await.unwrap_or(false) {
                return true;
            }
        }
        false
    }
}

async fn open_existing(key: &str, path: &Path) -> CacheResult<File> {
    match File::open(path).await {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(CacheError::NotFound(key.to_string())),
        Err(err) => Err(err.into()),
    }
}
