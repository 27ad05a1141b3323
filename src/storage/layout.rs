use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::storage::record::Record;

pub const PARTIAL_SUFFIX: &str = ".partial";

/// File naming for cache entries under one root directory:
///
/// - flat: `<key>.dat`
/// - split: `<key>_part_<n>.dat` plus `<key>_record.txt`
///
/// Files still being written carry an extra `.partial` suffix.
#[derive(Clone, Debug)]
pub struct Layout {
    root: PathBuf,
    chunk_size: u64,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>, chunk_size: u64) -> Self {
        Self {
            root: root.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Reads the record of `key`. Records whose part count disagrees with
    /// their size at the configured chunk size read as `None`.
    pub async fn load_record(&self, key: &str) -> io::Result<Option<Record>> {
        let raw = match fs::read_to_string(self.record(key)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => return Ok(None),
            Err(err) => return Err(err),
        };
        Ok(Record::decode(&raw).filter(|record| record.fits(self.chunk_size)))
    }

    pub fn flat(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.dat"))
    }

    pub fn part(&self, key: &str, index: u32) -> PathBuf {
        self.root.join(format!("{key}_part_{index}.dat"))
    }

    pub fn record(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}_record.txt"))
    }

    /// Deletes every committed file of `key`. The record goes first so a
    /// concurrent reader stops seeing a split entry before its parts vanish.
    pub async fn remove_committed(&self, key: &str) -> io::Result<bool> {
        let mut removed = false;
        let parts = match self.load_record(key).await {
            Ok(Some(record)) => record.parts,
            _ => 0,
        };
        let record_path = self.record(key);
        removed |= remove_if_exists(&record_path).await?;
        removed |= self.remove_parts(key, parts, false).await?;
        removed |= remove_if_exists(&self.flat(key)).await?;
        Ok(removed)
    }

    /// Deletes the temporary files of an unfinished write for `key`.
    pub async fn remove_partial(&self, key: &str) -> io::Result<bool> {
        let mut removed = remove_if_exists(&partial(&self.record(key))).await?;
        removed |= self.remove_parts(key, 0, true).await?;
        removed |= remove_if_exists(&partial(&self.flat(key))).await?;
        Ok(removed)
    }

    /// Removes parts `0..known`, then keeps going until the first gap.
    /// `known` comes from a record that passed [`Record::fits`].
    async fn remove_parts(&self, key: &str, known: u32, partial_names: bool) -> io::Result<bool> {
        let mut removed = false;
        let mut index = 0u32;
        loop {
            let mut path = self.part(key, index);
            if partial_names {
                path = partial(&path);
            }
            let existed = remove_if_exists(&path).await?;
            removed |= existed;
            if !existed && index >= known {
                break;
            }
            index += 1;
        }
        Ok(removed)
    }
}

pub fn partial(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

pub(crate) async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

pub(crate) fn remove_if_exists_sync(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            log::warn!("remove {} failed: {err}", path.display());
        }
    }
}
