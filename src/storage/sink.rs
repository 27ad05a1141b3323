use std::path::PathBuf;

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::storage::layout::{self, Layout};
use crate::storage::record::Record;
use crate::storage::CacheResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    Flat,
    Split,
}

/// Summary of a committed entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Committed {
    pub mode: WriteMode,
    pub parts: u32,
    pub total_size: u64,
}

/// Sequential writer for one cache entry. Nothing becomes visible to
/// readers until [`CacheSink::finish`] renames the files into place; a sink
/// dropped before that removes its temporary files.
pub struct CacheSink {
    layout: Layout,
    key: String,
    mode: WriteMode,
    chunk_size: u64,
    file: Option<File>,
    parts: u32,
    part_written: u64,
    total: u64,
    done: bool,
}

impl CacheSink {
    pub(crate) async fn create(
        layout: Layout,
        key: &str,
        mode: WriteMode,
        chunk_size: u64,
    ) -> CacheResult<Self> {
        fs::create_dir_all(layout.root()).await?;
        let first = match mode {
            WriteMode::Flat => layout::partial(&layout.flat(key)),
            WriteMode::Split => layout::partial(&layout.part(key, 0)),
        };
        let file = File::create(&first).await?;
        Ok(Self {
            layout,
            key: key.to_string(),
            mode,
            chunk_size: chunk_size.max(1),
            file: Some(file),
            parts: 1,
            part_written: 0,
            total: 0,
            done: false,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    pub fn bytes_written(&self) -> u64 {
        self.total
    }

    pub async fn write(&mut self, mut data: &[u8]) -> CacheResult<()> {
        while !data.is_empty() {
            let take = match self.mode {
                WriteMode::Flat => data.len(),
                WriteMode::Split => {
                    if self.part_written >= self.chunk_size {
                        self.roll().await?;
                    }
                    let room = self.chunk_size - self.part_written;
                    data.len().min(usize::try_from(room).unwrap_or(usize::MAX))
                }
            };
            let file = self
                .file
                .as_mut()
                .ok_or_else(|| std::io::Error::other("cache sink already closed"))?;
            file.write_all(&data[..take]).await?;
            self.part_written += take as u64;
            self.total += take as u64;
            data = &data[take..];
        }
        Ok(())
    }

    async fn roll(&mut self) -> CacheResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        let path = layout::partial(&self.layout.part(&self.key, self.parts));
        self.file = Some(File::create(&path).await?);
        self.parts += 1;
        self.part_written = 0;
        Ok(())
    }

    /// Flushes the last file and publishes the entry: parts first, then the
    /// record that makes a split entry readable.
    pub async fn finish(mut self) -> CacheResult<Committed> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        let committed = Committed {
            mode: self.mode,
            parts: self.parts,
            total_size: self.total,
        };
        if let Err(err) = self.publish(&committed).await {
            let _ = self.layout.remove_committed(&self.key).await;
            return Err(err);
        }
        self.done = true;
        Ok(committed)
    }

    async fn publish(&self, committed: &Committed) -> CacheResult<()> {
        match self.mode {
            WriteMode::Flat => {
                let target = self.layout.flat(&self.key);
                fs::rename(layout::partial(&target), &target).await?;
            }
            WriteMode::Split => {
                for index in 0..self.parts {
                    let target = self.layout.part(&self.key, index);
                    fs::rename(layout::partial(&target), &target).await?;
                }
                let record = Record {
                    parts: committed.parts,
                    total_size: committed.total_size,
                };
                let target = self.layout.record(&self.key);
                let tmp = layout::partial(&target);
                fs::write(&tmp, record.encode()).await?;
                fs::rename(&tmp, &target).await?;
            }
        }
        Ok(())
    }

    /// Drops the in-progress entry and deletes its temporary files.
    pub async fn abort(mut self) -> CacheResult<()> {
        self.file.take();
        self.done = true;
        for path in self.partial_paths() {
            layout::remove_if_exists(&path).await?;
        }
        Ok(())
    }

    fn partial_paths(&self) -> Vec<PathBuf> {
        match self.mode {
            WriteMode::Flat => vec![layout::partial(&self.layout.flat(&self.key))],
            WriteMode::Split => {
                let mut paths: Vec<PathBuf> = (0..self.parts)
                    .map(|i| layout::partial(&self.layout.part(&self.key, i)))
                    .collect();
                paths.push(layout::partial(&self.layout.record(&self.key)));
                paths
            }
        }
    }
}

impl Drop for CacheSink {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.file.take();
        for path in self.partial_paths() {
            layout::remove_if_exists_sync(&path);
        }
    }
}
