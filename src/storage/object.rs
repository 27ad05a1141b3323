use std::collections::VecDeque;
use std::io;

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const READ_BUF_SIZE: usize = 64 * 1024;

/// An opened cache entry. Every constituent file is opened before the
/// first byte is handed out, so deleting the entry mid-stream cannot cut
/// the content short.
pub struct CacheObject {
    key: String,
    size: u64,
    parts: usize,
    files: VecDeque<File>,
    read: u64,
}

impl CacheObject {
    pub(crate) fn new(key: &str, size: u64, files: Vec<File>) -> Self {
        Self {
            key: key.to_string(),
            size,
            parts: files.len(),
            files: files.into(),
            read: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn parts(&self) -> usize {
        self.parts
    }

    /// Next slice of content, in part order. Ending short of the size that
    /// was checked at open time is reported as `UnexpectedEof`.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            let Some(file) = self.files.front_mut() else {
                if self.read != self.size {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("cache entry {} ended at {} of {} bytes", self.key, self.read, self.size),
                    ));
                }
                return Ok(None);
            };
            let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
            let n = file.read_buf(&mut buf).await?;
            if n == 0 {
                self.files.pop_front();
                continue;
            }
            self.read += n as u64;
            return Ok(Some(buf.freeze()));
        }
    }

    pub async fn read_to_end(mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(usize::try_from(self.size).unwrap_or(0));
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}
