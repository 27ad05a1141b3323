use std::io;

use sha2::{Digest, Sha256};

use crate::storage::object::CacheObject;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verification {
    Ok,
    /// The entry did not hash to its key and was deleted.
    Corrupt,
    /// No files exist for the key.
    Missing,
}

impl Verification {
    pub fn as_str(self) -> &'static str {
        match self {
            Verification::Ok => "ok",
            Verification::Corrupt => "corrupt",
            Verification::Missing => "missing",
        }
    }
}

pub async fn sha256_hex(mut object: CacheObject) -> io::Result<String> {
    let mut hasher = Sha256::new();
    while let Some(chunk) = object.next_chunk().await? {
        hasher.update(&chunk);
    }
    Ok(hex::encode(hasher.finalize()))
}
