use crate::constants::{BLOB_MARKER, DIGEST_MARKER};
use crate::storage::{CacheError, CacheResult};

/// Only blob paths addressed by digest are cacheable; manifests and tags
/// are mutable and always go upstream.
pub fn is_cacheable(path: &str) -> bool {
    path.match_indices(BLOB_MARKER).any(|(pos, marker)| {
        path[pos + marker.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_hexdigit())
    })
}

/// Extracts the cache key from a request path. The digest of the last
/// `/blobs/sha256:` segment wins; otherwise the first `sha256:` marker that
/// carries hex digits, otherwise the last segment.
pub fn key_for(path: &str) -> String {
    let blob = path
        .rmatch_indices(BLOB_MARKER)
        .find_map(|(pos, marker)| hex_after(path, pos + marker.len()));
    if let Some(key) = blob {
        return key;
    }
    if let Some(key) = path
        .match_indices(DIGEST_MARKER)
        .find_map(|(pos, marker)| hex_after(path, pos + marker.len()))
    {
        return key;
    }
    path.rsplit('/').next().unwrap_or_default().to_string()
}

fn hex_after(path: &str, start: usize) -> Option<String> {
    let tail = &path[start..];
    let end = tail
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(tail.len());
    (end > 0).then(|| tail[..end].to_ascii_lowercase())
}

pub(crate) fn validate(key: &str) -> CacheResult<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey("empty key".to_string()));
    }
    if key.contains("..") || key.contains('/') || key.contains('\\') {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}
