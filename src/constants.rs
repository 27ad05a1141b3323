pub const PROTOCOL_CACHE_STATUS_KEY: &str = "X-Cache";
pub const PROTOCOL_REQUEST_ID_KEY: &str = "X-Request-ID";
pub const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Paths under this prefix are answered locally and never proxied.
pub const INTERNAL_PATH_PREFIX: &str = "/_mirror/";

pub const BLOB_MARKER: &str = "/blobs/sha256:";
pub const DIGEST_MARKER: &str = "sha256:";
