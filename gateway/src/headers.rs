//! Response header names and value formatting at the serving boundary.

use arweave_gateway_types::H256;
use base64_url::base64::{engine::general_purpose::STANDARD, Engine as _};

pub const HOPS: &str = "X-AR-IO-Hops";
pub const ORIGIN: &str = "X-AR-IO-Origin";
pub const ORIGIN_NODE_RELEASE: &str = "X-AR-IO-Origin-Node-Release";
pub const CHUNK_SOURCE: &str = "X-AR-IO-Chunk-Source";
pub const CHUNK_HOST: &str = "X-AR-IO-Chunk-Host";
pub const CACHE: &str = "X-Cache";
pub const ROOT_TRANSACTION_ID: &str = "X-AR-IO-Root-Transaction-Id";
pub const DATA_ITEM_DATA_OFFSET: &str = "X-AR-IO-Data-Item-Data-Offset";
pub const DATA_ITEM_ROOT_OFFSET: &str = "X-AR-IO-Data-Item-Root-Offset";

pub const CACHE_HIT: &str = "HIT";
pub const CACHE_MISS: &str = "MISS";

/// The quoted strong ETag for a chunk or data object, from its sha256.
/// Set only on cache hits and on HEAD responses.
pub fn etag(hash: &H256) -> String {
    format!("\"{}\"", hash.to_base64_url())
}

/// RFC 9530 `Content-Digest` value: standard (not url) base64 between
/// colons.
pub fn content_digest(hash: &H256) -> String {
    format!("sha-256=:{}:", STANDARD.encode(hash.as_bytes()))
}

/// Whether an `If-None-Match` request header matches `etag`, honoring `*`,
/// comma-separated lists, and weak validators.
pub fn if_none_match_matches(header_value: &str, etag: &str) -> bool {
    header_value.split(',').any(|candidate| {
        let candidate = candidate.trim();
        candidate == "*" || candidate == etag || candidate.strip_prefix("W/") == Some(etag)
    })
}
