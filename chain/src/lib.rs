//! Chain access for the gateway: a trusted node for block and transaction
//! metadata, and the open peer population for chunk bytes.
//!
//! The split matters. Metadata answers are cheap to verify against each
//! other and cached aggressively, so a single trusted node suffices. Chunk
//! bytes are bulky and abundant across the network, so they are fetched from
//! weighted peers and verified cryptographically instead of trusted; the
//! trusted node is deliberately never used as a chunk GET fallback.

use thiserror::Error;

pub mod cache;
pub mod chunks;
pub mod client;
pub mod composite;
pub mod store;

pub use cache::TtlLruCache;
pub use chunks::{ChunkByAnySource, ChunkRequest, PeerChunkSource};
pub use client::TrustedNodeClient;
pub use composite::{ChainClientConfig, CompositeChainClient, TxPlacement};
pub use store::{BlockStore, TxStore};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} returned status {status}")]
    UnexpectedStatus { url: String, status: u16 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("store error: {0}")]
    Store(#[from] std::io::Error),
    #[error("chunk fetch failed: {0}")]
    ChunkFetch(String),
    #[error("chunk failed validation: {0}")]
    Validation(#[from] arweave_gateway_validator::PathError),
    #[error("request aborted")]
    Aborted,
}

impl ChainError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ChainError::NotFound(_))
    }
}
