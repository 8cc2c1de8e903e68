//! The data plane of the gateway: given an absolute weave offset or a
//! content id, produce verified bytes.
//!
//! Offset reads run through the chunk retrieval pipeline: cache, then
//! boundary resolution, then a validated peer fetch. Id reads run through
//! the read-through cache: attribute lookup, content-addressed store, then
//! a prioritized list of upstream sources with the winning stream teed back
//! into the store. Both paths thread a cancellation token through every
//! await and keep abort distinct from not-found at the type level.

use thiserror::Error;

pub mod boundary;
pub mod cache;
pub mod contiguous;
pub mod pipeline;
pub mod range_stream;
pub mod stores;

pub use boundary::{CompositeTxBoundarySource, TxBoundarySource, TxOffsetIndex};
pub use cache::{DataAttributes, DataAttributesSource, ParentRef, ReadThroughDataCache};
pub use contiguous::{
    ContiguousData, ContiguousDataSource, DataRegion, DataSourceLargeObject,
    SequentialDataSource, TrustedGatewayDataSource, TxChunksDataSource,
};
pub use pipeline::{ChunkRetrievalPipeline, ChunkRetrievalResult, RetrievedChunk};
pub use range_stream::{RangeStream, RangeStreamArgs};
pub use stores::{
    ChunkDataStore, ChunkMetadataStore, ContiguousDataStore, FsChunkDataStore,
    FsChunkMetadataStore, FsDataStore,
};

/// Why a chunk retrieval came up empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkNotFoundKind {
    /// No transaction boundary covers the requested offset.
    BoundaryNotFound,
    /// A boundary exists but no peer produced a valid chunk.
    FetchFailed,
}

#[derive(Debug, Error)]
#[error("chunk not found ({kind:?}): {message}")]
pub struct ChunkNotFoundError {
    pub kind: ChunkNotFoundKind,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    ChunkNotFound(#[from] ChunkNotFoundError),
    #[error("request aborted")]
    Aborted,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl DataError {
    /// Maps a chain-layer failure to the pipeline taxonomy. Aborts pass
    /// through untouched; everything else becomes a terminal
    /// [`ChunkNotFoundError`] of the given kind.
    pub(crate) fn from_chain(
        err: arweave_gateway_chain::ChainError,
        kind: ChunkNotFoundKind,
    ) -> Self {
        match err {
            arweave_gateway_chain::ChainError::Aborted => DataError::Aborted,
            other => DataError::ChunkNotFound(ChunkNotFoundError {
                kind,
                message: other.to_string(),
            }),
        }
    }
}
