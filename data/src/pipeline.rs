use std::sync::Arc;

use arweave_gateway_chain::{ChunkByAnySource, ChunkRequest};
use arweave_gateway_types::{
    Base64, Chunk, ChunkMetadata, ChunkSource, RequestAttributes, TxBoundary, H256,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::boundary::TxBoundarySource;
use crate::stores::{ChunkDataStore, ChunkMetadataStore};
use crate::{ChunkNotFoundError, ChunkNotFoundKind, DataError};

/// A chunk plus the weave placement it was resolved under.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    /// Present only when the boundary source did a transaction lookup.
    pub tx_id: Option<H256>,
    pub data_root: H256,
    pub data_size: u64,
    /// Inclusive end of the tx's data in the weave.
    pub weave_offset: u64,
    /// The requested offset relative to the tx's data start.
    pub relative_offset: u64,
    pub tx_data_start: u64,
}

#[derive(Debug, Clone)]
pub enum ChunkRetrievalResult {
    CacheHit(RetrievedChunk),
    BoundaryFetch(RetrievedChunk),
}

impl ChunkRetrievalResult {
    pub fn retrieved(&self) -> &RetrievedChunk {
        match self {
            ChunkRetrievalResult::CacheHit(retrieved) => retrieved,
            ChunkRetrievalResult::BoundaryFetch(retrieved) => retrieved,
        }
    }

    pub fn is_cache_hit(&self) -> bool {
        matches!(self, ChunkRetrievalResult::CacheHit(_))
    }
}

/// The offset read path: cache, then boundary resolution, then a validated
/// peer fetch, with the fetched chunk written back to the cache.
pub struct ChunkRetrievalPipeline {
    chunk_data_store: Option<Arc<dyn ChunkDataStore>>,
    chunk_metadata_store: Option<Arc<dyn ChunkMetadataStore>>,
    boundary_source: Arc<dyn TxBoundarySource>,
    chunk_source: Arc<dyn ChunkByAnySource>,
}

impl ChunkRetrievalPipeline {
    pub fn new(
        boundary_source: Arc<dyn TxBoundarySource>,
        chunk_source: Arc<dyn ChunkByAnySource>,
    ) -> Self {
        Self {
            chunk_data_store: None,
            chunk_metadata_store: None,
            boundary_source,
            chunk_source,
        }
    }

    pub fn with_cache(
        mut self,
        data_store: Arc<dyn ChunkDataStore>,
        metadata_store: Arc<dyn ChunkMetadataStore>,
    ) -> Self {
        self.chunk_data_store = Some(data_store);
        self.chunk_metadata_store = Some(metadata_store);
        self
    }

    pub async fn retrieve_chunk(
        &self,
        absolute_offset: u64,
        _request_attributes: Option<&RequestAttributes>,
        signal: Option<&CancellationToken>,
    ) -> Result<ChunkRetrievalResult, DataError> {
        // Cache path: a hit requires both stores to answer. A cache hit is
        // authoritative even when the boundary source would disagree.
        if let (Some(data_store), Some(metadata_store)) =
            (&self.chunk_data_store, &self.chunk_metadata_store)
        {
            let (cached_data, cached_metadata) = tokio::join!(
                data_store.get_by_absolute_offset(absolute_offset),
                metadata_store.get_by_absolute_offset(absolute_offset),
            );
            let cached_data = cached_data.unwrap_or_else(|err| {
                debug!(absolute_offset, error = %err, "chunk data cache read failed");
                None
            });
            let cached_metadata = cached_metadata.unwrap_or_else(|err| {
                debug!(absolute_offset, error = %err, "chunk metadata cache read failed");
                None
            });

            if let (Some(bytes), Some(metadata)) = (cached_data, cached_metadata) {
                if !bytes.is_empty() {
                    return Ok(ChunkRetrievalResult::CacheHit(from_cache(
                        absolute_offset,
                        bytes,
                        metadata,
                    )));
                }
            }
        }

        if signal.is_some_and(|token| token.is_cancelled()) {
            return Err(DataError::Aborted);
        }

        // Boundary lookup.
        let boundary = self
            .boundary_source
            .get_tx_boundary(absolute_offset, signal)
            .await?
            .ok_or_else(|| {
                DataError::ChunkNotFound(ChunkNotFoundError {
                    kind: ChunkNotFoundKind::BoundaryNotFound,
                    message: format!("no tx boundary covers offset {absolute_offset}"),
                })
            })?;

        // Fetch and validate.
        let relative_offset = boundary.relative_offset(absolute_offset);
        let chunk = self
            .chunk_source
            .get_chunk_by_any(
                &ChunkRequest {
                    tx_size: boundary.data_size,
                    absolute_offset,
                    data_root: boundary.data_root,
                    relative_offset,
                },
                signal,
            )
            .await
            .map_err(|err| DataError::from_chain(err, ChunkNotFoundKind::FetchFailed))?;

        self.cache_chunk(absolute_offset, relative_offset, &boundary, &chunk)
            .await;

        Ok(ChunkRetrievalResult::BoundaryFetch(RetrievedChunk {
            tx_id: boundary.id,
            data_root: boundary.data_root,
            data_size: boundary.data_size,
            weave_offset: boundary.weave_offset,
            relative_offset,
            tx_data_start: boundary.tx_data_start(),
            chunk,
        }))
    }

    /// Best-effort write-back; a failed cache write never fails the read.
    async fn cache_chunk(
        &self,
        absolute_offset: u64,
        relative_offset: u64,
        boundary: &TxBoundary,
        chunk: &Chunk,
    ) {
        let (Some(data_store), Some(metadata_store)) =
            (&self.chunk_data_store, &self.chunk_metadata_store)
        else {
            return;
        };

        if let Err(err) = data_store
            .put(
                &boundary.data_root,
                relative_offset,
                absolute_offset,
                &chunk.chunk,
            )
            .await
        {
            warn!(absolute_offset, error = %err, "chunk data cache write failed");
            return;
        }

        let metadata = ChunkMetadata {
            data_root: boundary.data_root,
            data_size: boundary.data_size,
            offset: relative_offset,
            data_path: Base64(chunk.data_path.clone()),
            tx_path: chunk.tx_path.clone().map(Base64),
            hash: chunk.hash,
        };
        if let Err(err) = metadata_store.put(absolute_offset, &metadata).await {
            warn!(absolute_offset, error = %err, "chunk metadata cache write failed");
        }
    }
}

fn from_cache(absolute_offset: u64, bytes: Vec<u8>, metadata: ChunkMetadata) -> RetrievedChunk {
    let tx_data_start = absolute_offset - metadata.offset;
    let weave_offset = tx_data_start + metadata.data_size - 1;
    let hash = metadata.hash;

    RetrievedChunk {
        chunk: Chunk {
            chunk: bytes,
            data_path: metadata.data_path.0,
            tx_path: metadata.tx_path.map(|path| path.0),
            data_root: metadata.data_root,
            data_size: metadata.data_size,
            offset: metadata.offset,
            hash,
            source: ChunkSource::Cache,
            source_host: None,
        },
        // Cache metadata never carries the tx id.
        tx_id: None,
        data_root: metadata.data_root,
        data_size: metadata.data_size,
        weave_offset,
        relative_offset: metadata.offset,
        tx_data_start,
    }
}
