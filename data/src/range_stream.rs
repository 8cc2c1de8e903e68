use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arweave_gateway_chain::{ChunkByAnySource, ChunkRequest};
use arweave_gateway_types::H256;
use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::{ChunkNotFoundKind, DataError};

/// One byte range of one transaction's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeStreamArgs {
    pub tx_id: Option<H256>,
    pub tx_size: u64,
    /// Absolute weave offset of the tx's first data byte.
    pub tx_absolute_start: u64,
    pub data_root: H256,
    /// Inclusive start, tx-relative.
    pub range_start: u64,
    /// Exclusive end, tx-relative.
    pub range_end: u64,
}

/// Walks consecutive chunk fetches to emit a single contiguous byte range,
/// slicing the first and last chunks to the requested bounds. Chunk-source
/// errors terminate the stream; `chunks_fetched` survives it for metrics.
pub struct RangeStream {
    chunks_fetched: Arc<AtomicUsize>,
}

impl Default for RangeStream {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeStream {
    pub fn new() -> Self {
        Self {
            chunks_fetched: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn chunks_fetched(&self) -> usize {
        self.chunks_fetched.load(Ordering::SeqCst)
    }

    pub fn stream(
        &self,
        args: RangeStreamArgs,
        source: Arc<dyn ChunkByAnySource>,
        signal: Option<CancellationToken>,
    ) -> impl Stream<Item = Result<Bytes, DataError>> {
        let fetched = Arc::clone(&self.chunks_fetched);

        try_stream! {
            if args.range_start >= args.range_end || args.range_end > args.tx_size {
                return;
            }

            let mut current = args.range_start;
            while current < args.range_end {
                if signal.as_ref().is_some_and(|token| token.is_cancelled()) {
                    Err(DataError::Aborted)?;
                }

                let chunk = source
                    .get_chunk_by_any(
                        &ChunkRequest {
                            tx_size: args.tx_size,
                            absolute_offset: args.tx_absolute_start + current,
                            data_root: args.data_root,
                            relative_offset: current,
                        },
                        signal.as_ref(),
                    )
                    .await
                    .map_err(|err| {
                        DataError::from_chain(err, ChunkNotFoundKind::FetchFailed)
                    })?;
                fetched.fetch_add(1, Ordering::SeqCst);

                let chunk_start = chunk.offset;
                let chunk_end = chunk_start + chunk.len();
                if current < chunk_start || current >= chunk_end {
                    Err(DataError::Upstream(format!(
                        "chunk [{chunk_start}, {chunk_end}) does not cover offset {current}"
                    )))?;
                }

                let from = (current - chunk_start) as usize;
                let to = (chunk_end.min(args.range_end) - chunk_start) as usize;
                yield Bytes::copy_from_slice(&chunk.chunk[from..to]);

                current = chunk_end;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arweave_gateway_chain::ChainError;
    use arweave_gateway_types::{Chunk, ChunkSource};
    use async_trait::async_trait;
    use futures::{pin_mut, StreamExt};

    /// Serves chunks of a fixed in-memory tx without any network.
    struct FixtureChunks {
        data: Vec<u8>,
        chunk_size: u64,
        tx_absolute_start: u64,
    }

    #[async_trait]
    impl ChunkByAnySource for FixtureChunks {
        async fn get_chunk_by_any(
            &self,
            request: &ChunkRequest,
            _signal: Option<&CancellationToken>,
        ) -> Result<Chunk, ChainError> {
            let relative = request
                .absolute_offset
                .checked_sub(self.tx_absolute_start)
                .ok_or_else(|| ChainError::ChunkFetch("before tx start".into()))?;
            if relative >= self.data.len() as u64 {
                return Err(ChainError::ChunkFetch("past tx end".into()));
            }
            let start = relative - relative % self.chunk_size;
            let end = (start + self.chunk_size).min(self.data.len() as u64);
            let payload = self.data[start as usize..end as usize].to_vec();
            let hash = Chunk::compute_hash(&payload);
            Ok(Chunk {
                chunk: payload,
                data_path: Vec::new(),
                tx_path: None,
                data_root: request.data_root,
                data_size: self.data.len() as u64,
                offset: start,
                hash,
                source: ChunkSource::Peer,
                source_host: None,
            })
        }
    }

    fn fixture_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn collect_range(
        data_len: usize,
        chunk_size: u64,
        range_start: u64,
        range_end: u64,
    ) -> (Vec<u8>, usize) {
        let data = fixture_data(data_len);
        let source = Arc::new(FixtureChunks {
            data,
            chunk_size,
            tx_absolute_start: 10_000,
        });
        let range = RangeStream::new();
        let stream = range.stream(
            RangeStreamArgs {
                tx_id: None,
                tx_size: data_len as u64,
                tx_absolute_start: 10_000,
                data_root: H256::zero(),
                range_start,
                range_end,
            },
            source,
            None,
        );
        pin_mut!(stream);
        let mut out = Vec::new();
        while let Some(piece) = stream.next().await {
            out.extend_from_slice(&piece.unwrap());
        }
        (out, range.chunks_fetched())
    }

    #[tokio::test]
    async fn range_crossing_chunk_boundaries_concatenates_exactly() {
        let (bytes, fetched) = collect_range(10_000, 1_000, 2_500, 7_300).await;
        assert_eq!(bytes, fixture_data(10_000)[2_500..7_300]);
        // Chunks 2..=7 cover [2500, 7300).
        assert_eq!(fetched, 6);
    }

    #[tokio::test]
    async fn full_tx_range_round_trips() {
        let (bytes, fetched) = collect_range(5_500, 1_000, 0, 5_500).await;
        assert_eq!(bytes, fixture_data(5_500));
        assert_eq!(fetched, 6);
    }

    #[tokio::test]
    async fn empty_and_inverted_ranges_emit_nothing() {
        let (bytes, fetched) = collect_range(5_000, 1_000, 3_000, 3_000).await;
        assert!(bytes.is_empty());
        assert_eq!(fetched, 0);

        let (bytes, _) = collect_range(5_000, 1_000, 4_000, 3_000).await;
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn out_of_bounds_range_emits_nothing() {
        let (bytes, fetched) = collect_range(5_000, 1_000, 0, 6_000).await;
        assert!(bytes.is_empty());
        assert_eq!(fetched, 0);
    }

    #[tokio::test]
    async fn single_byte_range() {
        let (bytes, fetched) = collect_range(5_000, 1_000, 4_999, 5_000).await;
        assert_eq!(bytes, vec![fixture_data(5_000)[4_999]]);
        assert_eq!(fetched, 1);
    }

    #[tokio::test]
    async fn chunk_source_errors_terminate_the_stream() {
        let source = Arc::new(FixtureChunks {
            data: fixture_data(2_000),
            chunk_size: 1_000,
            tx_absolute_start: 10_000,
        });
        let range = RangeStream::new();
        // tx_size lies about the data length, so the walk runs off the end.
        let stream = range.stream(
            RangeStreamArgs {
                tx_id: None,
                tx_size: 4_000,
                tx_absolute_start: 10_000,
                data_root: H256::zero(),
                range_start: 0,
                range_end: 4_000,
            },
            source,
            None,
        );
        pin_mut!(stream);
        let mut saw_error = false;
        while let Some(piece) = stream.next().await {
            if piece.is_err() {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn cancelled_signal_aborts_the_stream() {
        let source = Arc::new(FixtureChunks {
            data: fixture_data(2_000),
            chunk_size: 1_000,
            tx_absolute_start: 0,
        });
        let token = CancellationToken::new();
        token.cancel();
        let range = RangeStream::new();
        let stream = range.stream(
            RangeStreamArgs {
                tx_id: None,
                tx_size: 2_000,
                tx_absolute_start: 0,
                data_root: H256::zero(),
                range_start: 0,
                range_end: 2_000,
            },
            source,
            Some(token),
        );
        pin_mut!(stream);
        let first = stream.next().await.unwrap();
        assert!(matches!(first.unwrap_err(), DataError::Aborted));
    }
}
