use std::sync::Arc;
use std::time::Duration;

use arweave_gateway_chain::{ChunkByAnySource, CompositeChainClient};
use arweave_gateway_indexes::{ByteRangeError, LargeObjectSource};
use arweave_gateway_types::{RequestAttributes, H256};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client as ReqwestClient, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::range_stream::{RangeStream, RangeStreamArgs};
use crate::stores::ByteStream;
use crate::DataError;

/// A byte region within a contiguous data object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRegion {
    pub offset: u64,
    pub size: u64,
}

/// A stream of data bytes with everything the serving layer needs to frame
/// and account for it.
pub struct ContiguousData {
    pub stream: ByteStream,
    pub size: u64,
    pub hash: Option<H256>,
    pub source_content_type: Option<String>,
    /// The bytes were cryptographically verified against chain state.
    pub verified: bool,
    /// The upstream is one we are willing to cache from.
    pub trusted: bool,
    pub cached: bool,
    pub request_attributes: RequestAttributes,
}

impl std::fmt::Debug for ContiguousData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContiguousData")
            .field("stream", &"<stream>")
            .field("size", &self.size)
            .field("hash", &self.hash)
            .field("source_content_type", &self.source_content_type)
            .field("verified", &self.verified)
            .field("trusted", &self.trusted)
            .field("cached", &self.cached)
            .field("request_attributes", &self.request_attributes)
            .finish()
    }
}

/// Produces a contiguous data stream for an id, from one particular class
/// of upstream.
#[async_trait]
pub trait ContiguousDataSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_data(
        &self,
        id: &H256,
        attributes: &RequestAttributes,
        region: Option<DataRegion>,
        signal: Option<&CancellationToken>,
    ) -> Result<ContiguousData, DataError>;
}

/// Tries an ordered list of sources; the first to produce a stream wins.
/// Aborts propagate immediately, other failures are logged and the next
/// source gets its turn.
pub struct SequentialDataSource {
    sources: Vec<Arc<dyn ContiguousDataSource>>,
}

impl SequentialDataSource {
    pub fn new(sources: Vec<Arc<dyn ContiguousDataSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl ContiguousDataSource for SequentialDataSource {
    fn name(&self) -> &'static str {
        "sequential"
    }

    async fn get_data(
        &self,
        id: &H256,
        attributes: &RequestAttributes,
        region: Option<DataRegion>,
        signal: Option<&CancellationToken>,
    ) -> Result<ContiguousData, DataError> {
        let mut last_error: Option<DataError> = None;
        for source in &self.sources {
            if signal.is_some_and(|token| token.is_cancelled()) {
                return Err(DataError::Aborted);
            }
            match source.get_data(id, attributes, region, signal).await {
                Ok(data) => return Ok(data),
                Err(DataError::Aborted) => return Err(DataError::Aborted),
                Err(err) => {
                    debug!(
                        source = source.name(),
                        id = %id.to_base64_url(),
                        error = %err,
                        "data source failed, trying next"
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| DataError::NotFound(format!("no source produced {id}"))))
    }
}

//==============================================================================
// Trusted gateway source
//------------------------------------------------------------------------------

/// Streams `GET {gateway}/raw/{id}` from an upstream ar.io gateway we
/// trust. Hop and origin attributes travel as headers so loops are
/// detectable downstream.
pub struct TrustedGatewayDataSource {
    client: ReqwestClient,
    gateway_url: String,
    request_timeout: Duration,
}

impl TrustedGatewayDataSource {
    pub fn new(client: ReqwestClient, gateway_url: impl Into<String>) -> Self {
        let mut gateway_url = gateway_url.into();
        while gateway_url.ends_with('/') {
            gateway_url.pop();
        }
        Self {
            client,
            gateway_url,
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl ContiguousDataSource for TrustedGatewayDataSource {
    fn name(&self) -> &'static str {
        "trusted-gateway"
    }

    async fn get_data(
        &self,
        id: &H256,
        attributes: &RequestAttributes,
        region: Option<DataRegion>,
        _signal: Option<&CancellationToken>,
    ) -> Result<ContiguousData, DataError> {
        let url = format!("{}/raw/{}", self.gateway_url, id.to_base64_url());
        let mut request = self
            .client
            .get(&url)
            .header("X-AR-IO-Hops", attributes.hops.to_string())
            .timeout(self.request_timeout);
        if let Some(origin) = &attributes.origin {
            request = request.header("X-AR-IO-Origin", origin.clone());
        }
        if let Some(region) = region {
            request = request.header(
                header::RANGE,
                format!(
                    "bytes={}-{}",
                    region.offset,
                    region.offset + region.size - 1
                ),
            );
        }

        let res = request
            .send()
            .await
            .map_err(|e| DataError::Upstream(e.to_string()))?;
        match res.status() {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => {}
            StatusCode::NOT_FOUND => return Err(DataError::NotFound(url)),
            status => {
                return Err(DataError::Upstream(format!("{url} returned {status}")));
            }
        }

        let content_type = res
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let size = res
            .content_length()
            .ok_or_else(|| DataError::Upstream(format!("{url} sent no content length")))?;

        let stream = res
            .bytes_stream()
            .map(|item| item.map_err(|e| DataError::Upstream(e.to_string())));

        Ok(ContiguousData {
            stream: Box::pin(stream),
            size,
            hash: None,
            source_content_type: content_type,
            verified: false,
            trusted: true,
            cached: false,
            request_attributes: attributes.forwarded(),
        })
    }
}

//==============================================================================
// Chunk-backed source
//------------------------------------------------------------------------------

/// Reassembles a transaction's data from verified chunks: resolve the tx's
/// weave placement through the chain client, then walk the range with the
/// chunk source. Produces verified bytes at chunk-fetch cost.
pub struct TxChunksDataSource {
    chain: Arc<CompositeChainClient>,
    chunks: Arc<dyn ChunkByAnySource>,
}

impl TxChunksDataSource {
    pub fn new(chain: Arc<CompositeChainClient>, chunks: Arc<dyn ChunkByAnySource>) -> Self {
        Self { chain, chunks }
    }
}

#[async_trait]
impl ContiguousDataSource for TxChunksDataSource {
    fn name(&self) -> &'static str {
        "tx-chunks"
    }

    async fn get_data(
        &self,
        id: &H256,
        attributes: &RequestAttributes,
        region: Option<DataRegion>,
        signal: Option<&CancellationToken>,
    ) -> Result<ContiguousData, DataError> {
        let offset_info = self
            .chain
            .tx_offset(id)
            .await
            .map_err(|e| DataError::Upstream(e.to_string()))?;
        let tx = self
            .chain
            .tx(id)
            .await
            .map_err(|e| DataError::Upstream(e.to_string()))?;
        let data_root = tx
            .data_root
            .ok_or_else(|| DataError::NotFound(format!("tx {id} has no data root")))?;

        let (range_start, range_end) = match region {
            Some(region) => (
                region.offset,
                (region.offset + region.size).min(offset_info.size),
            ),
            None => (0, offset_info.size),
        };

        let range = RangeStream::new();
        let stream = range.stream(
            RangeStreamArgs {
                tx_id: Some(*id),
                tx_size: offset_info.size,
                tx_absolute_start: offset_info.data_start(),
                data_root,
                range_start,
                range_end,
            },
            Arc::clone(&self.chunks),
            signal.cloned(),
        );

        Ok(ContiguousData {
            stream: Box::pin(stream),
            size: range_end.saturating_sub(range_start),
            hash: None,
            source_content_type: None,
            verified: true,
            trusted: true,
            cached: false,
            request_attributes: attributes.forwarded(),
        })
    }
}

//==============================================================================
// Large-object adapter
//------------------------------------------------------------------------------

/// Lets the index layer read byte ranges of weave objects through any
/// [`ContiguousDataSource`], e.g. CDB64 partitions stored as transactions.
pub struct DataSourceLargeObject {
    source: Arc<dyn ContiguousDataSource>,
}

impl DataSourceLargeObject {
    pub fn new(source: Arc<dyn ContiguousDataSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl LargeObjectSource for DataSourceLargeObject {
    async fn read_region(
        &self,
        id: &H256,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, ByteRangeError> {
        let data = self
            .source
            .get_data(
                id,
                &RequestAttributes::default(),
                Some(DataRegion { offset, size }),
                None,
            )
            .await
            .map_err(|e| ByteRangeError::LargeObject(e.to_string()))?;

        let mut stream = data.stream;
        let mut out = Vec::with_capacity(size as usize);
        while let Some(piece) = stream.next().await {
            let piece = piece.map_err(|e| ByteRangeError::LargeObject(e.to_string()))?;
            out.extend_from_slice(&piece);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct StaticSource {
        name: &'static str,
        payload: Option<Vec<u8>>,
    }

    #[async_trait]
    impl ContiguousDataSource for StaticSource {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn get_data(
            &self,
            _id: &H256,
            attributes: &RequestAttributes,
            _region: Option<DataRegion>,
            _signal: Option<&CancellationToken>,
        ) -> Result<ContiguousData, DataError> {
            match &self.payload {
                Some(payload) => {
                    let bytes = Bytes::copy_from_slice(payload);
                    let size = bytes.len() as u64;
                    Ok(ContiguousData {
                        stream: Box::pin(futures::stream::iter(vec![Ok(bytes)])),
                        size,
                        hash: None,
                        source_content_type: None,
                        verified: false,
                        trusted: true,
                        cached: false,
                        request_attributes: attributes.forwarded(),
                    })
                }
                None => Err(DataError::NotFound("static".into())),
            }
        }
    }

    #[tokio::test]
    async fn sequential_source_falls_through_to_the_first_success() {
        let sequential = SequentialDataSource::new(vec![
            Arc::new(StaticSource {
                name: "first",
                payload: None,
            }),
            Arc::new(StaticSource {
                name: "second",
                payload: Some(b"hello".to_vec()),
            }),
        ]);

        let data = sequential
            .get_data(
                &H256::zero(),
                &RequestAttributes::default(),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(data.size, 5);
        assert_eq!(data.request_attributes.hops, 1);
    }

    #[tokio::test]
    async fn sequential_source_reports_the_last_error_when_all_fail() {
        let sequential = SequentialDataSource::new(vec![Arc::new(StaticSource {
            name: "only",
            payload: None,
        })]);
        let err = sequential
            .get_data(
                &H256::zero(),
                &RequestAttributes::default(),
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::NotFound(_)));
    }

    #[tokio::test]
    async fn sequential_source_propagates_abort() {
        let sequential = SequentialDataSource::new(vec![Arc::new(StaticSource {
            name: "never-reached",
            payload: Some(b"data".to_vec()),
        })]);
        let token = CancellationToken::new();
        token.cancel();
        let err = sequential
            .get_data(
                &H256::zero(),
                &RequestAttributes::default(),
                None,
                Some(&token),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Aborted));
    }
}
