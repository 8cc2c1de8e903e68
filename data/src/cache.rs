use std::sync::Arc;

use arweave_gateway_types::{RequestAttributes, H256};
use async_stream::try_stream;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::contiguous::{ContiguousData, ContiguousDataSource, DataRegion};
use crate::stores::ContiguousDataStore;
use crate::DataError;

/// For ids that are nested data items: where the bytes live inside the
/// parent transaction's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    pub parent_id: H256,
    /// Offset of the item's data within the parent's data.
    pub offset: u64,
    /// The item's data size.
    pub size: u64,
}

/// What the gateway knows about an id before fetching any bytes. Supplied
/// by an external index (the gateway's database); the cache also writes
/// back what it learns from verified streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataAttributes {
    pub hash: Option<H256>,
    pub size: Option<u64>,
    pub content_type: Option<String>,
    pub verified: bool,
    pub parent: Option<ParentRef>,
}

#[async_trait]
pub trait DataAttributesSource: Send + Sync {
    async fn get_attributes(&self, id: &H256) -> Result<Option<DataAttributes>, DataError>;

    async fn put_attributes(
        &self,
        id: &H256,
        attributes: &DataAttributes,
    ) -> Result<(), DataError>;
}

fn metric(name: &'static str) {
    debug!(target: "metrics", metric = name);
}

/// The id read path: content-addressed store first, then a parent-range
/// read for nested items, then the configured upstream sources with the
/// winning trusted stream teed back into the store.
pub struct ReadThroughDataCache {
    attributes: Arc<dyn DataAttributesSource>,
    store: Arc<dyn ContiguousDataStore>,
    source: Arc<dyn ContiguousDataSource>,
}

impl ReadThroughDataCache {
    pub fn new(
        attributes: Arc<dyn DataAttributesSource>,
        store: Arc<dyn ContiguousDataStore>,
        source: Arc<dyn ContiguousDataSource>,
    ) -> Self {
        Self {
            attributes,
            store,
            source,
        }
    }

    pub async fn get_data(
        &self,
        id: &H256,
        request_attributes: &RequestAttributes,
        region: Option<DataRegion>,
        skip_cache: bool,
        signal: Option<&CancellationToken>,
    ) -> Result<ContiguousData, DataError> {
        let attributes = match self.attributes.get_attributes(id).await {
            Ok(attributes) => attributes,
            Err(err) => {
                debug!(id = %id.to_base64_url(), error = %err, "attribute lookup failed");
                None
            }
        };

        // Store hit by the id's own hash.
        if let Some(attributes) = &attributes {
            if let Some(hash) = attributes.hash {
                if let Some((stream, size)) = self.store.get(&hash, region).await? {
                    return Ok(ContiguousData {
                        stream,
                        size,
                        hash: Some(hash),
                        source_content_type: attributes.content_type.clone(),
                        verified: attributes.verified,
                        trusted: true,
                        cached: true,
                        request_attributes: request_attributes.clone(),
                    });
                }
            }

            // Nested item: satisfy the read from the parent's cached bytes.
            if let Some(hit) = self
                .parent_range_read(attributes, region, request_attributes)
                .await?
            {
                return Ok(hit);
            }
        }

        if signal.is_some_and(|token| token.is_cancelled()) {
            return Err(DataError::Aborted);
        }

        let upstream = match self
            .source
            .get_data(id, request_attributes, region, signal)
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => {
                metric("read_through_data_cache.get_data.errors");
                return Err(err);
            }
        };

        // Only whole, trusted, non-empty streams are cache candidates.
        if skip_cache || !upstream.trusted || upstream.size == 0 || region.is_some() {
            return Ok(upstream);
        }
        Ok(self.tee_to_store(*id, upstream).await)
    }

    async fn parent_range_read(
        &self,
        attributes: &DataAttributes,
        region: Option<DataRegion>,
        request_attributes: &RequestAttributes,
    ) -> Result<Option<ContiguousData>, DataError> {
        let Some(parent) = &attributes.parent else {
            return Ok(None);
        };
        let parent_attributes = match self.attributes.get_attributes(&parent.parent_id).await {
            Ok(Some(parent_attributes)) => parent_attributes,
            Ok(None) => return Ok(None),
            Err(err) => {
                debug!(error = %err, "parent attribute lookup failed");
                return Ok(None);
            }
        };
        let Some(parent_hash) = parent_attributes.hash else {
            return Ok(None);
        };

        let (offset_in_parent, size) = match region {
            Some(region) => (
                parent.offset + region.offset,
                region.size.min(parent.size.saturating_sub(region.offset)),
            ),
            None => (parent.offset, parent.size),
        };
        let Some((stream, size)) = self
            .store
            .get(
                &parent_hash,
                Some(DataRegion {
                    offset: offset_in_parent,
                    size,
                }),
            )
            .await?
        else {
            return Ok(None);
        };

        Ok(Some(ContiguousData {
            stream,
            size,
            hash: attributes.hash,
            source_content_type: attributes.content_type.clone(),
            verified: attributes.verified,
            trusted: true,
            cached: true,
            request_attributes: request_attributes.clone(),
        }))
    }

    /// Pipes the upstream stream through a store write. A complete pass
    /// finalizes the object under its content hash and records the learned
    /// attributes; any failure discards the partial write and surfaces the
    /// stream error to the consumer.
    async fn tee_to_store(&self, id: H256, upstream: ContiguousData) -> ContiguousData {
        let handle = match self.store.create_write().await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "cache write setup failed, passing stream through");
                metric("read_through_data_cache.stream.errors");
                return upstream;
            }
        };

        let attributes_sink = Arc::clone(&self.attributes);
        let expected_size = upstream.size;
        let verified = upstream.verified;
        let content_type = upstream.source_content_type.clone();
        let mut source_stream = upstream.stream;

        let stream = try_stream! {
            use futures::StreamExt;
            let mut handle = Some(handle);

            while let Some(piece) = source_stream.next().await {
                match piece {
                    Ok(bytes) => {
                        if let Err(err) = handle.as_mut().expect("handle present").write(&bytes).await {
                            // Keep serving the consumer; just stop caching.
                            warn!(error = %err, "cache write failed mid-stream");
                            metric("read_through_data_cache.stream.errors");
                            let _ = handle.take().expect("handle present").discard().await;
                            yield bytes;
                            while let Some(piece) = source_stream.next().await {
                                yield piece?;
                            }
                            return;
                        }
                        yield bytes;
                    }
                    Err(err) => {
                        metric("read_through_data_cache.stream.errors");
                        let _ = handle.take().expect("handle present").discard().await;
                        Err(err)?;
                    }
                }
            }

            let written = handle.as_ref().expect("handle present").written();
            if written != expected_size {
                metric("read_through_data_cache.stream.errors");
                let _ = handle.take().expect("handle present").discard().await;
                Err(DataError::Upstream(format!(
                    "upstream stream ended early ({written} of {expected_size} bytes)"
                )))?;
            }

            match handle.take().expect("handle present").finalize().await {
                Ok(hash) => {
                    metric("read_through_data_cache.stream.successes");
                    let learned = DataAttributes {
                        hash: Some(hash),
                        size: Some(expected_size),
                        content_type: content_type.clone(),
                        verified,
                        parent: None,
                    };
                    if let Err(err) = attributes_sink.put_attributes(&id, &learned).await {
                        warn!(error = %err, "attribute write-back failed");
                    }
                }
                Err(err) => {
                    metric("read_through_data_cache.stream.errors");
                    warn!(error = %err, "cache finalize failed");
                }
            }
        };

        ContiguousData {
            stream: Box::pin(stream),
            size: upstream.size,
            hash: upstream.hash,
            source_content_type: upstream.source_content_type,
            verified: upstream.verified,
            trusted: upstream.trusted,
            cached: false,
            request_attributes: upstream.request_attributes,
        }
    }
}
