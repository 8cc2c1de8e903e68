use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arweave_gateway_peers::{PeerCategory, PeerManager};
use arweave_gateway_types::{Chunk, ChunkJson, ChunkSource, ChunkUploadJson, H256};
use arweave_gateway_validator::{get_ruleset_for_offset, validate_chunk};
use async_trait::async_trait;
use futures::future::Shared;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use reqwest::{Client as ReqwestClient, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::composite::CompositeChainClient;
use crate::ChainError;

/// What a chunk fetch needs to know: where the chunk sits in the weave and
/// which tx it must prove itself against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    /// The containing tx's data size.
    pub tx_size: u64,
    pub absolute_offset: u64,
    pub data_root: H256,
    /// Target offset relative to the tx's data start.
    pub relative_offset: u64,
}

/// A source able to produce a *validated* chunk for a weave position, from
/// whichever upstream it likes.
#[async_trait]
pub trait ChunkByAnySource: Send + Sync {
    async fn get_chunk_by_any(
        &self,
        request: &ChunkRequest,
        signal: Option<&CancellationToken>,
    ) -> Result<Chunk, ChainError>;
}

type SharedFetch = Shared<Pin<Box<dyn Future<Output = Result<Chunk, Arc<ChainError>>> + Send>>>;

/// Fetches chunks from the `GetChunk` peer population, fanning out to a few
/// peers in parallel and returning the first response that passes merkle
/// validation. Identical concurrent requests for one absolute offset share
/// a single in-flight fetch. The trusted node is never used as a fallback
/// for chunk GETs.
pub struct PeerChunkSource {
    client: ReqwestClient,
    peers: Arc<PeerManager>,
    max_peer_attempts: usize,
    request_timeout: Duration,
    in_flight: Arc<Mutex<HashMap<u64, SharedFetch>>>,
}

impl PeerChunkSource {
    pub fn new(client: ReqwestClient, peers: Arc<PeerManager>) -> Self {
        Self {
            client,
            peers,
            max_peer_attempts: 3,
            request_timeout: Duration::from_secs(20),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_max_peer_attempts(mut self, attempts: usize) -> Self {
        self.max_peer_attempts = attempts.max(1);
        self
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    fn spawn_fetch(&self, request: ChunkRequest) -> SharedFetch {
        let client = self.client.clone();
        let peers = Arc::clone(&self.peers);
        let attempts = self.max_peer_attempts;
        let timeout = self.request_timeout;
        let in_flight = Arc::clone(&self.in_flight);
        let offset = request.absolute_offset;

        let future: Pin<Box<dyn Future<Output = Result<Chunk, Arc<ChainError>>> + Send>> =
            Box::pin(async move {
                let result = fetch_from_peers(client, peers, attempts, timeout, request).await;
                // The fetch unregisters itself exactly once, at completion;
                // awaiters still hold their clones of the shared result.
                in_flight
                    .lock()
                    .expect("in-flight lock poisoned")
                    .remove(&offset);
                result.map_err(Arc::new)
            });
        future.shared()
    }

    /// Fetches the raw chunk wire JSON from the first answering peer,
    /// without any proof validation. Used where only the `tx_path` matters
    /// and the caller verifies it against a trusted `tx_root` itself.
    pub async fn get_chunk_json(&self, absolute_offset: u64) -> Result<ChunkJson, ChainError> {
        let peer_urls = self
            .peers
            .select_peers(PeerCategory::GetChunk, self.max_peer_attempts);
        if peer_urls.is_empty() {
            return Err(ChainError::ChunkFetch("no chunk peers available".into()));
        }

        let mut last_error: Option<ChainError> = None;
        for url in peer_urls {
            let resolved = self.peers.resolve_url(&url);
            let request_url = format!("{resolved}/chunk/{absolute_offset}");
            let result = async {
                let res = self
                    .client
                    .get(&request_url)
                    .timeout(self.request_timeout)
                    .send()
                    .await?;
                if res.status() != StatusCode::OK {
                    return Err(ChainError::UnexpectedStatus {
                        url: request_url.clone(),
                        status: res.status().as_u16(),
                    });
                }
                res.json::<ChunkJson>()
                    .await
                    .map_err(|e| ChainError::Decode(format!("{request_url}: {e}")))
            }
            .await;

            match result {
                Ok(json) => {
                    self.peers.report_success(&url, PeerCategory::GetChunk);
                    return Ok(json);
                }
                Err(err) => {
                    debug!(url = %url, error = %err, "raw chunk fetch failed");
                    self.peers.report_failure(&url, PeerCategory::GetChunk);
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| ChainError::ChunkFetch("all chunk peers failed".into())))
    }

    /// Broadcasts a chunk to the `PostChunk` population, preferred peers
    /// first, until `min_successes` peers accepted it or the population is
    /// exhausted. Returns the number of successful posts.
    pub async fn broadcast_chunk(
        &self,
        upload: &ChunkUploadJson,
        min_successes: usize,
    ) -> Result<usize, ChainError> {
        let peers = self.peers.sorted_peers(PeerCategory::PostChunk);
        if peers.is_empty() {
            return Err(ChainError::ChunkFetch("no chunk post peers available".into()));
        }

        let mut successes = 0usize;
        for peer in peers {
            if successes >= min_successes {
                break;
            }
            let url = format!("{}/chunk", self.peers.resolve_url(&peer.url));
            let result = self
                .client
                .post(&url)
                .json(upload)
                .timeout(self.request_timeout)
                .send()
                .await;

            match result {
                Ok(res) if res.status().is_success() => {
                    self.peers.report_success(&peer.url, PeerCategory::PostChunk);
                    successes += 1;
                }
                Ok(res) => {
                    debug!(url = %peer.url, status = %res.status(), "chunk post rejected");
                    self.peers.report_failure(&peer.url, PeerCategory::PostChunk);
                }
                Err(err) => {
                    debug!(url = %peer.url, error = %err, "chunk post failed");
                    self.peers.report_failure(&peer.url, PeerCategory::PostChunk);
                }
            }
        }
        Ok(successes)
    }
}

#[async_trait]
impl ChunkByAnySource for PeerChunkSource {
    async fn get_chunk_by_any(
        &self,
        request: &ChunkRequest,
        signal: Option<&CancellationToken>,
    ) -> Result<Chunk, ChainError> {
        if signal.is_some_and(|token| token.is_cancelled()) {
            return Err(ChainError::Aborted);
        }

        let shared = {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
            match in_flight.get(&request.absolute_offset) {
                Some(existing) => existing.clone(),
                None => {
                    let fetch = self.spawn_fetch(request.clone());
                    in_flight.insert(request.absolute_offset, fetch.clone());
                    fetch
                }
            }
        };

        let result = match signal {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(ChainError::Aborted),
                result = shared => result,
            },
            None => shared.await,
        };

        result.map_err(|err| match err.as_ref() {
            ChainError::Aborted => ChainError::Aborted,
            other => ChainError::ChunkFetch(other.to_string()),
        })
    }
}

async fn fetch_from_peers(
    client: ReqwestClient,
    peers: Arc<PeerManager>,
    attempts: usize,
    timeout: Duration,
    request: ChunkRequest,
) -> Result<Chunk, ChainError> {
    let peer_urls = peers.select_peers(PeerCategory::GetChunk, attempts);
    if peer_urls.is_empty() {
        return Err(ChainError::ChunkFetch("no chunk peers available".into()));
    }

    let mut fetches: FuturesUnordered<_> = peer_urls
        .into_iter()
        .map(|url| {
            let client = client.clone();
            let peers = Arc::clone(&peers);
            let request = request.clone();
            async move {
                let resolved = peers.resolve_url(&url);
                fetch_and_validate(client, resolved, timeout, &request)
                    .await
                    .map(|chunk| (url.clone(), chunk))
                    .map_err(|err| (url, err))
            }
        })
        .collect();

    let mut last_error: Option<ChainError> = None;
    while let Some(result) = fetches.next().await {
        match result {
            Ok((url, chunk)) => {
                peers.report_success(&url, PeerCategory::GetChunk);
                // Dropping the remaining fetches cancels them.
                return Ok(chunk);
            }
            Err((url, err)) => {
                debug!(url = %url, error = %err, "peer chunk fetch failed");
                peers.report_failure(&url, PeerCategory::GetChunk);
                last_error = Some(err);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| ChainError::ChunkFetch("all chunk peers failed".into())))
}

async fn fetch_and_validate(
    client: ReqwestClient,
    peer_url: String,
    timeout: Duration,
    request: &ChunkRequest,
) -> Result<Chunk, ChainError> {
    let url = format!("{}/chunk/{}", peer_url, request.absolute_offset);
    let res = client.get(&url).timeout(timeout).send().await?;
    if res.status() != StatusCode::OK {
        return Err(ChainError::UnexpectedStatus {
            url,
            status: res.status().as_u16(),
        });
    }
    let json: ChunkJson = res
        .json()
        .await
        .map_err(|e| ChainError::Decode(format!("{url}: {e}")))?;

    let ruleset = get_ruleset_for_offset(request.absolute_offset);
    let parsed = validate_chunk(
        request.data_root,
        request.tx_size,
        json.data_path.as_slice(),
        request.relative_offset,
        ruleset,
        json.chunk.as_slice(),
    )?;

    let hash = Chunk::compute_hash(json.chunk.as_slice());
    Ok(Chunk {
        chunk: json.chunk.0,
        data_path: json.data_path.0,
        tx_path: json.tx_path.map(|path| path.0),
        data_root: request.data_root,
        data_size: request.tx_size,
        offset: parsed.boundaries.start_offset,
        hash,
        source: ChunkSource::Peer,
        source_host: Some(peer_url),
    })
}

impl CompositeChainClient {
    /// Convenience for offset-addressed data reads: resolve the boundary,
    /// fetch and validate the chunk, hand back only the payload bytes.
    pub async fn chunk_data_by_absolute_offset(
        &self,
        absolute_offset: u64,
        chunks: &dyn ChunkByAnySource,
    ) -> Result<Vec<u8>, ChainError> {
        let boundary = self
            .tx_boundary_by_offset(absolute_offset)
            .await?
            .ok_or_else(|| {
                ChainError::NotFound(format!("no tx covers offset {absolute_offset}"))
            })?;
        let chunk = chunks
            .get_chunk_by_any(
                &ChunkRequest {
                    tx_size: boundary.data_size,
                    absolute_offset,
                    data_root: boundary.data_root,
                    relative_offset: boundary.relative_offset(absolute_offset),
                },
                None,
            )
            .await?;
        Ok(chunk.chunk)
    }
}
