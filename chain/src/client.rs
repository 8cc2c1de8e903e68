use std::time::Duration;

use arweave_gateway_types::{PartialBlockHeader, TxHeader, TxOffsetInfo, H256, H384};
use async_trait::async_trait;
use arweave_gateway_peers::{PeerCategory, PeerError, PeerListSource};
use reqwest::{Client as ReqwestClient, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::ChainError;

/// Everything the composite client needs from a block producer. Split out as
/// a trait so caches and the binary search can be exercised against fixture
/// chains.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn current_height(&self) -> Result<u64, ChainError>;
    async fn block_by_height(&self, height: u64) -> Result<PartialBlockHeader, ChainError>;
    async fn block_by_hash(&self, hash: &H384) -> Result<PartialBlockHeader, ChainError>;
    async fn tx(&self, id: &H256) -> Result<TxHeader, ChainError>;
    async fn tx_offset(&self, id: &H256) -> Result<TxOffsetInfo, ChainError>;
}

/// JSON client for a single trusted Arweave node. Transient upstream
/// trouble (429, 5xx, connection errors) is retried with a bounded delay;
/// 404 and 202 map to [`ChainError::NotFound`] so callers can distinguish
/// "does not exist" from "node is struggling".
pub struct TrustedNodeClient {
    client: ReqwestClient,
    url: String,
    max_retries: u32,
    retry_delay: Duration,
    request_timeout: Duration,
}

impl TrustedNodeClient {
    pub fn new(client: ReqwestClient, url: impl Into<String>) -> Self {
        let mut url = url.into();
        while url.ends_with('/') {
            url.pop();
        }
        Self {
            client,
            url,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ChainError> {
        let url = format!("{}{}", self.url, path);
        let mut retry_count = 0;

        loop {
            let result = self
                .client
                .get(&url)
                .timeout(self.request_timeout)
                .send()
                .await;

            match result {
                Ok(res) if res.status() == StatusCode::OK => {
                    return res
                        .json::<T>()
                        .await
                        .map_err(|e| ChainError::Decode(format!("{url}: {e}")));
                }
                Ok(res)
                    if res.status() == StatusCode::NOT_FOUND
                        || res.status() == StatusCode::ACCEPTED =>
                {
                    // 202 is the node's "known but not yet available".
                    return Err(ChainError::NotFound(url));
                }
                Ok(res)
                    if (res.status() == StatusCode::TOO_MANY_REQUESTS
                        || res.status().is_server_error())
                        && retry_count < self.max_retries =>
                {
                    debug!(%url, status = %res.status(), "retrying trusted node request");
                }
                Ok(res) => {
                    return Err(ChainError::UnexpectedStatus {
                        url,
                        status: res.status().as_u16(),
                    });
                }
                Err(err) if retry_count < self.max_retries => {
                    debug!(%url, error = %err, "retrying trusted node request");
                }
                Err(err) => return Err(ChainError::Http(err)),
            }

            retry_count += 1;
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    pub async fn current_block(&self) -> Result<PartialBlockHeader, ChainError> {
        self.get_json("/block/current").await
    }

    /// The node's current peer list, normalized to `http://host:port` URLs.
    pub async fn peers(&self) -> Result<Vec<String>, ChainError> {
        let addresses: Vec<String> = self.get_json("/peers").await?;
        Ok(addresses
            .into_iter()
            .map(|address| {
                if address.starts_with("http://") || address.starts_with("https://") {
                    address
                } else {
                    format!("http://{address}")
                }
            })
            .collect())
    }
}

#[async_trait]
impl ChainSource for TrustedNodeClient {
    async fn current_height(&self) -> Result<u64, ChainError> {
        Ok(self.current_block().await?.height)
    }

    async fn block_by_height(&self, height: u64) -> Result<PartialBlockHeader, ChainError> {
        self.get_json(&format!("/block/height/{height}")).await
    }

    async fn block_by_hash(&self, hash: &H384) -> Result<PartialBlockHeader, ChainError> {
        self.get_json(&format!("/block/hash/{}", hash.to_base64_url()))
            .await
    }

    async fn tx(&self, id: &H256) -> Result<TxHeader, ChainError> {
        self.get_json(&format!("/tx/{}", id.to_base64_url())).await
    }

    async fn tx_offset(&self, id: &H256) -> Result<TxOffsetInfo, ChainError> {
        self.get_json(&format!("/tx/{}/offset", id.to_base64_url()))
            .await
    }
}

/// Lets the peer manager refresh its pools from the trusted node's `/peers`.
#[async_trait]
impl PeerListSource for TrustedNodeClient {
    async fn peer_urls(&self, _category: PeerCategory) -> Result<Vec<String>, PeerError> {
        self.peers()
            .await
            .map_err(|err| PeerError::Refresh(err.to_string()))
    }
}
