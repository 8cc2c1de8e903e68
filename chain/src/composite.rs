use std::sync::Arc;
use std::time::Duration;

use arweave_gateway_types::{PartialBlockHeader, TxBoundary, TxHeader, TxOffsetInfo, H256, H384};
use tracing::{debug, warn};

use crate::cache::TtlLruCache;
use crate::client::ChainSource;
use crate::store::{BlockStore, TxStore};
use crate::ChainError;

#[derive(Debug, Clone)]
pub struct ChainClientConfig {
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    /// How long a fetched chain tip height is trusted before re-asking.
    pub height_ttl: Duration,
}

impl Default for ChainClientConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1000,
            cache_ttl: Duration::from_secs(300),
            height_ttl: Duration::from_secs(30),
        }
    }
}

/// Where one transaction's data sits in the weave, as resolved by
/// [`CompositeChainClient::find_tx_by_offset`]. All offsets absolute;
/// `tx_end` inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPlacement {
    pub tx_id: H256,
    pub tx_offset: u64,
    pub tx_size: u64,
    pub tx_start: u64,
    pub tx_end: u64,
}

/// A [`ChainSource`] fronted by TTL'd LRU caches and optional write-through
/// on-disk stores. Blocks and tx offsets feed the offset binary search, so
/// their caches are the hottest in the gateway.
pub struct CompositeChainClient {
    source: Arc<dyn ChainSource>,
    block_by_height: TtlLruCache<u64, Arc<PartialBlockHeader>>,
    block_by_hash: TtlLruCache<H384, Arc<PartialBlockHeader>>,
    tx_by_id: TtlLruCache<H256, Arc<TxHeader>>,
    tx_offset_by_id: TtlLruCache<H256, TxOffsetInfo>,
    current_height: TtlLruCache<(), u64>,
    block_store: Option<BlockStore>,
    tx_store: Option<TxStore>,
}

impl CompositeChainClient {
    pub fn new(source: Arc<dyn ChainSource>, config: ChainClientConfig) -> Self {
        Self {
            source,
            block_by_height: TtlLruCache::new(config.cache_capacity, config.cache_ttl),
            block_by_hash: TtlLruCache::new(config.cache_capacity, config.cache_ttl),
            tx_by_id: TtlLruCache::new(config.cache_capacity, config.cache_ttl),
            tx_offset_by_id: TtlLruCache::new(config.cache_capacity, config.cache_ttl),
            current_height: TtlLruCache::new(1, config.height_ttl),
            block_store: None,
            tx_store: None,
        }
    }

    pub fn with_stores(
        mut self,
        block_store: Option<BlockStore>,
        tx_store: Option<TxStore>,
    ) -> Self {
        self.block_store = block_store;
        self.tx_store = tx_store;
        self
    }

    pub async fn current_height(&self) -> Result<u64, ChainError> {
        if let Some(height) = self.current_height.get(&()) {
            return Ok(height);
        }
        let height = self.source.current_height().await?;
        self.current_height.put((), height);
        Ok(height)
    }

    pub async fn block_by_height(
        &self,
        height: u64,
    ) -> Result<Arc<PartialBlockHeader>, ChainError> {
        if let Some(block) = self.block_by_height.get(&height) {
            return Ok(block);
        }
        let block = Arc::new(self.source.block_by_height(height).await?);
        self.remember_block(&block).await;
        Ok(block)
    }

    pub async fn block_by_hash(
        &self,
        hash: &H384,
    ) -> Result<Arc<PartialBlockHeader>, ChainError> {
        if let Some(block) = self.block_by_hash.get(hash) {
            return Ok(block);
        }
        if let Some(store) = &self.block_store {
            if let Some(block) = store.get(hash).await? {
                let block = Arc::new(block);
                self.block_by_height.put(block.height, Arc::clone(&block));
                self.block_by_hash.put(block.indep_hash, Arc::clone(&block));
                return Ok(block);
            }
        }
        let block = Arc::new(self.source.block_by_hash(hash).await?);
        self.remember_block(&block).await;
        Ok(block)
    }

    async fn remember_block(&self, block: &Arc<PartialBlockHeader>) {
        self.block_by_height.put(block.height, Arc::clone(block));
        self.block_by_hash.put(block.indep_hash, Arc::clone(block));
        if let Some(store) = &self.block_store {
            // Write-through is best effort; a failed disk write must not
            // fail the read path.
            if let Err(err) = store.put(block).await {
                warn!(height = block.height, error = %err, "block store write failed");
            }
        }
    }

    pub async fn tx(&self, id: &H256) -> Result<Arc<TxHeader>, ChainError> {
        if let Some(tx) = self.tx_by_id.get(id) {
            return Ok(tx);
        }
        if let Some(store) = &self.tx_store {
            if let Some(tx) = store.get(id).await? {
                let tx = Arc::new(tx);
                self.tx_by_id.put(*id, Arc::clone(&tx));
                return Ok(tx);
            }
        }
        let tx = Arc::new(self.source.tx(id).await?);
        self.tx_by_id.put(*id, Arc::clone(&tx));
        if let Some(store) = &self.tx_store {
            if let Err(err) = store.put(&tx).await {
                warn!(id = %id.to_base64_url(), error = %err, "tx store write failed");
            }
        }
        Ok(tx)
    }

    pub async fn tx_offset(&self, id: &H256) -> Result<TxOffsetInfo, ChainError> {
        if let Some(offset) = self.tx_offset_by_id.get(id) {
            return Ok(offset);
        }
        let offset = self.source.tx_offset(id).await?;
        self.tx_offset_by_id.put(*id, offset);
        Ok(offset)
    }

    /// Binary searches the block sequence for the block containing
    /// `absolute_offset`, then scans its transactions for the one covering
    /// it.
    ///
    /// A block `B` contains offset `o` iff
    /// `prev(B).weave_size < o <= B.weave_size`. Candidate transactions are
    /// ordered by lexicographic comparison of the raw 32-byte ids; some
    /// historical blocks contain txs whose base64url string order misplaces
    /// the right one.
    pub async fn find_tx_by_offset(
        &self,
        absolute_offset: u64,
    ) -> Result<Option<TxPlacement>, ChainError> {
        let Some((block, _)) = self.find_block_by_offset(absolute_offset).await? else {
            return Ok(None);
        };
        // Empty tx lists happen (propagated pre-2.0 anomalies); that is a
        // miss, not corruption.
        if block.txs.is_empty() {
            return Ok(None);
        }

        let mut candidates: Vec<H256> = block.txs.iter().copied().collect();
        candidates.sort();

        for tx_id in candidates {
            let info = match self.tx_offset(&tx_id).await {
                Ok(info) => info,
                Err(err) if err.is_not_found() => {
                    // Data-less txs have no offset entry.
                    debug!(tx = %tx_id.to_base64_url(), "no offset for block tx");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let tx_start = info.data_start();
            if tx_start <= absolute_offset && absolute_offset <= info.offset {
                return Ok(Some(TxPlacement {
                    tx_id,
                    tx_offset: info.offset,
                    tx_size: info.size,
                    tx_start,
                    tx_end: info.offset,
                }));
            }
        }
        Ok(None)
    }

    /// The block containing `absolute_offset` and the weave size before it,
    /// or `None` when the offset is beyond the tip or in no block's span.
    pub async fn find_block_by_offset(
        &self,
        absolute_offset: u64,
    ) -> Result<Option<(Arc<PartialBlockHeader>, u64)>, ChainError> {
        let mut lo = 0u64;
        let mut hi = self.current_height().await?;

        loop {
            if lo > hi {
                return Ok(None);
            }
            let mid = lo + (hi - lo) / 2;
            let block = self.block_by_height(mid).await?;
            let prev_weave_size = if mid == 0 {
                0
            } else {
                self.block_by_height(mid - 1).await?.weave_size
            };

            if prev_weave_size < absolute_offset && absolute_offset <= block.weave_size {
                return Ok(Some((block, prev_weave_size)));
            }
            if block.weave_size < absolute_offset {
                lo = mid + 1;
            } else {
                if mid == 0 {
                    return Ok(None);
                }
                hi = mid - 1;
            }
        }
    }

    /// Resolves the full [`TxBoundary`] for an absolute offset: placement
    /// via the block search, `data_root` via the tx header.
    pub async fn tx_boundary_by_offset(
        &self,
        absolute_offset: u64,
    ) -> Result<Option<TxBoundary>, ChainError> {
        let Some(placement) = self.find_tx_by_offset(absolute_offset).await? else {
            return Ok(None);
        };
        let tx = self.tx(&placement.tx_id).await?;
        let Some(data_root) = tx.data_root else {
            return Ok(None);
        };
        Ok(Some(TxBoundary {
            id: Some(placement.tx_id),
            data_root,
            data_size: placement.tx_size,
            weave_offset: placement.tx_end,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arweave_gateway_types::H256List;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixtureChain {
        blocks: Vec<PartialBlockHeader>,
        tx_offsets: HashMap<H256, TxOffsetInfo>,
        txs: HashMap<H256, TxHeader>,
        block_fetches: AtomicUsize,
    }

    impl FixtureChain {
        fn new(blocks: Vec<PartialBlockHeader>) -> Self {
            Self {
                blocks,
                tx_offsets: HashMap::new(),
                txs: HashMap::new(),
                block_fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChainSource for FixtureChain {
        async fn current_height(&self) -> Result<u64, ChainError> {
            Ok(self.blocks.len() as u64 - 1)
        }

        async fn block_by_height(&self, height: u64) -> Result<PartialBlockHeader, ChainError> {
            self.block_fetches.fetch_add(1, Ordering::SeqCst);
            self.blocks
                .get(height as usize)
                .cloned()
                .ok_or_else(|| ChainError::NotFound(format!("block {height}")))
        }

        async fn block_by_hash(&self, hash: &H384) -> Result<PartialBlockHeader, ChainError> {
            self.blocks
                .iter()
                .find(|b| b.indep_hash == *hash)
                .cloned()
                .ok_or_else(|| ChainError::NotFound("block".into()))
        }

        async fn tx(&self, id: &H256) -> Result<TxHeader, ChainError> {
            self.txs
                .get(id)
                .cloned()
                .ok_or_else(|| ChainError::NotFound("tx".into()))
        }

        async fn tx_offset(&self, id: &H256) -> Result<TxOffsetInfo, ChainError> {
            self.tx_offsets
                .get(id)
                .copied()
                .ok_or_else(|| ChainError::NotFound("tx offset".into()))
        }
    }

    fn block(height: u64, weave_size: u64, txs: Vec<H256>) -> PartialBlockHeader {
        let mut hash_bytes = [0u8; 48];
        hash_bytes[0..8].copy_from_slice(&height.to_be_bytes());
        PartialBlockHeader {
            indep_hash: H384::from(hash_bytes),
            height,
            tx_root: None,
            weave_size,
            txs: H256List(txs),
            previous_block: H384::zero(),
            timestamp: height,
        }
    }

    /// A chain with weave sizes 100, 100, 300, 600, 1000 at heights 0..=4.
    fn growing_chain() -> Vec<PartialBlockHeader> {
        vec![
            block(0, 100, vec![]),
            block(1, 100, vec![]),
            block(2, 300, vec![]),
            block(3, 600, vec![]),
            block(4, 1000, vec![]),
        ]
    }

    #[tokio::test]
    async fn binary_search_finds_the_containing_block() {
        // Offset 250 lives in block 2 (100 < 250 <= 300); the block has no
        // txs so the search reports a miss.
        let client = CompositeChainClient::new(
            Arc::new(FixtureChain::new(growing_chain())),
            ChainClientConfig::default(),
        );
        assert_eq!(client.find_tx_by_offset(250).await.unwrap(), None);
    }

    #[tokio::test]
    async fn offsets_beyond_the_weave_are_missing() {
        let client = CompositeChainClient::new(
            Arc::new(FixtureChain::new(growing_chain())),
            ChainClientConfig::default(),
        );
        assert_eq!(client.find_tx_by_offset(1001).await.unwrap(), None);
    }

    #[tokio::test]
    async fn raw_byte_tx_sort_wins_over_string_sort() {
        // Two txs in a block: the id starting 0xD0 base64url-encodes to a
        // string starting '0', the one starting 0xFA to '-'; as strings
        // "0…" > "-…" while as bytes 0xD0 < 0xFA. The raw-byte sort must
        // probe the 0xD0 tx first.
        let tx_a = H256::from({
            let mut bytes = [0u8; 32];
            bytes[0] = 0xD0;
            bytes
        });
        let tx_b = H256::from({
            let mut bytes = [0u8; 32];
            bytes[0] = 0xFA;
            bytes
        });
        assert!(tx_a.to_base64_url() > tx_b.to_base64_url());
        assert!(tx_a < tx_b);

        let weave_size = 345_449_412_300_000u64;
        let prev_size = 345_449_300_000_000u64;
        let blocks = vec![
            block(0, prev_size, vec![]),
            block(1, weave_size, vec![tx_b, tx_a]),
        ];
        let mut fixture = FixtureChain::new(blocks);
        // tx_a covers the target; tx_b sits after it.
        fixture.tx_offsets.insert(
            tx_a,
            TxOffsetInfo {
                offset: 345_449_412_246_841,
                size: 84_188_227,
            },
        );
        fixture.tx_offsets.insert(
            tx_b,
            TxOffsetInfo {
                offset: weave_size,
                size: 100,
            },
        );

        let client =
            CompositeChainClient::new(Arc::new(fixture), ChainClientConfig::default());
        let placement = client
            .find_tx_by_offset(345_449_370_152_728)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(placement.tx_id, tx_a);
        assert_eq!(placement.tx_offset, 345_449_412_246_841);
        assert_eq!(placement.tx_size, 84_188_227);
        assert_eq!(placement.tx_start, 345_449_328_058_615);
    }

    #[tokio::test]
    async fn txs_without_offsets_are_skipped() {
        let tx_known = H256::from([1u8; 32]);
        let tx_unknown = H256::from([0u8; 32]);
        let blocks = vec![block(0, 1000, vec![tx_unknown, tx_known])];
        let mut fixture = FixtureChain::new(blocks);
        fixture.tx_offsets.insert(
            tx_known,
            TxOffsetInfo {
                offset: 999,
                size: 500,
            },
        );

        let client =
            CompositeChainClient::new(Arc::new(fixture), ChainClientConfig::default());
        let placement = client.find_tx_by_offset(600).await.unwrap().unwrap();
        assert_eq!(placement.tx_id, tx_known);
        assert_eq!(placement.tx_start, 500);
    }

    #[tokio::test]
    async fn blocks_are_cached_between_searches() {
        let fixture = Arc::new(FixtureChain::new(growing_chain()));
        let client = CompositeChainClient::new(
            Arc::clone(&fixture) as Arc<dyn ChainSource>,
            ChainClientConfig::default(),
        );

        client.find_tx_by_offset(250).await.unwrap();
        let fetched_once = fixture.block_fetches.load(Ordering::SeqCst);
        client.find_tx_by_offset(250).await.unwrap();
        assert_eq!(fixture.block_fetches.load(Ordering::SeqCst), fetched_once);
    }

    #[tokio::test]
    async fn boundary_resolution_carries_the_data_root() {
        let tx = H256::from([1u8; 32]);
        let data_root = H256::from([9u8; 32]);
        let blocks = vec![block(0, 1000, vec![tx])];
        let mut fixture = FixtureChain::new(blocks);
        fixture.tx_offsets.insert(
            tx,
            TxOffsetInfo {
                offset: 899,
                size: 400,
            },
        );
        fixture.txs.insert(
            tx,
            TxHeader {
                id: tx,
                data_root: Some(data_root),
                data_size: 400,
                format: 2,
            },
        );

        let client =
            CompositeChainClient::new(Arc::new(fixture), ChainClientConfig::default());
        let boundary = client.tx_boundary_by_offset(700).await.unwrap().unwrap();
        assert_eq!(boundary.id, Some(tx));
        assert_eq!(boundary.data_root, data_root);
        assert_eq!(boundary.data_size, 400);
        assert_eq!(boundary.weave_offset, 899);
        assert_eq!(boundary.tx_data_start(), 500);
    }
}
