use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{Mutex, OnceCell};

use crate::byte_range::{ByteRangeError, ByteRangeSource};

pub const DEFAULT_HEADER_SIZE: u64 = 4096;
pub const DEFAULT_REGION_CAPACITY: usize = 256;

/// Wraps any [`ByteRangeSource`] with two caches: a permanent pin of the
/// first `header_size` bytes, fetched once on first access to that region,
/// and an LRU of other `(offset, size)` regions keyed by the literal
/// `"{offset}:{size}"` string.
///
/// The header pin is what makes remote CDB64 partitions cheap: every `get`
/// touches the 4 KiB header, and only the first one pays a network round
/// trip for it.
pub struct CachingByteRangeSource {
    source: Arc<dyn ByteRangeSource>,
    header_size: u64,
    header: OnceCell<Arc<Vec<u8>>>,
    regions: Mutex<LruCache<String, Arc<Vec<u8>>>>,
    owns_source: bool,
}

impl CachingByteRangeSource {
    pub fn new(source: Arc<dyn ByteRangeSource>, owns_source: bool) -> Self {
        Self::with_capacity(
            source,
            owns_source,
            DEFAULT_HEADER_SIZE,
            DEFAULT_REGION_CAPACITY,
        )
    }

    pub fn with_capacity(
        source: Arc<dyn ByteRangeSource>,
        owns_source: bool,
        header_size: u64,
        region_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(region_capacity.max(1)).unwrap();
        Self {
            source,
            header_size,
            header: OnceCell::new(),
            regions: Mutex::new(LruCache::new(capacity)),
            owns_source,
        }
    }

    async fn header_bytes(&self) -> Result<Arc<Vec<u8>>, ByteRangeError> {
        let header_size = self.header_size;
        self.header
            .get_or_try_init(|| async {
                self.source.read(0, header_size).await.map(Arc::new)
            })
            .await
            .cloned()
    }

    async fn read_region(&self, offset: u64, size: u64) -> Result<Vec<u8>, ByteRangeError> {
        let key = format!("{}:{}", offset, size);
        if let Some(hit) = self.regions.lock().await.get(&key).cloned() {
            return Ok(hit.as_ref().clone());
        }
        let bytes = self.source.read(offset, size).await?;
        self.regions
            .lock()
            .await
            .put(key, Arc::new(bytes.clone()));
        Ok(bytes)
    }
}

#[async_trait]
impl ByteRangeSource for CachingByteRangeSource {
    async fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>, ByteRangeError> {
        if size == 0 {
            return Ok(Vec::new());
        }

        if offset < self.header_size {
            let header = self.header_bytes().await?;
            let end = offset + size;
            if end <= self.header_size {
                return Ok(header[offset as usize..end as usize].to_vec());
            }
            // Split a read spanning the header boundary.
            let mut out = header[offset as usize..].to_vec();
            let tail = self
                .read_region(self.header_size, end - self.header_size)
                .await?;
            out.extend(tail);
            return Ok(out);
        }

        self.read_region(offset, size).await
    }

    async fn close(&self) -> Result<(), ByteRangeError> {
        self.regions.lock().await.clear();
        if self.owns_source {
            self.source.close().await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.source.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingSource {
        data: Vec<u8>,
        reads: AtomicUsize,
        open: AtomicBool,
    }

    impl CountingSource {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                reads: AtomicUsize::new(0),
                open: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl ByteRangeSource for CountingSource {
        async fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>, ByteRangeError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let start = offset as usize;
            let end = start + size as usize;
            if end > self.data.len() {
                return Err(ByteRangeError::ShortRead {
                    offset,
                    wanted: size,
                    got: 0,
                });
            }
            Ok(self.data[start..end].to_vec())
        }

        async fn close(&self) -> Result<(), ByteRangeError> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    fn fixture(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn header_is_fetched_once_and_pinned() {
        let inner = Arc::new(CountingSource::new(fixture(10_000)));
        let caching =
            CachingByteRangeSource::with_capacity(Arc::clone(&inner) as _, false, 4096, 8);

        let first = caching.read(0, 100).await.unwrap();
        let second = caching.read(2000, 96).await.unwrap();
        assert_eq!(first, fixture(10_000)[0..100]);
        assert_eq!(second, fixture(10_000)[2000..2096]);
        // One header fetch serves both header reads.
        assert_eq!(inner.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reads_spanning_the_header_boundary_are_split() {
        let inner = Arc::new(CountingSource::new(fixture(10_000)));
        let caching =
            CachingByteRangeSource::with_capacity(Arc::clone(&inner) as _, false, 4096, 8);

        let bytes = caching.read(4000, 200).await.unwrap();
        assert_eq!(bytes, fixture(10_000)[4000..4200]);
        // Header fetch plus one tail region fetch.
        assert_eq!(inner.reads.load(Ordering::SeqCst), 2);

        // The tail region is now cached under its own key.
        let again = caching.read(4096, 104).await.unwrap();
        assert_eq!(again, fixture(10_000)[4096..4200]);
        assert_eq!(inner.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_clears_regions_and_optionally_closes_the_source() {
        let inner = Arc::new(CountingSource::new(fixture(10_000)));
        let caching = CachingByteRangeSource::with_capacity(Arc::clone(&inner) as _, true, 64, 8);
        caching.read(5000, 10).await.unwrap();
        caching.close().await.unwrap();
        assert!(!inner.is_open());
        assert!(!caching.is_open());
    }

    #[tokio::test]
    async fn borrowed_source_stays_open_on_close() {
        let inner = Arc::new(CountingSource::new(fixture(1_000)));
        let caching = CachingByteRangeSource::with_capacity(Arc::clone(&inner) as _, false, 64, 8);
        caching.close().await.unwrap();
        assert!(inner.is_open());
    }
}
