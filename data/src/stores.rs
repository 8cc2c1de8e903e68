use std::path::{Path, PathBuf};
use std::pin::Pin;

use arweave_gateway_types::{ChunkMetadata, H256};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use openssl::sha;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::{DataError, DataRegion};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, DataError>> + Send>>;

//==============================================================================
// Chunk stores
//------------------------------------------------------------------------------

/// Raw chunk payload bytes, content addressed by `(data_root,
/// relative_offset)` and additionally reachable by absolute weave offset.
#[async_trait]
pub trait ChunkDataStore: Send + Sync {
    async fn get(
        &self,
        data_root: &H256,
        relative_offset: u64,
    ) -> Result<Option<Vec<u8>>, DataError>;

    async fn get_by_absolute_offset(
        &self,
        absolute_offset: u64,
    ) -> Result<Option<Vec<u8>>, DataError>;

    async fn put(
        &self,
        data_root: &H256,
        relative_offset: u64,
        absolute_offset: u64,
        chunk: &[u8],
    ) -> Result<(), DataError>;
}

/// Chunk proof metadata mirroring the data store's keying.
#[async_trait]
pub trait ChunkMetadataStore: Send + Sync {
    async fn get(
        &self,
        data_root: &H256,
        relative_offset: u64,
    ) -> Result<Option<ChunkMetadata>, DataError>;

    async fn get_by_absolute_offset(
        &self,
        absolute_offset: u64,
    ) -> Result<Option<ChunkMetadata>, DataError>;

    async fn put(
        &self,
        absolute_offset: u64,
        metadata: &ChunkMetadata,
    ) -> Result<(), DataError>;
}

fn shard_dir(dir: &Path, name: &str) -> PathBuf {
    dir.join(&name[0..2]).join(name)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DataError> {
    let parent = path.parent().expect("store paths always have a parent");
    fs::create_dir_all(parent).await?;
    let temp = path.with_extension("tmp");
    fs::write(&temp, bytes).await?;
    fs::rename(&temp, path).await?;
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, DataError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Filesystem chunk bytes: `by-root/<rr>/<root>/<offset>` plus pointer
/// files `by-offset/<absolute>` naming the content-addressed entry.
pub struct FsChunkDataStore {
    dir: PathBuf,
}

impl FsChunkDataStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn data_path(&self, data_root: &H256, relative_offset: u64) -> PathBuf {
        shard_dir(&self.dir.join("by-root"), &data_root.to_base64_url())
            .join(relative_offset.to_string())
    }

    fn offset_path(&self, absolute_offset: u64) -> PathBuf {
        self.dir.join("by-offset").join(absolute_offset.to_string())
    }
}

#[async_trait]
impl ChunkDataStore for FsChunkDataStore {
    async fn get(
        &self,
        data_root: &H256,
        relative_offset: u64,
    ) -> Result<Option<Vec<u8>>, DataError> {
        read_optional(&self.data_path(data_root, relative_offset)).await
    }

    async fn get_by_absolute_offset(
        &self,
        absolute_offset: u64,
    ) -> Result<Option<Vec<u8>>, DataError> {
        let Some(pointer) = read_optional(&self.offset_path(absolute_offset)).await? else {
            return Ok(None);
        };
        let pointer = String::from_utf8(pointer)
            .map_err(|_| DataError::Decode("chunk offset pointer is not utf8".into()))?;
        let (root, offset) = pointer
            .split_once(':')
            .ok_or_else(|| DataError::Decode("malformed chunk offset pointer".into()))?;
        let data_root: H256 = arweave_gateway_types::decode::DecodeHash::from(root)
            .map_err(DataError::Decode)?;
        let relative_offset: u64 = offset
            .parse()
            .map_err(|_| DataError::Decode("malformed chunk offset pointer".into()))?;
        self.get(&data_root, relative_offset).await
    }

    async fn put(
        &self,
        data_root: &H256,
        relative_offset: u64,
        absolute_offset: u64,
        chunk: &[u8],
    ) -> Result<(), DataError> {
        write_atomic(&self.data_path(data_root, relative_offset), chunk).await?;
        let pointer = format!("{}:{}", data_root.to_base64_url(), relative_offset);
        write_atomic(&self.offset_path(absolute_offset), pointer.as_bytes()).await
    }
}

/// Filesystem chunk metadata, msgpack encoded, same layout as the data
/// store.
pub struct FsChunkMetadataStore {
    dir: PathBuf,
}

impl FsChunkMetadataStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn metadata_path(&self, data_root: &H256, relative_offset: u64) -> PathBuf {
        shard_dir(&self.dir.join("by-root"), &data_root.to_base64_url())
            .join(format!("{relative_offset}.msgpack"))
    }

    fn offset_path(&self, absolute_offset: u64) -> PathBuf {
        self.dir
            .join("by-offset")
            .join(format!("{absolute_offset}.msgpack"))
    }

    fn decode(bytes: Vec<u8>) -> Result<ChunkMetadata, DataError> {
        rmp_serde::from_slice(&bytes).map_err(|e| DataError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ChunkMetadataStore for FsChunkMetadataStore {
    async fn get(
        &self,
        data_root: &H256,
        relative_offset: u64,
    ) -> Result<Option<ChunkMetadata>, DataError> {
        match read_optional(&self.metadata_path(data_root, relative_offset)).await? {
            Some(bytes) => Self::decode(bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn get_by_absolute_offset(
        &self,
        absolute_offset: u64,
    ) -> Result<Option<ChunkMetadata>, DataError> {
        match read_optional(&self.offset_path(absolute_offset)).await? {
            Some(bytes) => Self::decode(bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        absolute_offset: u64,
        metadata: &ChunkMetadata,
    ) -> Result<(), DataError> {
        let bytes =
            rmp_serde::to_vec_named(metadata).map_err(|e| DataError::Decode(e.to_string()))?;
        write_atomic(
            &self.metadata_path(&metadata.data_root, metadata.offset),
            &bytes,
        )
        .await?;
        write_atomic(&self.offset_path(absolute_offset), &bytes).await
    }
}

//==============================================================================
// Contiguous data store
//------------------------------------------------------------------------------

/// Streaming handle for writing one object into the store. Data lands in a
/// staging file; `finalize` renames it under its content hash, which makes
/// concurrent writers of the same object idempotent (last writer wins with
/// a complete file).
pub struct DataWriteHandle {
    file: fs::File,
    temp_path: PathBuf,
    dir: PathBuf,
    hasher: sha::Sha256,
    written: u64,
    settled: bool,
}

/// A handle dropped without finalize or discard (consumer cancelled the
/// stream mid-write) must not leak its staging file.
impl Drop for DataWriteHandle {
    fn drop(&mut self) {
        if !self.settled {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

impl DataWriteHandle {
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), DataError> {
        self.hasher.update(bytes);
        self.file.write_all(bytes).await?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Moves the staged bytes under their content hash and returns it.
    pub async fn finalize(mut self) -> Result<H256, DataError> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        let hash = H256::from(self.hasher.clone().finish());
        let path = shard_dir(&self.dir, &hash.to_base64_url());
        fs::create_dir_all(path.parent().expect("sharded path has a parent")).await?;
        fs::rename(&self.temp_path, &path).await?;
        self.settled = true;
        Ok(hash)
    }

    /// Removes the staged bytes. Used on pipeline failure and cancellation.
    pub async fn discard(mut self) -> Result<(), DataError> {
        self.settled = true;
        match fs::remove_file(&self.temp_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Content-addressed storage of contiguous data objects, readable as
/// streams with optional byte regions.
#[async_trait]
pub trait ContiguousDataStore: Send + Sync {
    /// A stream over the stored object (or `region` of it), plus the number
    /// of bytes the stream will yield.
    async fn get(
        &self,
        hash: &H256,
        region: Option<DataRegion>,
    ) -> Result<Option<(ByteStream, u64)>, DataError>;

    async fn create_write(&self) -> Result<DataWriteHandle, DataError>;
}

/// Filesystem data store: `data/<hh>/<hash>` files with a `tmp/` staging
/// area.
pub struct FsDataStore {
    dir: PathBuf,
    sequence: std::sync::atomic::AtomicU64,
}

impl FsDataStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            sequence: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn data_dir(&self) -> PathBuf {
        self.dir.join("data")
    }
}

#[async_trait]
impl ContiguousDataStore for FsDataStore {
    async fn get(
        &self,
        hash: &H256,
        region: Option<DataRegion>,
    ) -> Result<Option<(ByteStream, u64)>, DataError> {
        let path = shard_dir(&self.data_dir(), &hash.to_base64_url());
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let total = file.metadata().await?.len();

        let (offset, size) = match region {
            Some(region) => {
                if region.offset >= total {
                    return Err(DataError::NotFound(format!(
                        "region at {} is past the end of {} bytes",
                        region.offset, total
                    )));
                }
                (region.offset, region.size.min(total - region.offset))
            }
            None => (0, total),
        };
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let stream = async_stream::try_stream! {
            let mut remaining = size;
            let mut buf = vec![0u8; 64 * 1024];
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let got = file.read(&mut buf[..want]).await?;
                if got == 0 {
                    Err(DataError::Decode("stored object shorter than expected".into()))?;
                }
                remaining -= got as u64;
                yield Bytes::copy_from_slice(&buf[..got]);
            }
        };
        Ok(Some((Box::pin(stream), size)))
    }

    async fn create_write(&self) -> Result<DataWriteHandle, DataError> {
        let staging = self.dir.join("tmp");
        fs::create_dir_all(&staging).await?;
        let sequence = self
            .sequence
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let temp_path = staging.join(format!("{}-{sequence}.partial", std::process::id()));
        let file = fs::File::create(&temp_path).await?;
        Ok(DataWriteHandle {
            file,
            temp_path,
            dir: self.data_dir(),
            hasher: sha::Sha256::new(),
            written: 0,
            settled: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arweave_gateway_types::Base64;
    use futures::StreamExt;

    async fn collect(stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut stream = stream;
        while let Some(bytes) = stream.next().await {
            out.extend_from_slice(&bytes.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn chunk_stores_round_trip_by_both_keys() {
        let dir = tempfile::tempdir().unwrap();
        let data_store = FsChunkDataStore::new(dir.path().join("chunks"));
        let metadata_store = FsChunkMetadataStore::new(dir.path().join("chunk-metadata"));

        let data_root = H256::from([5u8; 32]);
        let chunk = vec![9u8; 1000];
        data_store
            .put(&data_root, 100, 1_000_000, &chunk)
            .await
            .unwrap();

        let metadata = ChunkMetadata {
            data_root,
            data_size: 500,
            offset: 100,
            data_path: Base64(vec![1, 2, 3]),
            tx_path: None,
            hash: arweave_gateway_types::Chunk::compute_hash(&chunk),
        };
        metadata_store.put(1_000_000, &metadata).await.unwrap();

        assert_eq!(
            data_store.get(&data_root, 100).await.unwrap(),
            Some(chunk.clone())
        );
        assert_eq!(
            data_store.get_by_absolute_offset(1_000_000).await.unwrap(),
            Some(chunk)
        );
        assert_eq!(
            metadata_store.get(&data_root, 100).await.unwrap(),
            Some(metadata.clone())
        );
        assert_eq!(
            metadata_store
                .get_by_absolute_offset(1_000_000)
                .await
                .unwrap(),
            Some(metadata)
        );

        assert_eq!(data_store.get(&data_root, 101).await.unwrap(), None);
        assert_eq!(
            data_store.get_by_absolute_offset(999_999).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn data_store_finalizes_under_the_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDataStore::new(dir.path());

        let payload = (0u32..50_000).flat_map(|i| i.to_le_bytes()).collect::<Vec<u8>>();
        let mut handle = store.create_write().await.unwrap();
        for piece in payload.chunks(7919) {
            handle.write(piece).await.unwrap();
        }
        assert_eq!(handle.written(), payload.len() as u64);
        let hash = handle.finalize().await.unwrap();
        assert_eq!(hash, arweave_gateway_types::Chunk::compute_hash(&payload));

        let (stream, size) = store.get(&hash, None).await.unwrap().unwrap();
        assert_eq!(size, payload.len() as u64);
        assert_eq!(collect(stream).await, payload);
    }

    #[tokio::test]
    async fn data_store_serves_regions() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDataStore::new(dir.path());

        let payload: Vec<u8> = (0..=255u8).cycle().take(100_000).collect();
        let mut handle = store.create_write().await.unwrap();
        handle.write(&payload).await.unwrap();
        let hash = handle.finalize().await.unwrap();

        let (stream, size) = store
            .get(
                &hash,
                Some(DataRegion {
                    offset: 70_000,
                    size: 10_000,
                }),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(size, 10_000);
        assert_eq!(collect(stream).await, payload[70_000..80_000]);

        // Regions are clamped to the object's end.
        let (_, clamped) = store
            .get(
                &hash,
                Some(DataRegion {
                    offset: 95_000,
                    size: 10_000,
                }),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(clamped, 5_000);
    }

    #[tokio::test]
    async fn discard_cleans_the_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDataStore::new(dir.path());
        let mut handle = store.create_write().await.unwrap();
        handle.write(b"partial").await.unwrap();
        handle.discard().await.unwrap();

        let staging: Vec<_> = std::fs::read_dir(dir.path().join("tmp"))
            .unwrap()
            .collect();
        assert!(staging.is_empty());
    }
}
