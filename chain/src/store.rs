use std::path::{Path, PathBuf};

use arweave_gateway_types::{PartialBlockHeader, TxHeader, H256, H384};
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;

use crate::ChainError;

/// Content-addressed on-disk store of msgpack-encoded records, sharded into
/// subdirectories by the first two characters of the base64url name so no
/// single directory grows unbounded.
struct ShardedStore {
    dir: PathBuf,
}

impl ShardedStore {
    fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(&name[0..2]).join(format!("{name}.msgpack"))
    }

    async fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ChainError> {
        let path = self.path_for(name);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        rmp_serde::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ChainError::Decode(format!("{path:?}: {e}")))
    }

    async fn put<T: Serialize>(&self, name: &str, value: &T) -> Result<(), ChainError> {
        let path = self.path_for(name);
        let parent = path.parent().expect("sharded paths always have a parent");
        fs::create_dir_all(parent).await?;

        let bytes =
            rmp_serde::to_vec_named(value).map_err(|e| ChainError::Decode(e.to_string()))?;
        // Write-then-rename keeps concurrent writers of the same record
        // idempotent; last writer wins with a complete file.
        let temp = path.with_extension("msgpack.tmp");
        fs::write(&temp, &bytes).await?;
        fs::rename(&temp, &path).await?;
        Ok(())
    }
}

/// Block headers by `indep_hash`.
pub struct BlockStore {
    inner: ShardedStore,
}

impl BlockStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            inner: ShardedStore::new(dir),
        }
    }

    pub async fn get(&self, hash: &H384) -> Result<Option<PartialBlockHeader>, ChainError> {
        self.inner.get(&hash.to_base64_url()).await
    }

    pub async fn put(&self, block: &PartialBlockHeader) -> Result<(), ChainError> {
        self.inner
            .put(&block.indep_hash.to_base64_url(), block)
            .await
    }
}

/// Transaction headers by id.
pub struct TxStore {
    inner: ShardedStore,
}

impl TxStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            inner: ShardedStore::new(dir),
        }
    }

    pub async fn get(&self, id: &H256) -> Result<Option<TxHeader>, ChainError> {
        self.inner.get(&id.to_base64_url()).await
    }

    pub async fn put(&self, tx: &TxHeader) -> Result<(), ChainError> {
        self.inner.put(&tx.id.to_base64_url(), tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arweave_gateway_types::H256List;

    #[tokio::test]
    async fn block_store_round_trips_and_shards() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::new(dir.path());

        let block = PartialBlockHeader {
            indep_hash: H384::from([7u8; 48]),
            height: 1_700_011,
            tx_root: Some(H256::from([1u8; 32])),
            weave_size: 345_449_412_300_000,
            txs: H256List(vec![H256::from([2u8; 32])]),
            previous_block: H384::from([6u8; 48]),
            timestamp: 1_712_345_678,
        };
        store.put(&block).await.unwrap();

        let loaded = store.get(&block.indep_hash).await.unwrap().unwrap();
        assert_eq!(loaded.height, block.height);
        assert_eq!(loaded.weave_size, block.weave_size);
        assert_eq!(loaded.txs, block.txs);

        // Sharded under the first two base64url chars of the name.
        let name = block.indep_hash.to_base64_url();
        assert!(dir.path().join(&name[0..2]).is_dir());

        let missing = store.get(&H384::from([9u8; 48])).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn tx_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TxStore::new(dir.path());

        let tx = TxHeader {
            id: H256::from([3u8; 32]),
            data_root: Some(H256::from([4u8; 32])),
            data_size: 84_188_227,
            format: 2,
        };
        store.put(&tx).await.unwrap();
        let loaded = store.get(&tx.id).await.unwrap().unwrap();
        assert_eq!(loaded.data_size, tx.data_size);
        assert_eq!(loaded.data_root, tx.data_root);
    }
}
