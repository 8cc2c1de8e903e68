use openssl::sha;
use serde_derive::{Deserialize, Serialize};

use crate::{stringify, Base64, H256};

/// Where a chunk's bytes were obtained from. Recorded on every retrieved
/// chunk so the serving layer can report it (`X-AR-IO-Chunk-Source`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkSource {
    Cache,
    Peer,
    TrustedNode,
    S3,
    Gateway,
}

impl std::fmt::Display for ChunkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            ChunkSource::Cache => "cache",
            ChunkSource::Peer => "peer",
            ChunkSource::TrustedNode => "trusted-node",
            ChunkSource::S3 => "s3",
            ChunkSource::Gateway => "gateway",
        };
        write!(f, "{}", name)
    }
}

/// A chunk of transaction data together with its merkle proof material.
///
/// Invariant: `sha256(chunk) == hash`, and `data_path` validates against
/// `data_root` for this chunk's offset under the ruleset selected by its
/// absolute weave offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The raw chunk payload, 1..=DATA_CHUNK_SIZE bytes.
    pub chunk: Vec<u8>,
    /// Merkle proof from `data_root` down to this chunk's leaf.
    pub data_path: Vec<u8>,
    /// Merkle proof from the block's `tx_root` down to the transaction leaf,
    /// when the upstream supplied one.
    pub tx_path: Option<Vec<u8>>,
    pub data_root: H256,
    pub data_size: u64,
    /// Start offset of the chunk relative to the beginning of the tx's data.
    pub offset: u64,
    /// `sha256` of the chunk payload.
    pub hash: H256,
    pub source: ChunkSource,
    pub source_host: Option<String>,
}

impl Chunk {
    /// `sha256` over a chunk payload, the id the cache stores chunks under.
    pub fn compute_hash(payload: &[u8]) -> H256 {
        let mut hasher = sha::Sha256::new();
        hasher.update(payload);
        H256::from(hasher.finish())
    }

    pub fn len(&self) -> u64 {
        self.chunk.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }
}

/// The JSON wire format peers use for `GET /chunk/{offset}` responses, all
/// fields base64url encoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkJson {
    pub chunk: Base64,
    pub data_path: Base64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_path: Option<Base64>,
}

/// The JSON body of a `POST /chunk` upload. Numbers travel as strings, per
/// the node's wire format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkUploadJson {
    pub data_root: H256,
    #[serde(with = "stringify")]
    pub data_size: u64,
    pub data_path: Base64,
    #[serde(with = "stringify")]
    pub offset: u64,
    pub chunk: Base64,
}

/// Metadata persisted alongside cached chunk bytes, keyed by
/// `(data_root, offset)` and additionally indexed by absolute weave offset.
/// The transaction id is deliberately not part of this record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub data_root: H256,
    pub data_size: u64,
    /// Offset of the indexed weave position relative to the tx's data
    /// start; with `data_size` this recovers the tx's weave placement.
    pub offset: u64,
    pub data_path: Base64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_path: Option<Base64>,
    /// `sha256` of the raw chunk bytes.
    pub hash: H256,
}

/// The weave placement of one transaction's data.
///
/// `weave_offset` is the inclusive end of the tx's data in the weave; the
/// first byte sits at `weave_offset - data_size + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxBoundary {
    /// Absent when the boundary was derived from a validated `tx_path`
    /// rather than a transaction lookup.
    pub id: Option<H256>,
    pub data_root: H256,
    pub data_size: u64,
    pub weave_offset: u64,
}

impl TxBoundary {
    /// Absolute weave offset of the first byte of the tx's data.
    pub fn tx_data_start(&self) -> u64 {
        self.weave_offset - self.data_size + 1
    }

    /// Offset of `absolute_offset` within the tx's data.
    pub fn relative_offset(&self, absolute_offset: u64) -> u64 {
        absolute_offset - self.tx_data_start()
    }

    pub fn contains(&self, absolute_offset: u64) -> bool {
        absolute_offset >= self.tx_data_start() && absolute_offset <= self.weave_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_offsets() {
        let boundary = TxBoundary {
            id: None,
            data_root: H256::zero(),
            data_size: 500,
            weave_offset: 1_000_399,
        };
        assert_eq!(boundary.tx_data_start(), 999_900);
        assert_eq!(boundary.relative_offset(1_000_000), 100);
        assert!(boundary.contains(999_900));
        assert!(boundary.contains(1_000_399));
        assert!(!boundary.contains(1_000_400));
    }

    #[test]
    fn chunk_hash_matches_sha256() {
        let payload = vec![7u8; 1024];
        let hash = Chunk::compute_hash(&payload);
        // hash is stable for the same payload
        assert_eq!(hash, Chunk::compute_hash(&payload));
        assert_ne!(hash, Chunk::compute_hash(&[0u8; 1024]));
    }

    #[test]
    fn chunk_json_omits_missing_tx_path() {
        let json = serde_json::to_string(&ChunkJson {
            chunk: Base64(vec![1, 2, 3]),
            data_path: Base64(vec![4, 5, 6]),
            tx_path: None,
        })
        .unwrap();
        assert!(!json.contains("tx_path"));
    }
}
