use serde_derive::{Deserialize, Serialize};

use crate::{optional_hash, stringify, H256, H256List, H384};

/// The subset of an Arweave block header the retrieval core needs. A full
/// header carries dozens more consensus fields; deserialization ignores them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialBlockHeader {
    /// The block identifier.
    pub indep_hash: H384,

    /// The block height.
    pub height: u64,

    /// The Merkle root of the tree whose leaves are the data_roots of each of
    /// the transactions in the block. Empty string in blocks with no txs.
    #[serde(default, with = "optional_hash")]
    pub tx_root: Option<H256>,

    /// The total number of bytes in the weave dataset at this block height.
    /// Cumulative, monotonically non-decreasing with height.
    #[serde(with = "stringify")]
    pub weave_size: u64,

    /// List of transaction ids included in the block.
    pub txs: H256List,

    pub previous_block: H384,

    /// Unix timestamp of when the block was discovered/produced
    pub timestamp: u64,
}

/// The subset of a transaction header needed to resolve data offsets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxHeader {
    pub id: H256,

    #[serde(default, with = "optional_hash")]
    pub data_root: Option<H256>,

    #[serde(with = "stringify")]
    pub data_size: u64,

    /// Transaction format; format 1 txs inline their data, format 2 commit to
    /// it via `data_root`.
    #[serde(default)]
    pub format: u8,
}

/// Response shape of the trusted node's `GET /tx/{id}/offset` endpoint.
/// `offset` is the inclusive end of the tx's data in the weave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOffsetInfo {
    #[serde(with = "stringify")]
    pub offset: u64,

    #[serde(with = "stringify")]
    pub size: u64,
}

impl TxOffsetInfo {
    /// Absolute weave offset of the first byte of the tx's data.
    pub fn data_start(&self) -> u64 {
        self.offset - self.size + 1
    }
}
