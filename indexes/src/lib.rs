//! Hash indexes backing id → root-tx lookups in the gateway.
//!
//! The core format is CDB64, a constant database with 64-bit offsets: one
//! 4 KiB header pinning 256 bucket tables, a streamed record section, and
//! per-bucket open-addressed hash tables. A logical index is split 256 ways
//! by the first key byte, with a JSON manifest describing where each
//! partition lives: a local file, an HTTP url, or a byte range inside
//! another transaction's data. All of those reduce to the same
//! [`ByteRangeSource`] read path, so a partition served over HTTP probes
//! exactly like one on disk.

pub mod byte_range;
pub mod caching;
pub mod cdb64;
pub mod manifest;
pub mod partitioned;

pub use byte_range::{
    ByteRangeError, ByteRangeSource, FileByteRangeSource, HttpByteRangeSource,
    LargeObjectByteRangeSource, LargeObjectSource,
};
pub use caching::CachingByteRangeSource;
pub use cdb64::{djb2, Cdb64Error, Cdb64Reader, Cdb64Writer};
pub use manifest::{Cdb64Manifest, PartitionInfo, PartitionLocation};
pub use partitioned::{PartitionedCdb64Reader, PartitionedCdb64ReaderOptions, PartitionedCdb64Writer};
