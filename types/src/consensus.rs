//! Consensus constants the retrieval core depends on. Values mirror the
//! Arweave reference implementation (ar.hrl / ar_block.erl).

// Maximum size of a single data chunk, in bytes.
pub const DATA_CHUNK_SIZE: u64 = 256 * 1024;

// The original plan was to cap the proof at 262144 (also the maximum chunk size).
// The maximum tree depth is then (262144 - 64) / (32 + 32 + 32) = 2730.
// Later we added support for offset rebases by recognizing the extra 32 bytes,
// possibly at every branching point, as indicating a rebase. To preserve the depth maximum,
// we now cap the size at 2730 * (96 + 32) + 65 = 349504.
pub const MAX_DATA_PATH_SIZE: usize = 349504;

// We may have at most 1000 transactions + 1000 padding nodes => depth=11
// => at most 11 * 96 + 64 bytes worth of the proof. Due to its small size, we
// extend it somewhat for better future-compatibility.
pub const MAX_TX_PATH_SIZE: usize = 2176;

/// The weave offset at which the stricter fork 2.5 data split rules begin to
/// apply. Every non-last chunk of a transaction at or past this offset must be
/// exactly [`DATA_CHUNK_SIZE`] bytes.
pub const STRICT_DATA_SPLIT_THRESHOLD: u64 = 30_607_159_107_830;

/// The weave offset at which merkle offset rebases (zero-marker subtrees) are
/// recognized inside data paths.
pub const MERKLE_REBASE_SUPPORT_THRESHOLD: u64 = 151_066_495_197_430;
