use arweave_gateway_types::{consensus::DATA_CHUNK_SIZE, H256};
use borsh::BorshDeserialize;
use borsh_derive::BorshDeserialize;
use openssl::sha;
use thiserror::Error;

use crate::Ruleset;

pub const HASH_SIZE: usize = 32;
pub const NOTE_SIZE: usize = 32;

/// A leaf frame: `data_hash(32) ∥ note(32, big-endian)`.
pub const LEAF_PROOF_SIZE: usize = HASH_SIZE + NOTE_SIZE;
/// A branch frame: `left(32) ∥ right(32) ∥ boundary(32, big-endian)`.
pub const BRANCH_PROOF_SIZE: usize = HASH_SIZE * 2 + NOTE_SIZE;
/// A rebased branch frame: a 32-byte zero slab followed by a branch frame.
pub const REBASED_BRANCH_PROOF_SIZE: usize = HASH_SIZE + BRANCH_PROOF_SIZE;

/// Everything that makes a `data_path` or `tx_path` unusable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("branch hash does not match the expected path hash")]
    InvalidBranchProof,
    #[error("leaf hash does not match the expected path hash")]
    InvalidLeafProof,
    #[error("path length is inconsistent with the encoded structure")]
    InvalidPathLength,
    #[error("chunk exceeds the maximum chunk size")]
    OversizedChunk,
    #[error("non-last chunk violates the strict data split rules")]
    InvalidDataSplit,
    #[error("leaf boundaries are empty or do not contain the target offset")]
    InvalidBoundaries,
    #[error("chunk bytes do not hash to the proof's data hash")]
    ChunkHashMismatch,
    #[error("proof frame failed to decode")]
    MalformedProof,
}

/// Populated with data from a deserialized leaf frame (original data chunk).
#[repr(C)]
#[derive(BorshDeserialize, Debug, PartialEq, Clone)]
pub struct LeafProof {
    data_hash: [u8; HASH_SIZE],
    notepad: [u8; NOTE_SIZE - 8],
    offset: [u8; 8],
}

/// Populated with data from a deserialized branch frame (hash of a pair of
/// child nodes).
#[derive(BorshDeserialize, Debug, PartialEq, Clone)]
pub struct BranchProof {
    left_id: [u8; HASH_SIZE],
    right_id: [u8; HASH_SIZE],
    notepad: [u8; NOTE_SIZE - 8],
    offset: [u8; 8],
}

/// A branch frame prefixed with the all-zero rebase marker. The subtree
/// entered through it runs in its own zero-based offset frame.
#[derive(BorshDeserialize, Debug, PartialEq, Clone)]
pub struct RebasedBranchProof {
    zero_marker: [u8; HASH_SIZE],
    left_id: [u8; HASH_SIZE],
    right_id: [u8; HASH_SIZE],
    notepad: [u8; NOTE_SIZE - 8],
    offset: [u8; 8],
}

/// Includes methods to deserialize proof frames.
pub trait ProofDeserialize<T> {
    fn try_from_proof_slice(slice: &[u8]) -> Result<T, PathError>;
    fn offset(&self) -> u64;
}

impl ProofDeserialize<LeafProof> for LeafProof {
    fn try_from_proof_slice(slice: &[u8]) -> Result<Self, PathError> {
        LeafProof::try_from_slice(slice).map_err(|_| PathError::MalformedProof)
    }
    fn offset(&self) -> u64 {
        u64::from_be_bytes(self.offset)
    }
}

impl ProofDeserialize<BranchProof> for BranchProof {
    fn try_from_proof_slice(slice: &[u8]) -> Result<Self, PathError> {
        BranchProof::try_from_slice(slice).map_err(|_| PathError::MalformedProof)
    }
    fn offset(&self) -> u64 {
        u64::from_be_bytes(self.offset)
    }
}

impl ProofDeserialize<RebasedBranchProof> for RebasedBranchProof {
    fn try_from_proof_slice(slice: &[u8]) -> Result<Self, PathError> {
        RebasedBranchProof::try_from_slice(slice).map_err(|_| PathError::MalformedProof)
    }
    fn offset(&self) -> u64 {
        u64::from_be_bytes(self.offset)
    }
}

/// Converts an offset to the 32-byte big-endian note used in node hashing.
pub fn note_bytes(value: u64) -> [u8; NOTE_SIZE] {
    let mut note = [0u8; NOTE_SIZE];
    note[NOTE_SIZE - 8..].copy_from_slice(&value.to_be_bytes());
    note
}

pub fn hash_sha256(message: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = sha::Sha256::new();
    hasher.update(message);
    hasher.finish()
}

/// Returns a SHA256 hash of the concatenated SHA256 hashes of the messages.
pub fn hash_all_sha256(messages: &[&[u8]]) -> [u8; HASH_SIZE] {
    let mut hasher = sha::Sha256::new();
    for message in messages {
        hasher.update(&hash_sha256(message));
    }
    hasher.finish()
}

/// The chunk placement a validated `data_path` proves, in tx-relative
/// coordinates. `end_offset` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathBoundaries {
    pub start_offset: u64,
    pub end_offset: u64,
    pub chunk_size: u64,
    /// True when every branch on the root-to-leaf walk took the right side
    /// of its innermost subtree; the strict split rules only allow a short
    /// chunk in that position.
    pub is_right_most_in_subtree: bool,
    pub is_rebased: bool,
    pub rebase_depth: u32,
}

/// The outcome of a successful [`parse_data_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDataPath {
    /// The `sha256` the leaf commits the chunk payload to.
    pub chunk_data_hash: [u8; HASH_SIZE],
    pub boundaries: PathBoundaries,
}

/// The outcome of a successful [`parse_tx_path`]. The leaf of a `tx_path`
/// commits to the transaction's `data_root`, and its bounds are the tx's
/// data span within the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTxPath {
    pub data_root: H256,
    pub start_offset: u64,
    pub end_offset: u64,
}

/// Parses and validates a `data_path` against `data_root` for the chunk
/// containing `offset` (a tx-relative byte offset, clamped into
/// `[0, data_size - 1]`).
///
/// The path is a root-to-leaf concatenation of frames. Branch frames narrow
/// the `[left_bound, right_bound)` window around the target offset while the
/// running expected hash is checked at every step; the final leaf frame
/// commits to the chunk payload hash and the chunk's right edge. Under
/// [`Ruleset::OffsetRebaseSupport`] a frame may instead carry the zero-slab
/// rebase marker, restarting the window at zero for the entered subtree.
pub fn parse_data_path(
    data_root: H256,
    data_size: u64,
    data_path: &[u8],
    offset: u64,
    ruleset: Ruleset,
) -> Result<ParsedDataPath, PathError> {
    if data_size == 0 {
        return Err(PathError::InvalidBoundaries);
    }

    let mut expected_hash: [u8; HASH_SIZE] = data_root.0;
    let mut target = offset.min(data_size - 1);
    let mut left_bound: u64 = 0;
    let mut right_bound: u64 = data_size;
    // Offsets removed from the frame by rebases, added back when reporting
    // tx-relative boundaries.
    let mut rebase_shift: u64 = 0;
    let mut is_right_most = true;
    let mut rebase_depth: u32 = 0;
    let mut rest = data_path;

    loop {
        if rest.len() == LEAF_PROOF_SIZE {
            let leaf = LeafProof::try_from_proof_slice(rest)?;
            let id = hash_all_sha256(&[&leaf.data_hash, &note_bytes(leaf.offset())]);
            if id != expected_hash {
                return Err(PathError::InvalidLeafProof);
            }

            let end = leaf.offset().min(right_bound);
            if end <= left_bound || target < left_bound || target >= end {
                return Err(PathError::InvalidBoundaries);
            }
            let chunk_size = end - left_bound;

            // Border and split checks run in the innermost subtree's own
            // coordinates; reported boundaries are tx-relative.
            if ruleset.check_borders() && chunk_size > DATA_CHUNK_SIZE {
                return Err(PathError::OversizedChunk);
            }
            if ruleset.check_split()
                && !is_right_most
                && (chunk_size != DATA_CHUNK_SIZE || left_bound % DATA_CHUNK_SIZE != 0)
            {
                return Err(PathError::InvalidDataSplit);
            }

            return Ok(ParsedDataPath {
                chunk_data_hash: leaf.data_hash,
                boundaries: PathBoundaries {
                    start_offset: rebase_shift + left_bound,
                    end_offset: rebase_shift + end,
                    chunk_size,
                    is_right_most_in_subtree: is_right_most,
                    is_rebased: rebase_depth > 0,
                    rebase_depth,
                },
            });
        }

        if ruleset.allow_rebase()
            && rest.len() >= REBASED_BRANCH_PROOF_SIZE + LEAF_PROOF_SIZE
            && rest[..HASH_SIZE].iter().all(|byte| *byte == 0)
        {
            let proof =
                RebasedBranchProof::try_from_proof_slice(&rest[..REBASED_BRANCH_PROOF_SIZE])?;
            let id = hash_all_sha256(&[
                &proof.left_id,
                &proof.right_id,
                &note_bytes(proof.offset()),
            ]);
            if id != expected_hash {
                return Err(PathError::InvalidBranchProof);
            }

            let boundary = proof.offset();
            if target < boundary {
                expected_hash = proof.left_id;
                right_bound = right_bound.min(boundary);
            } else {
                expected_hash = proof.right_id;
                left_bound = left_bound.max(boundary);
            }

            // Enter the subtree's zero-based frame.
            rebase_shift += left_bound;
            target -= left_bound;
            right_bound -= left_bound;
            left_bound = 0;
            is_right_most = true;
            rebase_depth += 1;
            rest = &rest[REBASED_BRANCH_PROOF_SIZE..];
            continue;
        }

        if rest.len() >= BRANCH_PROOF_SIZE + LEAF_PROOF_SIZE {
            let proof = BranchProof::try_from_proof_slice(&rest[..BRANCH_PROOF_SIZE])?;
            let id = hash_all_sha256(&[
                &proof.left_id,
                &proof.right_id,
                &note_bytes(proof.offset()),
            ]);
            if id != expected_hash {
                return Err(PathError::InvalidBranchProof);
            }

            // The boundary is the left subtree's exclusive right edge, so an
            // equal target belongs to the right side.
            let boundary = proof.offset();
            if target < boundary {
                expected_hash = proof.left_id;
                right_bound = right_bound.min(boundary);
                is_right_most = false;
            } else {
                expected_hash = proof.right_id;
                left_bound = left_bound.max(boundary);
            }
            rest = &rest[BRANCH_PROOF_SIZE..];
            continue;
        }

        return Err(PathError::InvalidPathLength);
    }
}

/// Parses and validates a `tx_path` against a block's `tx_root` for the
/// transaction containing `offset` (a block-relative byte offset).
///
/// Transaction trees never carry rebase markers and their leaves span whole
/// transactions, so the permissive ruleset applies.
pub fn parse_tx_path(
    tx_root: H256,
    block_span: u64,
    tx_path: &[u8],
    offset: u64,
) -> Result<ParsedTxPath, PathError> {
    let parsed = parse_data_path(tx_root, block_span, tx_path, offset, Ruleset::Basic)?;
    Ok(ParsedTxPath {
        data_root: H256::from(parsed.chunk_data_hash),
        start_offset: parsed.boundaries.start_offset,
        end_offset: parsed.boundaries.end_offset,
    })
}

/// Validates a chunk payload against its `data_path`: the path must parse
/// under `ruleset` and the payload must hash to the leaf's data hash.
pub fn validate_chunk(
    data_root: H256,
    data_size: u64,
    data_path: &[u8],
    offset: u64,
    ruleset: Ruleset,
    chunk: &[u8],
) -> Result<ParsedDataPath, PathError> {
    let parsed = parse_data_path(data_root, data_size, data_path, offset, ruleset)?;
    if hash_sha256(chunk) != parsed.chunk_data_hash {
        return Err(PathError::ChunkHashMismatch);
    }
    if chunk.len() as u64 != parsed.boundaries.chunk_size {
        return Err(PathError::InvalidBoundaries);
    }
    Ok(parsed)
}

/// Reads the note from the tail of a path: the last 32 bytes as a big-endian
/// integer. For a `tx_path` this is the tx's inclusive-end weave offset
/// relative to the block start plus one.
pub fn extract_note(path: &[u8]) -> Result<u64, PathError> {
    if path.len() < NOTE_SIZE {
        return Err(PathError::InvalidPathLength);
    }
    let tail = &path[path.len() - 8..];
    Ok(u64::from_be_bytes(
        tail.try_into().map_err(|_| PathError::MalformedProof)?,
    ))
}

/// Computes the root hash a path commits to, without any offset checks. The
/// root is the hash of the first frame; callers compare it against an
/// expected `tx_root` or `data_root`.
pub fn extract_root(path: &[u8]) -> Result<[u8; HASH_SIZE], PathError> {
    if path.len() == LEAF_PROOF_SIZE {
        let leaf = LeafProof::try_from_proof_slice(path)?;
        return Ok(hash_all_sha256(&[
            &leaf.data_hash,
            &note_bytes(leaf.offset()),
        ]));
    }
    if path.len() >= REBASED_BRANCH_PROOF_SIZE + LEAF_PROOF_SIZE
        && path[..HASH_SIZE].iter().all(|byte| *byte == 0)
    {
        let proof = RebasedBranchProof::try_from_proof_slice(&path[..REBASED_BRANCH_PROOF_SIZE])?;
        return Ok(hash_all_sha256(&[
            &proof.left_id,
            &proof.right_id,
            &note_bytes(proof.offset()),
        ]));
    }
    if path.len() >= BRANCH_PROOF_SIZE + LEAF_PROOF_SIZE {
        let proof = BranchProof::try_from_proof_slice(&path[..BRANCH_PROOF_SIZE])?;
        return Ok(hash_all_sha256(&[
            &proof.left_id,
            &proof.right_id,
            &note_bytes(proof.offset()),
        ]));
    }
    Err(PathError::InvalidPathLength)
}
