//! Merkle proof parsing and validation for weave data retrieval.
//!
//! A gateway serving `GET /chunk/{offset}` style requests never trusts a
//! peer: every chunk response carries a `data_path` proof that is checked
//! against the transaction's `data_root` before any byte is returned or
//! cached. Which checks apply depends on where in the weave the chunk lives,
//! because the validation rules were tightened twice over the network's
//! history (fork 2.5 strict data splits, fork 2.7 offset rebases).

use arweave_gateway_types::consensus::{
    MERKLE_REBASE_SUPPORT_THRESHOLD, STRICT_DATA_SPLIT_THRESHOLD,
};

pub mod merkle;
#[cfg(any(test, feature = "test-support"))]
pub mod tree;

pub use merkle::{
    extract_note, extract_root, parse_data_path, parse_tx_path, validate_chunk, ParsedDataPath,
    ParsedTxPath, PathBoundaries, PathError,
};

/// The validation ruleset to apply to a `data_path`.
///
/// Rulesets are cumulative: each later one keeps all the checks of the
/// previous and adds its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ruleset {
    /// Pre fork 2.5 rules. Any split geometry is accepted.
    Basic,
    /// Chunk sizes are capped at the maximum chunk size.
    StrictBorders,
    /// Every chunk except the last of its (sub)tree must be exactly the
    /// maximum chunk size and start on a chunk-size aligned offset.
    StrictDataSplit,
    /// StrictDataSplit plus zero-marker rebased subtrees are recognized.
    OffsetRebaseSupport,
}

impl Ruleset {
    pub(crate) fn check_borders(self) -> bool {
        !matches!(self, Ruleset::Basic)
    }

    pub(crate) fn check_split(self) -> bool {
        matches!(self, Ruleset::StrictDataSplit | Ruleset::OffsetRebaseSupport)
    }

    pub(crate) fn allow_rebase(self) -> bool {
        matches!(self, Ruleset::OffsetRebaseSupport)
    }
}

/// Selects the ruleset for a chunk by its absolute weave offset.
pub fn get_ruleset_for_offset(absolute_offset: u64) -> Ruleset {
    if absolute_offset >= MERKLE_REBASE_SUPPORT_THRESHOLD {
        Ruleset::OffsetRebaseSupport
    } else if absolute_offset >= STRICT_DATA_SPLIT_THRESHOLD {
        Ruleset::StrictDataSplit
    } else {
        Ruleset::Basic
    }
}
