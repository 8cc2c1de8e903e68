//! Merkle tree and proof construction for chunked transaction data.
//!
//! The gateway core only ever *verifies* proofs; building them is needed
//! solely to exercise the parser against known geometry, so this module is
//! test-only, compiled for this crate's own tests and for downstream test
//! suites via the `test-support` feature.

use arweave_gateway_types::consensus::DATA_CHUNK_SIZE;

use crate::merkle::{hash_all_sha256, hash_sha256, note_bytes, HASH_SIZE};

/// Single struct used for original data chunks (leaves) and branch nodes
/// (hashes of pairs of child nodes).
#[derive(Debug, PartialEq, Clone)]
pub struct Node {
    pub id: [u8; HASH_SIZE],
    pub data_hash: Option<[u8; HASH_SIZE]>,
    pub min_byte_range: u64,
    pub max_byte_range: u64,
    pub left_child: Option<Box<Node>>,
    pub right_child: Option<Box<Node>>,
}

/// Concatenated frames for the full root-to-leaf walk of one chunk.
#[derive(Debug, PartialEq, Clone)]
pub struct Proof {
    /// The last byte offset of the chunk the proof resolves.
    pub offset: u64,
    pub proof: Vec<u8>,
}

/// The id of a branch node over `(left, right)` split at `boundary`.
pub fn branch_id(left: &[u8; HASH_SIZE], right: &[u8; HASH_SIZE], boundary: u64) -> [u8; HASH_SIZE] {
    hash_all_sha256(&[left, right, &note_bytes(boundary)])
}

/// The 96-byte path frame for a branch node.
pub fn branch_frame(left: &[u8; HASH_SIZE], right: &[u8; HASH_SIZE], boundary: u64) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HASH_SIZE * 3);
    frame.extend_from_slice(left);
    frame.extend_from_slice(right);
    frame.extend_from_slice(&note_bytes(boundary));
    frame
}

/// The 128-byte path frame for a rebased branch: a zero slab marker followed
/// by the branch frame. Its id is the same as the plain branch's.
pub fn rebased_branch_frame(
    left: &[u8; HASH_SIZE],
    right: &[u8; HASH_SIZE],
    boundary: u64,
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HASH_SIZE * 4);
    frame.extend_from_slice(&[0u8; HASH_SIZE]);
    frame.extend_from_slice(left);
    frame.extend_from_slice(right);
    frame.extend_from_slice(&note_bytes(boundary));
    frame
}

/// Splits `data` into maximum-size chunks (only the last may be smaller) and
/// builds the leaf node for each.
pub fn generate_leaves(data: &[u8]) -> Vec<Node> {
    let mut leaves = Vec::new();
    let mut start: u64 = 0;
    let total = data.len() as u64;

    while start < total {
        let end = (start + DATA_CHUNK_SIZE).min(total);
        let data_hash = hash_sha256(&data[start as usize..end as usize]);
        leaves.push(Node {
            id: hash_all_sha256(&[&data_hash, &note_bytes(end)]),
            data_hash: Some(data_hash),
            min_byte_range: start,
            max_byte_range: end,
            left_child: None,
            right_child: None,
        });
        start = end;
    }
    leaves
}

/// Folds a layer of nodes pairwise until a single root remains. An odd node
/// is promoted unchanged to the next layer.
pub fn build_layers(mut nodes: Vec<Node>) -> Node {
    while nodes.len() > 1 {
        let mut next_layer = Vec::with_capacity(nodes.len().div_ceil(2));
        let mut iter = nodes.into_iter();
        while let Some(left) = iter.next() {
            match iter.next() {
                Some(right) => {
                    let boundary = left.max_byte_range;
                    next_layer.push(Node {
                        id: branch_id(&left.id, &right.id, boundary),
                        data_hash: None,
                        min_byte_range: left.min_byte_range,
                        max_byte_range: right.max_byte_range,
                        left_child: Some(Box::new(left)),
                        right_child: Some(Box::new(right)),
                    });
                }
                None => next_layer.push(left),
            }
        }
        nodes = next_layer;
    }
    nodes.remove(0)
}

/// Builds the full tree for `data`. The returned node's `id` is the
/// `data_root` the transaction commits to.
pub fn generate_tree(data: &[u8]) -> Node {
    build_layers(generate_leaves(data))
}

/// Produces one proof per leaf, in leaf order.
pub fn generate_proofs(root: &Node) -> Vec<Proof> {
    let mut proofs = Vec::new();
    collect_proofs(root, Vec::new(), &mut proofs);
    proofs
}

fn collect_proofs(node: &Node, prefix: Vec<u8>, proofs: &mut Vec<Proof>) {
    match (&node.left_child, &node.right_child) {
        (Some(left), Some(right)) => {
            let mut frame = prefix.clone();
            frame.extend_from_slice(&branch_frame(&left.id, &right.id, left.max_byte_range));
            collect_proofs(left, frame.clone(), proofs);

            let mut frame = prefix;
            frame.extend_from_slice(&branch_frame(&left.id, &right.id, left.max_byte_range));
            collect_proofs(right, frame, proofs);
        }
        _ => {
            let data_hash = node
                .data_hash
                .expect("leaf nodes always carry a data hash");
            let mut proof = prefix;
            proof.extend_from_slice(&data_hash);
            proof.extend_from_slice(&note_bytes(node.max_byte_range));
            proofs.push(Proof {
                offset: node.max_byte_range.saturating_sub(1),
                proof,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_split_at_chunk_size() {
        let data = vec![5u8; (DATA_CHUNK_SIZE * 2 + 1000) as usize];
        let leaves = generate_leaves(&data);
        assert_eq!(leaves.len(), 3);
        assert_eq!(leaves[0].max_byte_range, DATA_CHUNK_SIZE);
        assert_eq!(leaves[2].min_byte_range, DATA_CHUNK_SIZE * 2);
        assert_eq!(leaves[2].max_byte_range, DATA_CHUNK_SIZE * 2 + 1000);
    }

    #[test]
    fn exact_multiple_has_no_empty_tail_chunk() {
        let data = vec![5u8; (DATA_CHUNK_SIZE * 2) as usize];
        let leaves = generate_leaves(&data);
        assert_eq!(leaves.len(), 2);
    }

    #[test]
    fn proof_count_matches_leaf_count() {
        let data = vec![1u8; (DATA_CHUNK_SIZE * 4 + 17) as usize];
        let root = generate_tree(&data);
        let proofs = generate_proofs(&root);
        assert_eq!(proofs.len(), 5);
        // Proofs arrive in leaf order.
        assert_eq!(proofs[0].offset, DATA_CHUNK_SIZE - 1);
        assert_eq!(proofs[4].offset, DATA_CHUNK_SIZE * 4 + 16);
    }
}
