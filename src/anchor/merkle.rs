//! Merkle Tree for Batch Anchoring
//!
//! Leaves are the 32-byte digests behind each event's `record_hash`, in
//! append order. Interior nodes are `SHA-256(left || right)`. When a level has
//! an odd number of nodes the last one is duplicated as its own sibling. A
//! single-leaf tree has the leaf as its root.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::canonical::{decode_hash, encode_hash};
use crate::error::{LedgerError, Result};

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn next_level(level: &[[u8; 32]]) -> Vec<[u8; 32]> {
    level
        .chunks(2)
        .map(|pair| {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            hash_pair(left, right)
        })
        .collect()
}

/// Merkle root over raw leaf digests.
pub fn merkle_root(leaves: &[[u8; 32]]) -> Result<[u8; 32]> {
    if leaves.is_empty() {
        return Err(LedgerError::CryptoError(
            "Cannot build Merkle tree from empty batch".to_string(),
        ));
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    Ok(level[0])
}

/// Merkle root over `sha256:`-prefixed record hashes, rendered the same way.
pub fn merkle_root_from_hashes(record_hashes: &[String]) -> Result<String> {
    let leaves = decode_leaves(record_hashes)?;
    let root = merkle_root(&leaves)?;
    let root = encode_hash(&root);
    debug!("Merkle root over {} records: {}", record_hashes.len(), root);
    Ok(root)
}

pub fn verify_merkle_root(record_hashes: &[String], claimed_root: &str) -> Result<bool> {
    Ok(merkle_root_from_hashes(record_hashes)? == claimed_root)
}

fn decode_leaves(record_hashes: &[String]) -> Result<Vec<[u8; 32]>> {
    record_hashes.iter().map(|h| decode_hash(h)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiblingSide {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: String,
    pub side: SiblingSide,
}

/// Inclusion path from one leaf up to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub leaf_hash: String,
    pub steps: Vec<ProofStep>,
    pub root_hash: String,
}

impl MerkleProof {
    /// Recompute the root from the leaf and path and compare to `root_hash`.
    pub fn verify(&self) -> Result<bool> {
        let mut current = decode_hash(&self.leaf_hash)?;
        for step in &self.steps {
            let sibling = decode_hash(&step.sibling)?;
            current = match step.side {
                SiblingSide::Left => hash_pair(&sibling, &current),
                SiblingSide::Right => hash_pair(&current, &sibling),
            };
        }
        Ok(encode_hash(&current) == self.root_hash)
    }

    pub fn verify_against(&self, expected_root: &str) -> Result<bool> {
        Ok(self.root_hash == expected_root && self.verify()?)
    }
}

/// Build the inclusion proof for the leaf at `leaf_index`.
pub fn generate_proof(record_hashes: &[String], leaf_index: usize) -> Result<MerkleProof> {
    if leaf_index >= record_hashes.len() {
        return Err(LedgerError::CryptoError(format!(
            "Leaf index {} out of range for {} records",
            leaf_index,
            record_hashes.len()
        )));
    }

    let mut level = decode_leaves(record_hashes)?;
    let mut index = leaf_index;
    let mut steps = Vec::new();

    while level.len() > 1 {
        let (sibling_index, side) = if index % 2 == 0 {
            (index + 1, SiblingSide::Right)
        } else {
            (index - 1, SiblingSide::Left)
        };
        // Odd tail: the node is paired with itself.
        let sibling = level.get(sibling_index).unwrap_or(&level[index]);
        steps.push(ProofStep {
            sibling: encode_hash(sibling),
            side,
        });

        level = next_level(&level);
        index /= 2;
    }

    Ok(MerkleProof {
        leaf_index,
        leaf_hash: record_hashes[leaf_index].clone(),
        steps,
        root_hash: encode_hash(&level[0]),
    })
}
