//! Merkle Tree over Record Hashes
//!
//! Summarises a run of records in a single root for anchoring sealed
//! segments externally, with per-record inclusion proofs. Levels are
//! stored as vectors; an odd node at the end of a level is paired with
//! itself.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LedgerError;
use crate::ledger::hash::HashAlgorithm;

fn parent(left: &str, right: &str, algorithm: HashAlgorithm) -> String {
    algorithm.digest(&[left.as_bytes(), right.as_bytes()])
}

fn build_levels(leaves: &[String], algorithm: HashAlgorithm) -> Vec<Vec<String>> {
    let mut levels = vec![leaves.to_vec()];
    while levels.last().map_or(false, |level| level.len() > 1) {
        let current = &levels[levels.len() - 1];
        let next: Vec<String> = current
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                parent(left, right, algorithm)
            })
            .collect();
        levels.push(next);
    }
    levels
}

/// Root over `leaves`, or `None` when there are none.
pub fn merkle_root(leaves: &[String], algorithm: HashAlgorithm) -> Option<String> {
    if leaves.is_empty() {
        return None;
    }
    let levels = build_levels(leaves, algorithm);
    let root = levels.last().and_then(|level| level.first()).cloned();
    debug!("Merkle root over {} leaves: {:?}", leaves.len(), root);
    root
}

/// Which side of the running hash a sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: String,
    pub side: Side,
}

/// Evidence that one leaf is included under a root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub leaf_hash: String,
    pub steps: Vec<ProofStep>,
    pub root_hash: String,
}

impl MerkleProof {
    pub fn verify(&self, algorithm: HashAlgorithm) -> bool {
        let computed = self.steps.iter().fold(self.leaf_hash.clone(), |acc, step| match step.side {
            Side::Left => parent(&step.hash, &acc, algorithm),
            Side::Right => parent(&acc, &step.hash, algorithm),
        });
        computed == self.root_hash
    }
}

pub fn generate_proof(
    leaves: &[String],
    index: usize,
    algorithm: HashAlgorithm,
) -> Result<MerkleProof, LedgerError> {
    if index >= leaves.len() {
        return Err(LedgerError::InvalidRange {
            from: index as u64,
            to: leaves.len() as u64,
        });
    }

    let levels = build_levels(leaves, algorithm);
    let mut steps = Vec::with_capacity(levels.len());
    let mut position = index;
    for level in &levels[..levels.len() - 1] {
        let (sibling, side) = if position % 2 == 0 {
            (level.get(position + 1).unwrap_or(&level[position]), Side::Right)
        } else {
            (&level[position - 1], Side::Left)
        };
        steps.push(ProofStep {
            hash: sibling.clone(),
            side,
        });
        position /= 2;
    }

    let root_hash = levels
        .last()
        .and_then(|level| level.first())
        .cloned()
        .unwrap_or_default();

    Ok(MerkleProof {
        leaf_index: index,
        leaf_hash: leaves[index].clone(),
        steps,
        root_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(count: usize) -> Vec<String> {
        (0..count)
            .map(|i| HashAlgorithm::Sha256.digest(&[format!("leaf-{}", i).as_bytes()]))
            .collect()
    }

    #[test]
    fn test_root_of_single_leaf_is_leaf() {
        let l = leaves(1);
        assert_eq!(merkle_root(&l, HashAlgorithm::Sha256), Some(l[0].clone()));
        assert_eq!(merkle_root(&[], HashAlgorithm::Sha256), None);
    }

    #[test]
    fn test_root_changes_with_any_leaf() {
        let mut l = leaves(5);
        let root = merkle_root(&l, HashAlgorithm::Sha256).unwrap();
        l[3] = HashAlgorithm::Sha256.digest(&[b"other"]);
        assert_ne!(merkle_root(&l, HashAlgorithm::Sha256).unwrap(), root);
    }

    #[test]
    fn test_proofs_verify_for_every_leaf() {
        for count in [1, 2, 3, 7, 8] {
            let l = leaves(count);
            let root = merkle_root(&l, HashAlgorithm::Sha256).unwrap();
            for index in 0..count {
                let proof = generate_proof(&l, index, HashAlgorithm::Sha256).unwrap();
                assert_eq!(proof.root_hash, root);
                assert!(proof.verify(HashAlgorithm::Sha256), "count {} index {}", count, index);
            }
        }
    }

    #[test]
    fn test_tampered_proof_fails() {
        let l = leaves(4);
        let mut proof = generate_proof(&l, 2, HashAlgorithm::Sha256).unwrap();
        proof.leaf_hash = l[1].clone();
        assert!(!proof.verify(HashAlgorithm::Sha256));
        assert!(generate_proof(&l, 4, HashAlgorithm::Sha256).is_err());
    }
}
