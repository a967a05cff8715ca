//! Leaf and node hashing, inclusion proof checks
//!
//! Leaves and internal nodes are hashed under different one-byte tags so a
//! leaf can never be passed off as an internal node or the other way round.

use crate::digest::Digest;
use thiserror::Error;

const LEAF_TAG: u8 = 0x00;
const NODE_TAG: u8 = 0x01;

/// Hashing errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashError {
    #[error("Incorrect dimension: expected {expected} children, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Hash function of a k-ary Merkle forest
pub trait MerkleHasher: Send + Sync {
    /// Number of children per internal node
    fn dim(&self) -> usize;

    /// Digest of a leaf's data
    fn hash_leaf(&self, data: &[u8]) -> Digest;

    /// Digest of an internal node with exactly `dim` children
    fn hash_children(&self, children: &[Digest]) -> Result<Digest, HashError>;

    /// Check that `leaf_data` is committed under one of `roots`.
    ///
    /// `proof` is a sequence of full sibling sets, `dim` digests each, ordered
    /// from the leaf's level up to the peak.
    fn check_proof(&self, leaf_data: &[u8], proof: &[Digest], roots: &[Digest]) -> bool {
        let dim = self.dim();
        if dim == 0 || proof.len() % dim != 0 {
            return false;
        }

        let mut node = self.hash_leaf(leaf_data);
        for siblings in proof.chunks_exact(dim) {
            if !siblings.contains(&node) {
                return false;
            }
            node = match self.hash_children(siblings) {
                Ok(parent) => parent,
                Err(_) => return false,
            };
        }
        roots.contains(&node)
    }

    /// Check that `leaf_data` is leaf number `position` of the tree under `root`.
    ///
    /// At every level the running digest must sit in the sibling slot named by
    /// the matching base-`dim` digit of `position`, and the proof must climb
    /// high enough to hold that many leaves.
    fn check_proof_at(
        &self,
        leaf_data: &[u8],
        proof: &[Digest],
        position: u64,
        root: &Digest,
    ) -> bool {
        let dim = self.dim();
        if dim == 0 || proof.len() % dim != 0 {
            return false;
        }

        let mut node = self.hash_leaf(leaf_data);
        let mut rest = position;
        for siblings in proof.chunks_exact(dim) {
            let slot = (rest % dim as u64) as usize;
            rest /= dim as u64;
            if siblings[slot] != node {
                return false;
            }
            node = match self.hash_children(siblings) {
                Ok(parent) => parent,
                Err(_) => return false,
            };
        }
        rest == 0 && node == *root
    }
}

/// BLAKE3 forest hasher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blake3Hasher {
    dim: usize,
}

impl Blake3Hasher {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl MerkleHasher for Blake3Hasher {
    fn dim(&self) -> usize {
        self.dim
    }

    fn hash_leaf(&self, data: &[u8]) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[LEAF_TAG]);
        hasher.update(data);
        hasher.finalize().into()
    }

    fn hash_children(&self, children: &[Digest]) -> Result<Digest, HashError> {
        if children.len() != self.dim {
            return Err(HashError::DimensionMismatch {
                expected: self.dim,
                actual: children.len(),
            });
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[NODE_TAG]);
        for child in children {
            hasher.update(child.as_bytes());
        }
        Ok(hasher.finalize().into())
    }
}
