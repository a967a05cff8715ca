//! Digest-addressed queries over a built forest
//!
//! A forest is a non-increasing run of perfect `dim`-ary trees (peaks). The
//! bisection game only ever asks about a node by its digest, so every query
//! here starts from a digest and goes through the store.

use crate::digest::Digest;
use crate::error::{ForestError, StoreError};
use crate::hasher::{Blake3Hasher, MerkleHasher};
use crate::store::{InternalNode, Leaf, NodeStore};
use crate::MIN_DIMENSION;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shape of a ledger commitment: one digest and one leaf count per peak,
/// largest peak first.
#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct MountainRange {
    pub roots: Vec<Digest>,
    pub sizes: Vec<u64>,
}

/// Reasons a mountain range is malformed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("{roots} roots but {sizes} sizes")]
    LengthMismatch { roots: usize, sizes: usize },

    #[error("Dimension {0} is too small")]
    InvalidDimension(usize),

    #[error("Peak {index} has size {size}, which is not a power of {dim}")]
    NotPowerOfDimension { index: usize, size: u64, dim: usize },

    #[error("Peak {index} has size {size}, larger than the previous peak ({previous})")]
    Increasing { index: usize, size: u64, previous: u64 },

    #[error("Peak {index} is the {dim}th peak of size {size}, they should have been merged")]
    Unmerged { index: usize, size: u64, dim: usize },
}

impl MountainRange {
    pub fn new(roots: Vec<Digest>, sizes: Vec<u64>) -> Self {
        Self { roots, sizes }
    }

    /// Number of peaks
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Total number of leaves committed
    pub fn total(&self) -> u64 {
        self.sizes.iter().sum()
    }

    /// Check the shape a forest of dimension `dim` can have.
    ///
    /// Every size must be a power of `dim` and sizes must never grow. Up to
    /// `dim - 1` equal neighbours are allowed, one per unit of the matching
    /// base-`dim` digit of the leaf count; `dim` of them form a full parent.
    pub fn validate(&self, dim: usize) -> Result<(), RangeError> {
        if dim < MIN_DIMENSION {
            return Err(RangeError::InvalidDimension(dim));
        }
        if self.roots.len() != self.sizes.len() {
            return Err(RangeError::LengthMismatch {
                roots: self.roots.len(),
                sizes: self.sizes.len(),
            });
        }

        let mut previous: Option<u64> = None;
        let mut run = 0usize;
        for (index, &size) in self.sizes.iter().enumerate() {
            if !is_power_of(size, dim as u64) {
                return Err(RangeError::NotPowerOfDimension { index, size, dim });
            }
            match previous {
                Some(previous) if size > previous => {
                    return Err(RangeError::Increasing { index, size, previous });
                }
                Some(previous) if size == previous => run += 1,
                _ => run = 1,
            }
            if run >= dim {
                return Err(RangeError::Unmerged { index, size, dim });
            }
            previous = Some(size);
        }
        Ok(())
    }
}

/// Whether `n` equals `base^k` for some `k >= 0`
pub(crate) fn is_power_of(mut n: u64, base: u64) -> bool {
    if n == 0 || base < 2 {
        return n == 1;
    }
    while n % base == 0 {
        n /= base;
    }
    n == 1
}

/// A built, queryable forest
pub struct Forest<S: NodeStore> {
    store: S,
    hasher: Blake3Hasher,
}

impl<S: NodeStore> Forest<S> {
    /// Open a forest over a store that holds a finished build
    pub fn open(store: S) -> Result<Self, ForestError> {
        let dim = store.dimension()?.ok_or(StoreError::MissingDimension)?;
        if dim < MIN_DIMENSION {
            return Err(ForestError::InvalidDimension(dim));
        }

        let forest = Self {
            store,
            hasher: Blake3Hasher::new(dim),
        };

        let committed: u64 = forest.get_subtree_sizes()?.iter().sum();
        let stored = forest.store.leaf_count()?;
        if committed != stored {
            return Err(ForestError::IncompleteBuild { committed, stored });
        }

        tracing::info!(
            "Opened forest: {} leaves in {} peaks (dim {})",
            stored,
            forest.store.root_count()?,
            dim
        );
        Ok(forest)
    }

    pub fn dim(&self) -> usize {
        self.hasher.dim()
    }

    pub fn hasher(&self) -> &Blake3Hasher {
        &self.hasher
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Number of leaves in the ledger
    pub fn leaf_count(&self) -> Result<u64, ForestError> {
        Ok(self.store.leaf_count()?)
    }

    /// Whether a known node is a leaf
    pub fn is_leaf(&self, digest: &Digest) -> Result<bool, ForestError> {
        if self.store.get_leaf(digest)?.is_some() {
            return Ok(true);
        }
        if self.store.get_internal(digest)?.is_some() {
            return Ok(false);
        }
        Err(ForestError::UnknownNode(*digest))
    }

    /// Data of a leaf
    pub fn get_data(&self, digest: &Digest) -> Result<Vec<u8>, ForestError> {
        Ok(self.leaf(digest)?.data)
    }

    /// Children of an internal node, in order
    pub fn get_children(&self, digest: &Digest) -> Result<Vec<Digest>, ForestError> {
        Ok(self.internal(digest)?.children)
    }

    /// Number of leaves below a node (1 for a leaf)
    pub fn get_subtree_size(&self, digest: &Digest) -> Result<u64, ForestError> {
        if self.store.get_leaf(digest)?.is_some() {
            return Ok(1);
        }
        match self.store.get_internal(digest)? {
            Some(node) => Ok(node.subtree_size),
            None => Err(ForestError::UnknownNode(*digest)),
        }
    }

    /// The leaf immediately before this one, or `Digest::ZERO` for the first
    pub fn get_prev_sibling(&self, digest: &Digest) -> Result<Digest, ForestError> {
        let leaf = self.leaf(digest)?;
        if leaf.index == 0 {
            return Ok(Digest::ZERO);
        }
        let prev = self.store.get_leaf_by_index(leaf.index - 1)?.ok_or_else(|| {
            StoreError::Corrupt(format!("no leaf recorded at index {}", leaf.index - 1))
        })?;
        Ok(prev)
    }

    /// Inclusion proof of a leaf: the full child list of every ancestor,
    /// from the leaf's parent up to its peak.
    pub fn get_proof(&self, digest: &Digest) -> Result<Vec<Digest>, ForestError> {
        self.leaf(digest)?;

        let mut proof = Vec::new();
        let mut node = *digest;
        while let Some(parent) = self.store.get_parent(&node)? {
            proof.extend(self.get_children(&parent)?);
            node = parent;
        }
        Ok(proof)
    }

    /// Peak digests, largest first
    pub fn get_roots(&self) -> Result<Vec<Digest>, ForestError> {
        let count = self.store.root_count()?;
        (0..count)
            .map(|index| -> Result<Digest, ForestError> {
                let root = self.store.get_root(index)?.ok_or_else(|| {
                    StoreError::Corrupt(format!("peak {} of {} is missing", index, count))
                })?;
                Ok(root)
            })
            .collect()
    }

    /// Leaf count of each peak, largest first
    pub fn get_subtree_sizes(&self) -> Result<Vec<u64>, ForestError> {
        self.get_roots()?
            .iter()
            .map(|root| self.get_subtree_size(root))
            .collect()
    }

    /// Peaks and their sizes
    pub fn mountain_range(&self) -> Result<MountainRange, ForestError> {
        let roots = self.get_roots()?;
        let sizes = roots
            .iter()
            .map(|root| self.get_subtree_size(root))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MountainRange::new(roots, sizes))
    }

    /// Digest of the leaf at `index`
    pub fn leaf_at(&self, index: u64) -> Result<Digest, ForestError> {
        self.store
            .get_leaf_by_index(index)?
            .ok_or(ForestError::IndexOutOfRange(index))
    }

    /// The node whose subtree holds exactly the `size` leaves starting at
    /// `offset`, if this forest has one
    pub fn subtree_at(&self, offset: u64, size: u64) -> Result<Option<Digest>, ForestError> {
        let total = self.leaf_count()?;
        match offset.checked_add(size) {
            Some(end) if size > 0 && end <= total => {}
            _ => return Ok(None),
        }

        let mut node = self.leaf_at(offset)?;
        let mut node_size = 1u64;
        while node_size < size {
            match self.store.get_parent(&node)? {
                Some(parent) => {
                    node = parent;
                    node_size = self.get_subtree_size(&node)?;
                }
                None => return Ok(None),
            }
        }
        // A parent may start before `offset`
        if node_size != size || self.first_leaf(&node)? != offset {
            return Ok(None);
        }
        Ok(Some(node))
    }

    /// Index of the leftmost leaf below a node
    fn first_leaf(&self, digest: &Digest) -> Result<u64, ForestError> {
        let mut node = *digest;
        loop {
            match self.store.get_internal(&node)? {
                Some(internal) => {
                    node = *internal.children.first().ok_or_else(|| {
                        StoreError::Corrupt(format!("internal node {} has no children", node))
                    })?;
                }
                None => return Ok(self.leaf(&node)?.index),
            }
        }
    }

    fn leaf(&self, digest: &Digest) -> Result<Leaf, ForestError> {
        match self.store.get_leaf(digest)? {
            Some(leaf) => Ok(leaf),
            None if self.store.get_internal(digest)?.is_some() => {
                Err(ForestError::NotALeaf(*digest))
            }
            None => Err(ForestError::UnknownNode(*digest)),
        }
    }

    fn internal(&self, digest: &Digest) -> Result<InternalNode, ForestError> {
        match self.store.get_internal(digest)? {
            Some(node) => Ok(node),
            None if self.store.get_leaf(digest)?.is_some() => {
                Err(ForestError::NotInternal(*digest))
            }
            None => Err(ForestError::UnknownNode(*digest)),
        }
    }
}
