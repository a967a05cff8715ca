//! Resumable forest construction
//!
//! Leaves are appended in index order. Completed subtrees sit on a stack, and
//! as soon as `dim` subtrees of the same size are on top they are folded into
//! their parent, the way a base-`dim` counter carries. The peaks are therefore
//! always the greedy decomposition of the leaf count, however many times a
//! build was extended. The peak list is written and the store committed every
//! `commit_interval` leaves and at the end of each extension, so an
//! interrupted build can pick up from the last durable peak list.

use crate::digest::Digest;
use crate::error::{ForestError, StoreError};
use crate::forest::Forest;
use crate::hasher::{Blake3Hasher, MerkleHasher};
use crate::store::{InternalNode, Leaf, NodeStore};
use crate::{DEFAULT_COMMIT_INTERVAL, MIN_DIMENSION};

/// Builds (or continues building) a forest into a store
pub struct ForestBuilder<S: NodeStore> {
    store: S,
    hasher: Blake3Hasher,
    /// Leaves covered by the peak stack
    leaf_count: u64,
    /// Leaves already in the store when this builder was created
    stored: u64,
    /// Completed subtrees as (root, leaves), largest first
    peaks: Vec<(Digest, u64)>,
    commit_interval: u64,
    since_commit: u64,
}

impl<S: NodeStore> ForestBuilder<S> {
    /// Start a build on an empty store
    pub fn new(store: S, dim: usize) -> Result<Self, ForestError> {
        if dim < MIN_DIMENSION {
            return Err(ForestError::InvalidDimension(dim));
        }
        let stored = store.leaf_count()?;
        if stored > 0 {
            return Err(ForestError::StoreNotEmpty(stored));
        }
        store.store_dimension(dim)?;

        Ok(Self {
            store,
            hasher: Blake3Hasher::new(dim),
            leaf_count: 0,
            stored: 0,
            peaks: Vec::new(),
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            since_commit: 0,
        })
    }

    /// Continue a build from the last committed peak list.
    ///
    /// Leaves written after that commit are kept and checked against the
    /// regenerated data as the build passes over them again.
    pub fn resume(store: S) -> Result<Self, ForestError> {
        let dim = store.dimension()?.ok_or(StoreError::MissingDimension)?;
        if dim < MIN_DIMENSION {
            return Err(ForestError::InvalidDimension(dim));
        }

        let mut peaks = Vec::new();
        for index in 0..store.root_count()? {
            let root = store
                .get_root(index)?
                .ok_or_else(|| StoreError::Corrupt(format!("peak {} is missing", index)))?;
            let size = if store.get_leaf(&root)?.is_some() {
                1
            } else {
                store
                    .get_internal(&root)?
                    .ok_or(ForestError::UnknownNode(root))?
                    .subtree_size
            };
            peaks.push((root, size));
        }
        let committed: u64 = peaks.iter().map(|(_, size)| size).sum();

        let stored = store.leaf_count()?;
        if stored < committed {
            return Err(ForestError::IncompleteBuild { committed, stored });
        }

        tracing::info!(
            "Resuming build: {} leaves committed, {} stored (dim {})",
            committed,
            stored,
            dim
        );

        Ok(Self {
            store,
            hasher: Blake3Hasher::new(dim),
            leaf_count: committed,
            stored,
            peaks,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            since_commit: 0,
        })
    }

    /// Resume when the store already carries a build, start one otherwise
    pub fn new_or_resume(store: S, dim: usize) -> Result<Self, ForestError> {
        match store.dimension()? {
            Some(stored) if stored != dim => Err(ForestError::DimensionChanged {
                stored,
                requested: dim,
            }),
            Some(_) => Self::resume(store),
            None => Self::new(store, dim),
        }
    }

    /// Set how many leaves are appended between durable commits
    pub fn with_commit_interval(mut self, interval: u64) -> Self {
        self.commit_interval = interval.max(1);
        self
    }

    pub fn dim(&self) -> usize {
        self.hasher.dim()
    }

    /// Leaves covered by completed peaks
    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// Append leaves until the forest holds `target` of them.
    ///
    /// `data_fn` yields the data of the leaf at a given index. The resulting
    /// peaks depend only on `target`, not on how the build was split up.
    pub fn extend_to<F>(&mut self, target: u64, mut data_fn: F) -> Result<(), ForestError>
    where
        F: FnMut(u64) -> Vec<u8>,
    {
        while self.leaf_count < target {
            let leaf = self.push_leaf(&mut data_fn)?;
            self.peaks.push((leaf, 1));
            self.carry()?;

            self.since_commit += 1;
            if self.since_commit >= self.commit_interval {
                self.commit()?;
                tracing::info!("Committed {} leaves", self.leaf_count);
            }
        }
        self.commit()
    }

    /// Commit and hand back the finished forest
    pub fn finish(mut self) -> Result<Forest<S>, ForestError> {
        self.commit()?;
        tracing::info!("Build finished with {} leaves", self.leaf_count);
        Forest::open(self.store)
    }

    /// Write the peak list and make everything durable
    fn commit(&mut self) -> Result<(), ForestError> {
        let roots: Vec<Digest> = self.peaks.iter().map(|(root, _)| *root).collect();
        self.store.set_roots(&roots)?;
        self.store.commit()?;
        self.since_commit = 0;

        tracing::debug!(
            "Committed {} peaks over {} leaves",
            roots.len(),
            self.leaf_count
        );
        Ok(())
    }

    /// Fold the top `dim` peaks into their parent while they share a size
    fn carry(&mut self) -> Result<(), ForestError> {
        let dim = self.dim();
        while self.peaks.len() >= dim {
            let top = self.peaks.len() - dim;
            let size = self.peaks[top].1;
            if self.peaks[top..].iter().any(|(_, s)| *s != size) {
                break;
            }

            let children: Vec<Digest> = self.peaks.drain(top..).map(|(root, _)| root).collect();
            let subtree_size = size * dim as u64;
            let parent = self.hasher.hash_children(&children)?;
            for child in &children {
                self.store.store_parent(*child, parent)?;
            }
            self.store.store_internal(parent, InternalNode { children, subtree_size })?;
            self.peaks.push((parent, subtree_size));
        }
        Ok(())
    }

    fn push_leaf<F>(&mut self, data_fn: &mut F) -> Result<Digest, ForestError>
    where
        F: FnMut(u64) -> Vec<u8>,
    {
        let index = self.leaf_count;
        let data = data_fn(index);
        let digest = self.hasher.hash_leaf(&data);

        if index < self.stored {
            match self.store.get_leaf_by_index(index)? {
                Some(existing) if existing == digest => {}
                _ => {
                    return Err(StoreError::Corrupt(format!(
                        "stored leaf {} does not match regenerated data",
                        index
                    ))
                    .into())
                }
            }
        } else {
            self.store.append_leaf(digest, Leaf { data, index })?;
        }

        self.leaf_count += 1;
        Ok(digest)
    }
}
