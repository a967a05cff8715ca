//! Node storage contract and the in-memory store
//!
//! The forest never holds live references between nodes: leaves, internal
//! nodes and child-to-parent links are records keyed by digest, so the same
//! forest code runs over memory or disk.

use crate::digest::Digest;
use crate::error::StoreError;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A leaf record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    /// Opaque ledger entry
    pub data: Vec<u8>,
    /// Position in the ledger
    pub index: u64,
}

/// An internal node record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalNode {
    /// Exactly `dim` child digests, in order
    pub children: Vec<Digest>,
    /// Number of leaves below this node
    pub subtree_size: u64,
}

/// Storage contract consumed by the forest and its builder.
///
/// All methods take `&self` so a store can be shared behind an `Arc` by every
/// connection serving the same ledger.
pub trait NodeStore: Send + Sync {
    fn get_leaf(&self, digest: &Digest) -> Result<Option<Leaf>, StoreError>;

    /// Digest of the leaf at `index`
    fn get_leaf_by_index(&self, index: u64) -> Result<Option<Digest>, StoreError>;

    fn get_internal(&self, digest: &Digest) -> Result<Option<InternalNode>, StoreError>;

    /// Parent of a node, `None` for peaks
    fn get_parent(&self, digest: &Digest) -> Result<Option<Digest>, StoreError>;

    /// Digest of the peak at `index`
    fn get_root(&self, index: usize) -> Result<Option<Digest>, StoreError>;

    fn root_count(&self) -> Result<usize, StoreError>;

    fn leaf_count(&self) -> Result<u64, StoreError>;

    /// Append the next leaf. `leaf.index` must equal the current leaf count.
    fn append_leaf(&self, digest: Digest, leaf: Leaf) -> Result<(), StoreError>;

    fn store_internal(&self, digest: Digest, node: InternalNode) -> Result<(), StoreError>;

    fn store_parent(&self, child: Digest, parent: Digest) -> Result<(), StoreError>;

    /// Replace the peak list in one step, largest peak first
    fn set_roots(&self, roots: &[Digest]) -> Result<(), StoreError>;

    /// Tree dimension recorded by the builder
    fn dimension(&self) -> Result<Option<usize>, StoreError>;

    fn store_dimension(&self, dim: usize) -> Result<(), StoreError>;

    /// Make everything written so far durable
    fn commit(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Commit and release the backend
    fn close(&self) -> Result<(), StoreError> {
        self.commit()
    }
}

impl<S: NodeStore + ?Sized> NodeStore for Arc<S> {
    fn get_leaf(&self, digest: &Digest) -> Result<Option<Leaf>, StoreError> {
        (**self).get_leaf(digest)
    }

    fn get_leaf_by_index(&self, index: u64) -> Result<Option<Digest>, StoreError> {
        (**self).get_leaf_by_index(index)
    }

    fn get_internal(&self, digest: &Digest) -> Result<Option<InternalNode>, StoreError> {
        (**self).get_internal(digest)
    }

    fn get_parent(&self, digest: &Digest) -> Result<Option<Digest>, StoreError> {
        (**self).get_parent(digest)
    }

    fn get_root(&self, index: usize) -> Result<Option<Digest>, StoreError> {
        (**self).get_root(index)
    }

    fn root_count(&self) -> Result<usize, StoreError> {
        (**self).root_count()
    }

    fn leaf_count(&self) -> Result<u64, StoreError> {
        (**self).leaf_count()
    }

    fn append_leaf(&self, digest: Digest, leaf: Leaf) -> Result<(), StoreError> {
        (**self).append_leaf(digest, leaf)
    }

    fn store_internal(&self, digest: Digest, node: InternalNode) -> Result<(), StoreError> {
        (**self).store_internal(digest, node)
    }

    fn store_parent(&self, child: Digest, parent: Digest) -> Result<(), StoreError> {
        (**self).store_parent(child, parent)
    }

    fn set_roots(&self, roots: &[Digest]) -> Result<(), StoreError> {
        (**self).set_roots(roots)
    }

    fn dimension(&self) -> Result<Option<usize>, StoreError> {
        (**self).dimension()
    }

    fn store_dimension(&self, dim: usize) -> Result<(), StoreError> {
        (**self).store_dimension(dim)
    }

    fn commit(&self) -> Result<(), StoreError> {
        (**self).commit()
    }

    fn close(&self) -> Result<(), StoreError> {
        (**self).close()
    }
}

/// Thread-safe in-memory node store
///
/// Uses DashMap for the digest-keyed records; the ordered leaf and peak lists
/// sit behind `parking_lot` locks. Clones share the same underlying data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    /// Leaf records by digest
    leaves: Arc<DashMap<Digest, Leaf>>,
    /// Internal node records by digest
    internals: Arc<DashMap<Digest, InternalNode>>,
    /// Child digest -> parent digest
    parents: Arc<DashMap<Digest, Digest>>,
    /// Leaf digests in ledger order
    leaf_order: Arc<RwLock<Vec<Digest>>>,
    /// Peak digests, largest first
    roots: Arc<RwLock<Vec<Digest>>>,
    dim: Arc<RwLock<Option<usize>>>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of internal nodes held
    pub fn internal_count(&self) -> usize {
        self.internals.len()
    }
}

impl NodeStore for MemoryStore {
    fn get_leaf(&self, digest: &Digest) -> Result<Option<Leaf>, StoreError> {
        Ok(self.leaves.get(digest).map(|r| r.value().clone()))
    }

    fn get_leaf_by_index(&self, index: u64) -> Result<Option<Digest>, StoreError> {
        let order = self.leaf_order.read();
        Ok(usize::try_from(index).ok().and_then(|i| order.get(i)).copied())
    }

    fn get_internal(&self, digest: &Digest) -> Result<Option<InternalNode>, StoreError> {
        Ok(self.internals.get(digest).map(|r| r.value().clone()))
    }

    fn get_parent(&self, digest: &Digest) -> Result<Option<Digest>, StoreError> {
        Ok(self.parents.get(digest).map(|r| *r.value()))
    }

    fn get_root(&self, index: usize) -> Result<Option<Digest>, StoreError> {
        Ok(self.roots.read().get(index).copied())
    }

    fn root_count(&self) -> Result<usize, StoreError> {
        Ok(self.roots.read().len())
    }

    fn leaf_count(&self) -> Result<u64, StoreError> {
        Ok(self.leaf_order.read().len() as u64)
    }

    fn append_leaf(&self, digest: Digest, leaf: Leaf) -> Result<(), StoreError> {
        let mut order = self.leaf_order.write();
        let expected = order.len() as u64;
        if leaf.index != expected {
            return Err(StoreError::OutOfOrder {
                expected,
                actual: leaf.index,
            });
        }
        match self.leaves.entry(digest) {
            Entry::Occupied(_) => Err(StoreError::DuplicateLeaf(digest)),
            Entry::Vacant(slot) => {
                slot.insert(leaf);
                order.push(digest);
                Ok(())
            }
        }
    }

    fn store_internal(&self, digest: Digest, node: InternalNode) -> Result<(), StoreError> {
        self.internals.insert(digest, node);
        Ok(())
    }

    fn store_parent(&self, child: Digest, parent: Digest) -> Result<(), StoreError> {
        self.parents.insert(child, parent);
        Ok(())
    }

    fn set_roots(&self, roots: &[Digest]) -> Result<(), StoreError> {
        *self.roots.write() = roots.to_vec();
        Ok(())
    }

    fn dimension(&self) -> Result<Option<usize>, StoreError> {
        Ok(*self.dim.read())
    }

    fn store_dimension(&self, dim: usize) -> Result<(), StoreError> {
        *self.dim.write() = Some(dim);
        Ok(())
    }
}

/// Contract checks shared by every store implementation
#[cfg(test)]
pub(crate) fn exercise_contract<S: NodeStore>(store: &S) {
    let a = Digest::new([1u8; 32]);
    let b = Digest::new([2u8; 32]);
    let parent = Digest::new([3u8; 32]);

    assert_eq!(store.dimension().unwrap(), None);
    store.store_dimension(2).unwrap();
    assert_eq!(store.dimension().unwrap(), Some(2));

    assert_eq!(store.leaf_count().unwrap(), 0);
    store.append_leaf(a, Leaf { data: b"a".to_vec(), index: 0 }).unwrap();
    store.append_leaf(b, Leaf { data: b"b".to_vec(), index: 1 }).unwrap();
    assert_eq!(store.leaf_count().unwrap(), 2);

    // Wrong index and duplicate digest are both refused
    assert!(matches!(
        store.append_leaf(Digest::new([9u8; 32]), Leaf { data: vec![], index: 5 }),
        Err(StoreError::OutOfOrder { expected: 2, actual: 5 })
    ));
    assert!(matches!(
        store.append_leaf(a, Leaf { data: b"a".to_vec(), index: 2 }),
        Err(StoreError::DuplicateLeaf(_))
    ));
    assert_eq!(store.leaf_count().unwrap(), 2);

    assert_eq!(store.get_leaf(&b).unwrap().unwrap().index, 1);
    assert_eq!(store.get_leaf(&parent).unwrap(), None);
    assert_eq!(store.get_leaf_by_index(0).unwrap(), Some(a));
    assert_eq!(store.get_leaf_by_index(2).unwrap(), None);

    let node = InternalNode { children: vec![a, b], subtree_size: 2 };
    store.store_internal(parent, node.clone()).unwrap();
    store.store_parent(a, parent).unwrap();
    store.store_parent(b, parent).unwrap();
    assert_eq!(store.get_internal(&parent).unwrap(), Some(node));
    assert_eq!(store.get_internal(&a).unwrap(), None);
    assert_eq!(store.get_parent(&a).unwrap(), Some(parent));
    assert_eq!(store.get_parent(&parent).unwrap(), None);

    assert_eq!(store.root_count().unwrap(), 0);
    store.set_roots(&[a, b]).unwrap();
    assert_eq!(store.root_count().unwrap(), 2);
    assert_eq!(store.get_root(1).unwrap(), Some(b));

    // Merging peaks shrinks the list
    store.set_roots(&[parent]).unwrap();
    assert_eq!(store.root_count().unwrap(), 1);
    assert_eq!(store.get_root(0).unwrap(), Some(parent));
    assert_eq!(store.get_root(1).unwrap(), None);

    store.commit().unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_contract() {
        exercise_contract(&MemoryStore::new());
    }

    #[test]
    fn test_clones_share_data() {
        let store = MemoryStore::new();
        let clone = store.clone();
        store.set_roots(&[Digest::new([4u8; 32])]).unwrap();
        assert_eq!(clone.root_count().unwrap(), 1);
    }
}
