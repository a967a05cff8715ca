//! Persistence Layer for forest nodes
//!
//! Uses sled embedded database to hold a built ledger on disk so it can be
//! served across restarts. Records are bincode-encoded; ordered lists (leaves
//! by index, peaks) are keyed by big-endian `u64` so iteration follows ledger
//! order.

use crate::digest::Digest;
use crate::error::StoreError;
use crate::store::{InternalNode, Leaf, NodeStore};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, IVec};
use std::path::Path;

const KEY_DIMENSION: &str = "dimension";
const KEY_LEAF_COUNT: &str = "leaf_count";
const KEY_ROOT_COUNT: &str = "root_count";
const KEY_BUILD: &str = "build";

/// Metadata about a finished build
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BuildMetadata {
    /// Tree dimension
    pub dim: usize,
    /// Total leaves committed
    pub leaf_count: u64,
    /// Number of peaks
    pub peak_count: usize,
    /// Build completion timestamp (unix seconds)
    pub built_at: i64,
}

/// Persistent node store
pub struct SledStore {
    /// Sled database instance
    db: Db,
    /// Leaf digest -> leaf record
    leaves: sled::Tree,
    /// Leaf index -> leaf digest
    leaf_index: sled::Tree,
    /// Internal digest -> internal node record
    internal: sled::Tree,
    /// Child digest -> parent digest
    parents: sled::Tree,
    /// Peak index -> peak digest
    roots: sled::Tree,
    /// Counters, dimension and build metadata
    meta: sled::Tree,
}

impl SledStore {
    /// Open or create a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(&path)?;
        let leaves = db.open_tree("leaves")?;
        let leaf_index = db.open_tree("leaf_index")?;
        let internal = db.open_tree("internal")?;
        let parents = db.open_tree("parents")?;
        let roots = db.open_tree("roots")?;
        let meta = db.open_tree("meta")?;

        tracing::info!("Opened forest store at {:?}", path.as_ref());

        Ok(Self {
            db,
            leaves,
            leaf_index,
            internal,
            parents,
            roots,
            meta,
        })
    }

    /// Save build metadata
    pub fn save_metadata(&self, metadata: &BuildMetadata) -> Result<(), StoreError> {
        let bytes = bincode::serialize(metadata)?;
        self.meta.insert(KEY_BUILD, bytes)?;
        Ok(())
    }

    /// Load build metadata
    pub fn load_metadata(&self) -> Result<Option<BuildMetadata>, StoreError> {
        match self.meta.get(KEY_BUILD)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Approximate on-disk size in bytes
    pub fn size_on_disk(&self) -> Result<u64, StoreError> {
        Ok(self.db.size_on_disk()?)
    }

    fn read_counter(&self, key: &str) -> Result<u64, StoreError> {
        match self.meta.get(key)? {
            Some(bytes) => Ok(u64::from_le_bytes(to_array(&bytes, key)?)),
            None => Ok(0),
        }
    }

    fn write_counter(&self, key: &str, value: u64) -> Result<(), StoreError> {
        self.meta.insert(key, value.to_le_bytes().to_vec())?;
        Ok(())
    }
}

fn to_array<const N: usize>(bytes: &IVec, what: &str) -> Result<[u8; N], StoreError> {
    <[u8; N]>::try_from(&bytes[..])
        .map_err(|_| StoreError::Corrupt(format!("{} has {} bytes, expected {}", what, bytes.len(), N)))
}

fn tx_error(err: TransactionError<StoreError>) -> StoreError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StoreError::Sled(e),
    }
}

fn to_digest(bytes: IVec) -> Result<Digest, StoreError> {
    Ok(Digest::new(to_array(&bytes, "digest")?))
}

impl NodeStore for SledStore {
    fn get_leaf(&self, digest: &Digest) -> Result<Option<Leaf>, StoreError> {
        match self.leaves.get(digest)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_leaf_by_index(&self, index: u64) -> Result<Option<Digest>, StoreError> {
        self.leaf_index.get(index.to_be_bytes())?.map(to_digest).transpose()
    }

    fn get_internal(&self, digest: &Digest) -> Result<Option<InternalNode>, StoreError> {
        match self.internal.get(digest)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_parent(&self, digest: &Digest) -> Result<Option<Digest>, StoreError> {
        self.parents.get(digest)?.map(to_digest).transpose()
    }

    fn get_root(&self, index: usize) -> Result<Option<Digest>, StoreError> {
        self.roots.get((index as u64).to_be_bytes())?.map(to_digest).transpose()
    }

    fn root_count(&self) -> Result<usize, StoreError> {
        Ok(self.read_counter(KEY_ROOT_COUNT)? as usize)
    }

    fn leaf_count(&self) -> Result<u64, StoreError> {
        self.read_counter(KEY_LEAF_COUNT)
    }

    fn append_leaf(&self, digest: Digest, leaf: Leaf) -> Result<(), StoreError> {
        let record = bincode::serialize(&leaf)?;

        // Record, index entry and counter land together or not at all
        (&self.leaves, &self.leaf_index, &self.meta)
            .transaction(|(leaves, leaf_index, meta)| {
                let expected = match meta.get(KEY_LEAF_COUNT)? {
                    Some(bytes) => u64::from_le_bytes(
                        to_array(&bytes, KEY_LEAF_COUNT).map_err(ConflictableTransactionError::Abort)?,
                    ),
                    None => 0,
                };
                if leaf.index != expected {
                    return Err(ConflictableTransactionError::Abort(StoreError::OutOfOrder {
                        expected,
                        actual: leaf.index,
                    }));
                }
                if leaves.get(digest)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(StoreError::DuplicateLeaf(digest)));
                }

                leaves.insert(digest.as_ref(), record.as_slice())?;
                leaf_index.insert(&leaf.index.to_be_bytes()[..], digest.as_ref())?;
                meta.insert(KEY_LEAF_COUNT, &(expected + 1).to_le_bytes()[..])?;
                Ok(())
            })
            .map_err(tx_error)
    }

    fn store_internal(&self, digest: Digest, node: InternalNode) -> Result<(), StoreError> {
        self.internal.insert(digest, bincode::serialize(&node)?)?;
        Ok(())
    }

    fn store_parent(&self, child: Digest, parent: Digest) -> Result<(), StoreError> {
        self.parents.insert(child, parent.as_ref())?;
        Ok(())
    }

    fn set_roots(&self, digests: &[Digest]) -> Result<(), StoreError> {
        let previous = self.read_counter(KEY_ROOT_COUNT)?;
        let count = digests.len() as u64;

        (&self.roots, &self.meta)
            .transaction(|(roots, meta)| {
                for index in count..previous {
                    roots.remove(&index.to_be_bytes()[..])?;
                }
                for (index, digest) in digests.iter().enumerate() {
                    roots.insert(&(index as u64).to_be_bytes()[..], digest.as_ref())?;
                }
                meta.insert(KEY_ROOT_COUNT, &count.to_le_bytes()[..])?;
                Ok::<(), ConflictableTransactionError<StoreError>>(())
            })
            .map_err(tx_error)
    }

    fn dimension(&self) -> Result<Option<usize>, StoreError> {
        match self.meta.get(KEY_DIMENSION)? {
            Some(bytes) => Ok(Some(u64::from_le_bytes(to_array(&bytes, KEY_DIMENSION)?) as usize)),
            None => Ok(None),
        }
    }

    fn store_dimension(&self, dim: usize) -> Result<(), StoreError> {
        self.write_counter(KEY_DIMENSION, dim as u64)
    }

    fn commit(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}
