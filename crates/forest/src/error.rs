//! Forest and storage errors
//!
//! Everything here describes a problem with local state (a corrupt store,
//! a query for a node we never built), never misbehaviour of a remote peer.

use crate::digest::Digest;
use crate::hasher::HashError;
use thiserror::Error;

/// Storage backend errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Record encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Tree dimension has not been stored")]
    MissingDimension,

    #[error("Leaf {0} is already stored")]
    DuplicateLeaf(Digest),

    #[error("Leaf appended out of order: expected index {expected}, got {actual}")]
    OutOfOrder { expected: u64, actual: u64 },

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Forest query and construction errors
#[derive(Error, Debug)]
pub enum ForestError {
    #[error("Unknown node {0}")]
    UnknownNode(Digest),

    #[error("Node {0} is not a leaf")]
    NotALeaf(Digest),

    #[error("Node {0} is not an internal node")]
    NotInternal(Digest),

    #[error("Leaf index {0} does not exist")]
    IndexOutOfRange(u64),

    #[error("Dimension {0} is too small (minimum is 2)")]
    InvalidDimension(usize),

    #[error("Store was built with dimension {stored}, not {requested}")]
    DimensionChanged { stored: usize, requested: usize },

    #[error("Store already holds {0} leaves, resume the build instead")]
    StoreNotEmpty(u64),

    #[error("Incomplete build: {stored} leaves stored but only {committed} belong to committed peaks")]
    IncompleteBuild { committed: u64, stored: u64 },

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}
