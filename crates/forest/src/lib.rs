//! Ledger Forest - Append-only ledger committed as a k-ary Merkle forest
//!
//! This crate provides the commitment side of the super-light client:
//! - Domain-separated BLAKE3 hashing and inclusion proof checks
//! - A storage contract with in-memory and sled-backed stores
//! - A resumable builder that lays leaves out as non-increasing perfect trees
//! - Digest-addressed queries used by the bisection game

pub mod builder;
pub mod digest;
pub mod error;
pub mod forest;
pub mod hasher;
pub mod persistence;
pub mod store;

pub use builder::ForestBuilder;
pub use digest::{Digest, DIGEST_LEN};
pub use error::{ForestError, StoreError};
pub use forest::{Forest, MountainRange, RangeError};
pub use hasher::{Blake3Hasher, HashError, MerkleHasher};
pub use persistence::{BuildMetadata, SledStore};
pub use store::{InternalNode, Leaf, MemoryStore, NodeStore};

/// Leaves appended between durable commits during a build
pub const DEFAULT_COMMIT_INTERVAL: u64 = 1_000_000;

/// Smallest usable tree dimension
pub const MIN_DIMENSION: usize = 2;
