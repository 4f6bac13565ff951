//! Reel Storage Library
//!
//! Persistence abstraction for buckets, associations, entities and flows, plus an
//! in-memory backend. The Postgres backend lives in `reel-db`.
//!
//! # Transactions
//!
//! All writes go through a `StoreTx`. Associations and entity documents are guarded by
//! revision numbers: a compare-and-set that loses a race returns `None`, and a commit
//! whose checks no longer hold fails with `StoreError::Conflict` without applying
//! anything.

#[cfg(feature = "memory")]
pub mod memory;
pub mod traits;

// Re-export commonly used types
#[cfg(feature = "memory")]
pub use memory::{FailPoint, MemoryStore};
pub use traits::{
    AssociationStore, BucketStore, EntityStore, FlowStore, Store, StoreError, StoreResult,
    StoreTx,
};
