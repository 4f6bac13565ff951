//! Store abstraction traits
//!
//! Every read and write of the reconciliation happens through a `StoreTx` obtained from
//! `Store::begin`. Nothing written through a transaction is visible to other
//! transactions until `commit` succeeds; `rollback` (or dropping the transaction)
//! discards it.

use async_trait::async_trait;
use reel_core::models::{
    Association, Bucket, BucketRole, EntityMetadata, Flow, FlowTask, ObjectVersion,
    ObjectVersionTag, PidType, TaskKind,
};
use reel_core::AppError;
use thiserror::Error;
use uuid::Uuid;

/// Store operation errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Concurrent modification, duplicate key or stale revision.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Quota exceeded or the backend ran out of space.
    #[error("Storage exhausted: {0}")]
    Exhausted(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Bucket {0} is locked")]
    Locked(Uuid),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Transaction already finished")]
    Closed,
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => AppError::NotFound(msg),
            StoreError::Exhausted(msg) => AppError::StorageExhausted(msg),
            StoreError::Locked(id) => {
                AppError::Internal(format!("Refusing to mutate locked bucket {}", id))
            }
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Buckets, their object versions and tags.
#[async_trait]
pub trait BucketStore: Send {
    async fn get_bucket(&mut self, id: Uuid) -> StoreResult<Option<Bucket>>;

    async fn insert_bucket(&mut self, bucket: &Bucket) -> StoreResult<()>;

    async fn set_bucket_locked(&mut self, id: Uuid, locked: bool) -> StoreResult<()>;

    /// Remove a bucket together with its versions and tags.
    ///
    /// Fails with `Locked` on a locked bucket and with `Conflict` while any association
    /// still references it.
    async fn remove_bucket(&mut self, id: Uuid) -> StoreResult<()>;

    /// Head versions of a bucket ordered by key, deletion markers included.
    async fn head_versions(&mut self, bucket_id: Uuid) -> StoreResult<Vec<ObjectVersion>>;

    /// Insert a new head version, demoting the previous head of the same key.
    /// Enforces the bucket quota (`Exhausted`) and lock (`Locked`).
    async fn insert_version(&mut self, version: &ObjectVersion) -> StoreResult<()>;

    /// Tags of every head version of a bucket.
    async fn head_tags(&mut self, bucket_id: Uuid) -> StoreResult<Vec<ObjectVersionTag>>;

    /// Insert or overwrite a tag. Rejected with `Locked` on locked buckets.
    async fn put_tag(&mut self, tag: &ObjectVersionTag) -> StoreResult<()>;
}

/// The (entity, role) → bucket mapping.
#[async_trait]
pub trait AssociationStore: Send {
    async fn get_association(
        &mut self,
        entity_id: Uuid,
        role: BucketRole,
    ) -> StoreResult<Option<Association>>;

    /// Create an association. `Conflict` if the (entity, role) pair already has one.
    async fn insert_association(&mut self, association: &Association) -> StoreResult<()>;

    /// Point the association at `bucket_id` if its revision is still
    /// `expected_revision`. Returns the updated association, or `None` when the
    /// association is gone or was modified in the meantime.
    async fn compare_and_set_association(
        &mut self,
        entity_id: Uuid,
        role: BucketRole,
        expected_revision: i64,
        bucket_id: Uuid,
    ) -> StoreResult<Option<Association>>;

    /// Number of associations pointing at a bucket.
    async fn count_bucket_references(&mut self, bucket_id: Uuid) -> StoreResult<i64>;
}

/// Records, deposits and their persistent identifiers.
#[async_trait]
pub trait EntityStore: Send {
    async fn resolve_pid(&mut self, pid_type: PidType, value: &str) -> StoreResult<Option<Uuid>>;

    async fn register_pid(
        &mut self,
        pid_type: PidType,
        value: &str,
        entity_id: Uuid,
    ) -> StoreResult<()>;

    async fn get_entity(&mut self, id: Uuid) -> StoreResult<Option<EntityMetadata>>;

    async fn insert_entity(&mut self, entity: &EntityMetadata) -> StoreResult<()>;

    /// Persist `entity` if the stored revision still equals `entity.revision`.
    /// Returns the stored copy with the bumped revision; `Conflict` otherwise.
    async fn update_entity(&mut self, entity: &EntityMetadata) -> StoreResult<EntityMetadata>;
}

/// One unit of work against the store.
#[async_trait]
pub trait StoreTx: BucketStore + AssociationStore + EntityStore {
    /// Make every write of this transaction visible. `Conflict` if an optimistic
    /// check no longer holds.
    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;
}

/// Entry point of a store backend.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;
}

/// Access to the workflow engine's flows and tasks.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// The current (`is_last`) flow of a deposit, tasks included.
    async fn latest_flow_for_deposit(&self, deposit_id: &str) -> anyhow::Result<Option<Flow>>;

    /// Reset a task to pending so the workflow engine picks it up again.
    async fn restart_task(&self, task_id: Uuid) -> anyhow::Result<FlowTask>;

    async fn enqueue_task(
        &self,
        flow_id: Uuid,
        kind: TaskKind,
        payload: serde_json::Value,
    ) -> anyhow::Result<FlowTask>;
}
