//! In-memory store backend
//!
//! A transaction works on a private copy of the committed state and keeps a log of its
//! writes. Commit replays the log against the latest committed state, so optimistic
//! checks made by other transactions in the meantime are enforced again before
//! anything becomes visible.

use crate::traits::{
    AssociationStore, BucketStore, EntityStore, FlowStore, Store, StoreError, StoreResult,
    StoreTx,
};
use async_trait::async_trait;
use chrono::Utc;
use reel_core::models::{
    Association, Bucket, BucketRole, EntityMetadata, Flow, FlowTask, ObjectVersion,
    ObjectVersionTag, PidType, TaggedVersion, TaskKind,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Operations a test can make fail once with a chosen error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Begin,
    ReadVersions,
    InsertVersion,
    PutTag,
    RemoveBucket,
    UpdateEntity,
    Commit,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    buckets: HashMap<Uuid, Bucket>,
    versions: HashMap<Uuid, ObjectVersion>,
    tags: BTreeMap<(Uuid, String), String>,
    associations: BTreeMap<(Uuid, BucketRole), Association>,
    pids: HashMap<(PidType, String), Uuid>,
    entities: HashMap<Uuid, EntityMetadata>,
}

#[derive(Debug, Clone)]
enum Write {
    InsertBucket(Bucket),
    SetBucketLocked(Uuid, bool),
    RemoveBucket(Uuid),
    InsertVersion(ObjectVersion),
    PutTag(ObjectVersionTag),
    InsertAssociation(Association),
    RepointAssociation {
        entity_id: Uuid,
        role: BucketRole,
        expected_revision: i64,
        bucket_id: Uuid,
    },
    RegisterPid(PidType, String, Uuid),
    InsertEntity(EntityMetadata),
    UpdateEntity(EntityMetadata),
}

fn bucket_not_found(id: Uuid) -> StoreError {
    StoreError::NotFound(format!("Bucket {} not found", id))
}

impl MemoryState {
    fn insert_bucket(&mut self, bucket: &Bucket) -> StoreResult<()> {
        if self.buckets.contains_key(&bucket.id) {
            return Err(StoreError::Conflict(format!(
                "Bucket {} already exists",
                bucket.id
            )));
        }
        self.buckets.insert(bucket.id, bucket.clone());
        Ok(())
    }

    fn set_bucket_locked(&mut self, id: Uuid, locked: bool) -> StoreResult<()> {
        let bucket = self.buckets.get_mut(&id).ok_or_else(|| bucket_not_found(id))?;
        bucket.locked = locked;
        bucket.updated_at = Utc::now();
        Ok(())
    }

    fn references(&self, bucket_id: Uuid) -> i64 {
        self.associations
            .values()
            .filter(|a| a.bucket_id == bucket_id)
            .count() as i64
    }

    fn remove_bucket(&mut self, id: Uuid) -> StoreResult<()> {
        let bucket = self.buckets.get(&id).ok_or_else(|| bucket_not_found(id))?;
        if bucket.locked {
            return Err(StoreError::Locked(id));
        }
        let references = self.references(id);
        if references > 0 {
            return Err(StoreError::Conflict(format!(
                "Bucket {} is still referenced by {} association(s)",
                id, references
            )));
        }

        self.buckets.remove(&id);
        let removed: HashSet<Uuid> = self
            .versions
            .values()
            .filter(|v| v.bucket_id == id)
            .map(|v| v.version_id)
            .collect();
        self.versions.retain(|vid, _| !removed.contains(vid));
        self.tags.retain(|(vid, _), _| !removed.contains(vid));
        Ok(())
    }

    fn head_versions(&self, bucket_id: Uuid) -> StoreResult<Vec<ObjectVersion>> {
        if !self.buckets.contains_key(&bucket_id) {
            return Err(bucket_not_found(bucket_id));
        }
        let mut heads: Vec<ObjectVersion> = self
            .versions
            .values()
            .filter(|v| v.bucket_id == bucket_id && v.is_head)
            .cloned()
            .collect();
        heads.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(heads)
    }

    fn insert_version(&mut self, version: &ObjectVersion) -> StoreResult<()> {
        if self.versions.contains_key(&version.version_id) {
            return Err(StoreError::Conflict(format!(
                "Object version {} already exists",
                version.version_id
            )));
        }
        let bucket = self
            .buckets
            .get_mut(&version.bucket_id)
            .ok_or_else(|| bucket_not_found(version.bucket_id))?;
        if bucket.locked {
            return Err(StoreError::Locked(bucket.id));
        }
        if !bucket.has_room_for(version.size) {
            return Err(StoreError::Exhausted(format!(
                "Bucket {} quota of {} bytes exceeded",
                bucket.id,
                bucket.quota_size.unwrap_or_default()
            )));
        }
        bucket.size += version.size;
        bucket.updated_at = Utc::now();

        if version.is_head {
            for existing in self.versions.values_mut() {
                if existing.bucket_id == version.bucket_id
                    && existing.key == version.key
                    && existing.is_head
                {
                    existing.is_head = false;
                }
            }
        }
        self.versions.insert(version.version_id, version.clone());
        Ok(())
    }

    fn head_tags(&self, bucket_id: Uuid) -> StoreResult<Vec<ObjectVersionTag>> {
        let heads: HashSet<Uuid> = self
            .head_versions(bucket_id)?
            .into_iter()
            .map(|v| v.version_id)
            .collect();
        Ok(self
            .tags
            .iter()
            .filter(|((vid, _), _)| heads.contains(vid))
            .map(|((vid, key), value)| ObjectVersionTag::new(*vid, key.clone(), value.clone()))
            .collect())
    }

    fn put_tag(&mut self, tag: &ObjectVersionTag) -> StoreResult<()> {
        let version = self.versions.get(&tag.version_id).ok_or_else(|| {
            StoreError::NotFound(format!("Object version {} not found", tag.version_id))
        })?;
        let bucket = self
            .buckets
            .get(&version.bucket_id)
            .ok_or_else(|| bucket_not_found(version.bucket_id))?;
        if bucket.locked {
            return Err(StoreError::Locked(bucket.id));
        }
        self.tags
            .insert((tag.version_id, tag.key.clone()), tag.value.clone());
        Ok(())
    }

    fn insert_association(&mut self, association: &Association) -> StoreResult<()> {
        if !self.buckets.contains_key(&association.bucket_id) {
            return Err(bucket_not_found(association.bucket_id));
        }
        let key = (association.entity_id, association.role);
        if self.associations.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "Association ({}, {}) already exists",
                association.entity_id, association.role
            )));
        }
        self.associations.insert(key, association.clone());
        Ok(())
    }

    fn repoint_association(
        &mut self,
        entity_id: Uuid,
        role: BucketRole,
        expected_revision: i64,
        bucket_id: Uuid,
    ) -> StoreResult<Option<Association>> {
        if !self.buckets.contains_key(&bucket_id) {
            return Err(bucket_not_found(bucket_id));
        }
        match self.associations.get_mut(&(entity_id, role)) {
            Some(association) if association.revision == expected_revision => {
                association.bucket_id = bucket_id;
                association.revision += 1;
                association.updated_at = Utc::now();
                Ok(Some(association.clone()))
            }
            _ => Ok(None),
        }
    }

    fn register_pid(&mut self, pid_type: PidType, value: &str, entity_id: Uuid) -> StoreResult<()> {
        let key = (pid_type, value.to_string());
        if self.pids.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "Identifier {}:{} is already registered",
                pid_type, value
            )));
        }
        self.pids.insert(key, entity_id);
        Ok(())
    }

    fn insert_entity(&mut self, entity: &EntityMetadata) -> StoreResult<()> {
        if self.entities.contains_key(&entity.id) {
            return Err(StoreError::Conflict(format!(
                "Entity {} already exists",
                entity.id
            )));
        }
        self.entities.insert(entity.id, entity.clone());
        Ok(())
    }

    fn update_entity(&mut self, entity: &EntityMetadata) -> StoreResult<EntityMetadata> {
        let stored = self
            .entities
            .get_mut(&entity.id)
            .ok_or_else(|| StoreError::NotFound(format!("Entity {} not found", entity.id)))?;
        if stored.revision != entity.revision {
            return Err(StoreError::Conflict(format!(
                "Entity {} changed concurrently (revision {} expected, {} stored)",
                entity.id, entity.revision, stored.revision
            )));
        }
        let mut next = entity.clone();
        next.revision += 1;
        next.updated_at = Utc::now();
        *stored = next.clone();
        Ok(next)
    }

    fn apply(&mut self, write: &Write) -> StoreResult<()> {
        match write {
            Write::InsertBucket(bucket) => self.insert_bucket(bucket),
            Write::SetBucketLocked(id, locked) => self.set_bucket_locked(*id, *locked),
            Write::RemoveBucket(id) => self.remove_bucket(*id),
            Write::InsertVersion(version) => self.insert_version(version),
            Write::PutTag(tag) => self.put_tag(tag),
            Write::InsertAssociation(association) => self.insert_association(association),
            Write::RepointAssociation {
                entity_id,
                role,
                expected_revision,
                bucket_id,
            } => self
                .repoint_association(*entity_id, *role, *expected_revision, *bucket_id)?
                .map(|_| ())
                .ok_or_else(|| {
                    StoreError::Conflict(format!(
                        "Association ({}, {}) is no longer at revision {}",
                        entity_id, role, expected_revision
                    ))
                }),
            Write::RegisterPid(pid_type, value, entity_id) => {
                self.register_pid(*pid_type, value, *entity_id)
            }
            Write::InsertEntity(entity) => self.insert_entity(entity),
            Write::UpdateEntity(entity) => self.update_entity(entity).map(|_| ()),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: MemoryState,
    flows: Vec<Flow>,
    failures: Vec<(FailPoint, StoreError)>,
}

impl Shared {
    fn take_failure(&mut self, point: FailPoint) -> Option<StoreError> {
        let index = self.failures.iter().position(|(p, _)| *p == point)?;
        Some(self.failures.remove(index).1)
    }
}

/// Process-local store. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self, point: FailPoint) -> Option<StoreError> {
        self.lock().take_failure(point)
    }

    /// Make the next operation at `point` fail with `error`.
    pub fn fail_next(&self, point: FailPoint, error: StoreError) {
        self.lock().failures.push((point, error));
    }

    pub fn bucket(&self, id: Uuid) -> Option<Bucket> {
        self.lock().state.buckets.get(&id).cloned()
    }

    pub fn bucket_count(&self) -> usize {
        self.lock().state.buckets.len()
    }

    pub fn association(&self, entity_id: Uuid, role: BucketRole) -> Option<Association> {
        self.lock()
            .state
            .associations
            .get(&(entity_id, role))
            .cloned()
    }

    /// Every committed association pointing at `bucket_id`.
    pub fn associations_to(&self, bucket_id: Uuid) -> Vec<Association> {
        self.lock()
            .state
            .associations
            .values()
            .filter(|a| a.bucket_id == bucket_id)
            .cloned()
            .collect()
    }

    pub fn entity(&self, id: Uuid) -> Option<EntityMetadata> {
        self.lock().state.entities.get(&id).cloned()
    }

    /// Committed head versions of a bucket with their tags; empty if the bucket is gone.
    pub fn tagged_heads(&self, bucket_id: Uuid) -> Vec<TaggedVersion> {
        let shared = self.lock();
        match (
            shared.state.head_versions(bucket_id),
            shared.state.head_tags(bucket_id),
        ) {
            (Ok(versions), Ok(tags)) => TaggedVersion::assemble(versions, tags),
            _ => Vec::new(),
        }
    }

    /// Register a flow; earlier flows of the same deposit stop being the latest.
    pub fn add_flow(&self, mut flow: Flow) {
        let mut shared = self.lock();
        for existing in shared.flows.iter_mut() {
            if existing.deposit_id == flow.deposit_id {
                existing.is_last = false;
            }
        }
        flow.is_last = true;
        shared.flows.push(flow);
    }

    pub fn flow(&self, id: Uuid) -> Option<Flow> {
        self.lock().flows.iter().find(|f| f.id == id).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let mut shared = self.lock();
        if let Some(err) = shared.take_failure(FailPoint::Begin) {
            return Err(err);
        }
        let work = shared.state.clone();
        drop(shared);
        Ok(Box::new(MemoryTx {
            store: self.clone(),
            work: Some(work),
            writes: Vec::new(),
        }))
    }
}

/// A transaction of `MemoryStore`.
pub struct MemoryTx {
    store: MemoryStore,
    work: Option<MemoryState>,
    writes: Vec<Write>,
}

impl MemoryTx {
    fn work(&mut self) -> StoreResult<&mut MemoryState> {
        self.work.as_mut().ok_or(StoreError::Closed)
    }

    fn check(&self, point: FailPoint) -> StoreResult<()> {
        match self.store.take_failure(point) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&mut self, write: Write) -> StoreResult<()> {
        self.work()?.apply(&write)?;
        self.writes.push(write);
        Ok(())
    }

    fn has_repointed(&self, entity_id: Uuid, role: BucketRole) -> bool {
        self.writes.iter().any(|w| {
            matches!(w, Write::RepointAssociation { entity_id: e, role: r, .. } if *e == entity_id && *r == role)
        })
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if self.work.is_some() && !self.writes.is_empty() {
            tracing::warn!(
                writes = self.writes.len(),
                "Memory transaction dropped without commit or rollback, discarding writes"
            );
        }
    }
}

#[async_trait]
impl BucketStore for MemoryTx {
    async fn get_bucket(&mut self, id: Uuid) -> StoreResult<Option<Bucket>> {
        Ok(self.work()?.buckets.get(&id).cloned())
    }

    async fn insert_bucket(&mut self, bucket: &Bucket) -> StoreResult<()> {
        self.record(Write::InsertBucket(bucket.clone()))
    }

    async fn set_bucket_locked(&mut self, id: Uuid, locked: bool) -> StoreResult<()> {
        self.record(Write::SetBucketLocked(id, locked))
    }

    async fn remove_bucket(&mut self, id: Uuid) -> StoreResult<()> {
        self.check(FailPoint::RemoveBucket)?;
        self.record(Write::RemoveBucket(id))
    }

    async fn head_versions(&mut self, bucket_id: Uuid) -> StoreResult<Vec<ObjectVersion>> {
        self.check(FailPoint::ReadVersions)?;
        self.work()?.head_versions(bucket_id)
    }

    async fn insert_version(&mut self, version: &ObjectVersion) -> StoreResult<()> {
        self.check(FailPoint::InsertVersion)?;
        self.record(Write::InsertVersion(version.clone()))
    }

    async fn head_tags(&mut self, bucket_id: Uuid) -> StoreResult<Vec<ObjectVersionTag>> {
        self.work()?.head_tags(bucket_id)
    }

    async fn put_tag(&mut self, tag: &ObjectVersionTag) -> StoreResult<()> {
        self.check(FailPoint::PutTag)?;
        self.record(Write::PutTag(tag.clone()))
    }
}

#[async_trait]
impl AssociationStore for MemoryTx {
    async fn get_association(
        &mut self,
        entity_id: Uuid,
        role: BucketRole,
    ) -> StoreResult<Option<Association>> {
        Ok(self.work()?.associations.get(&(entity_id, role)).cloned())
    }

    async fn insert_association(&mut self, association: &Association) -> StoreResult<()> {
        self.record(Write::InsertAssociation(association.clone()))
    }

    async fn compare_and_set_association(
        &mut self,
        entity_id: Uuid,
        role: BucketRole,
        expected_revision: i64,
        bucket_id: Uuid,
    ) -> StoreResult<Option<Association>> {
        // Another transaction may already have committed a repoint.
        if !self.has_repointed(entity_id, role) {
            let committed = self
                .store
                .lock()
                .state
                .associations
                .get(&(entity_id, role))
                .map(|a| a.revision);
            if committed != Some(expected_revision) {
                return Ok(None);
            }
        }

        let updated =
            self.work()?
                .repoint_association(entity_id, role, expected_revision, bucket_id)?;
        if updated.is_some() {
            self.writes.push(Write::RepointAssociation {
                entity_id,
                role,
                expected_revision,
                bucket_id,
            });
        }
        Ok(updated)
    }

    async fn count_bucket_references(&mut self, bucket_id: Uuid) -> StoreResult<i64> {
        Ok(self.work()?.references(bucket_id))
    }
}

#[async_trait]
impl EntityStore for MemoryTx {
    async fn resolve_pid(&mut self, pid_type: PidType, value: &str) -> StoreResult<Option<Uuid>> {
        Ok(self
            .work()?
            .pids
            .get(&(pid_type, value.to_string()))
            .copied())
    }

    async fn register_pid(
        &mut self,
        pid_type: PidType,
        value: &str,
        entity_id: Uuid,
    ) -> StoreResult<()> {
        self.record(Write::RegisterPid(pid_type, value.to_string(), entity_id))
    }

    async fn get_entity(&mut self, id: Uuid) -> StoreResult<Option<EntityMetadata>> {
        Ok(self.work()?.entities.get(&id).cloned())
    }

    async fn insert_entity(&mut self, entity: &EntityMetadata) -> StoreResult<()> {
        self.record(Write::InsertEntity(entity.clone()))
    }

    async fn update_entity(&mut self, entity: &EntityMetadata) -> StoreResult<EntityMetadata> {
        self.check(FailPoint::UpdateEntity)?;
        let stored = self.work()?.update_entity(entity)?;
        self.writes.push(Write::UpdateEntity(entity.clone()));
        Ok(stored)
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(&mut self) -> StoreResult<()> {
        if self.work.take().is_none() {
            return Err(StoreError::Closed);
        }
        let writes = std::mem::take(&mut self.writes);

        let mut shared = self.store.lock();
        if let Some(err) = shared.take_failure(FailPoint::Commit) {
            return Err(err);
        }
        let mut next = shared.state.clone();
        for write in &writes {
            next.apply(write).map_err(|e| match e {
                StoreError::Conflict(msg) => StoreError::Conflict(msg),
                other => StoreError::Conflict(format!(
                    "Concurrent change invalidated transaction: {}",
                    other
                )),
            })?;
        }
        shared.state = next;

        tracing::debug!(writes = writes.len(), "Memory transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        if self.work.take().is_none() {
            return Err(StoreError::Closed);
        }
        let discarded = std::mem::take(&mut self.writes).len();
        tracing::debug!(writes = discarded, "Memory transaction rolled back");
        Ok(())
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn latest_flow_for_deposit(&self, deposit_id: &str) -> anyhow::Result<Option<Flow>> {
        Ok(self
            .lock()
            .flows
            .iter()
            .filter(|f| f.deposit_id == deposit_id && f.is_last)
            .max_by_key(|f| f.created_at)
            .cloned())
    }

    async fn restart_task(&self, task_id: Uuid) -> anyhow::Result<FlowTask> {
        let mut shared = self.lock();
        let task = shared
            .flows
            .iter_mut()
            .flat_map(|f| f.tasks.iter_mut())
            .find(|t| t.id == task_id)
            .ok_or_else(|| anyhow::anyhow!("Task {} not found", task_id))?;
        task.reset_for_restart();
        Ok(task.clone())
    }

    async fn enqueue_task(
        &self,
        flow_id: Uuid,
        kind: TaskKind,
        payload: serde_json::Value,
    ) -> anyhow::Result<FlowTask> {
        let mut shared = self.lock();
        let flow = shared
            .flows
            .iter_mut()
            .find(|f| f.id == flow_id)
            .ok_or_else(|| anyhow::anyhow!("Flow {} not found", flow_id))?;
        let task = FlowTask::new(flow_id, kind, payload);
        flow.tasks.push(task.clone());
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_core::models::TaskStatus;

    fn version(bucket_id: Uuid, key: &str, size: i64) -> ObjectVersion {
        ObjectVersion {
            version_id: Uuid::new_v4(),
            bucket_id,
            key: key.to_string(),
            file_id: Some(Uuid::new_v4()),
            size,
            is_head: true,
            created_at: Utc::now(),
        }
    }

    async fn seeded_bucket(store: &MemoryStore, quota: Option<i64>) -> Bucket {
        let bucket = Bucket::new(quota);
        let mut tx = store.begin().await.unwrap();
        tx.insert_bucket(&bucket).await.unwrap();
        tx.commit().await.unwrap();
        bucket
    }

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let store = MemoryStore::new();
        let bucket = Bucket::new(None);

        let mut tx = store.begin().await.unwrap();
        tx.insert_bucket(&bucket).await.unwrap();
        assert!(tx.get_bucket(bucket.id).await.unwrap().is_some());
        assert!(store.bucket(bucket.id).is_none());

        tx.commit().await.unwrap();
        assert!(store.bucket(bucket.id).is_some());
        assert!(matches!(tx.commit().await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_bucket(&Bucket::new(None)).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.bucket_count(), 0);
    }

    #[tokio::test]
    async fn quota_is_enforced() {
        let store = MemoryStore::new();
        let bucket = seeded_bucket(&store, Some(100)).await;

        let mut tx = store.begin().await.unwrap();
        tx.insert_version(&version(bucket.id, "a.mp4", 60)).await.unwrap();
        let err = tx
            .insert_version(&version(bucket.id, "b.mp4", 60))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Exhausted(_)));
    }

    #[tokio::test]
    async fn new_head_demotes_previous_one() {
        let store = MemoryStore::new();
        let bucket = seeded_bucket(&store, None).await;

        let mut tx = store.begin().await.unwrap();
        tx.insert_version(&version(bucket.id, "a.mp4", 1)).await.unwrap();
        let newer = version(bucket.id, "a.mp4", 2);
        tx.insert_version(&newer).await.unwrap();
        let heads = tx.head_versions(bucket.id).await.unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].version_id, newer.version_id);
    }

    #[tokio::test]
    async fn locked_buckets_reject_mutation() {
        let store = MemoryStore::new();
        let bucket = seeded_bucket(&store, None).await;
        let v = version(bucket.id, "a.mp4", 1);

        let mut tx = store.begin().await.unwrap();
        tx.insert_version(&v).await.unwrap();
        tx.set_bucket_locked(bucket.id, true).await.unwrap();

        assert!(matches!(
            tx.insert_version(&version(bucket.id, "b.mp4", 1)).await,
            Err(StoreError::Locked(_))
        ));
        assert!(matches!(
            tx.put_tag(&ObjectVersionTag::new(v.version_id, "master", "x")).await,
            Err(StoreError::Locked(_))
        ));
        assert!(matches!(
            tx.remove_bucket(bucket.id).await,
            Err(StoreError::Locked(_))
        ));
    }

    #[tokio::test]
    async fn referenced_bucket_cannot_be_removed() {
        let store = MemoryStore::new();
        let bucket = seeded_bucket(&store, None).await;
        let entity = Uuid::new_v4();

        let mut tx = store.begin().await.unwrap();
        tx.insert_association(&Association::new(entity, BucketRole::Deposit, bucket.id))
            .await
            .unwrap();
        assert_eq!(tx.count_bucket_references(bucket.id).await.unwrap(), 1);
        assert!(matches!(
            tx.remove_bucket(bucket.id).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn repoint_loses_to_committed_concurrent_repoint() {
        let store = MemoryStore::new();
        let old = seeded_bucket(&store, None).await;
        let a = seeded_bucket(&store, None).await;
        let b = seeded_bucket(&store, None).await;
        let entity = Uuid::new_v4();

        let mut tx = store.begin().await.unwrap();
        tx.insert_association(&Association::new(entity, BucketRole::Deposit, old.id))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut first = store.begin().await.unwrap();
        let seen = first
            .get_association(entity, BucketRole::Deposit)
            .await
            .unwrap()
            .unwrap();

        let mut second = store.begin().await.unwrap();
        assert!(second
            .compare_and_set_association(entity, BucketRole::Deposit, seen.revision, b.id)
            .await
            .unwrap()
            .is_some());
        second.commit().await.unwrap();

        let lost = first
            .compare_and_set_association(entity, BucketRole::Deposit, seen.revision, a.id)
            .await
            .unwrap();
        assert!(lost.is_none());
        assert_eq!(
            store.association(entity, BucketRole::Deposit).unwrap().bucket_id,
            b.id
        );
    }

    #[tokio::test]
    async fn commit_rechecks_revisions() {
        let store = MemoryStore::new();
        let old = seeded_bucket(&store, None).await;
        let a = seeded_bucket(&store, None).await;
        let b = seeded_bucket(&store, None).await;
        let entity = Uuid::new_v4();

        let mut tx = store.begin().await.unwrap();
        tx.insert_association(&Association::new(entity, BucketRole::Deposit, old.id))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first
            .compare_and_set_association(entity, BucketRole::Deposit, 1, a.id)
            .await
            .unwrap()
            .unwrap();
        second
            .compare_and_set_association(entity, BucketRole::Deposit, 1, b.id)
            .await
            .unwrap()
            .unwrap();

        first.commit().await.unwrap();
        assert!(matches!(second.commit().await, Err(StoreError::Conflict(_))));

        let live = store.association(entity, BucketRole::Deposit).unwrap();
        assert_eq!(live.bucket_id, a.id);
        assert_eq!(live.revision, 2);
    }

    #[tokio::test]
    async fn injected_commit_failure_applies_nothing() {
        let store = MemoryStore::new();
        store.fail_next(
            FailPoint::Commit,
            StoreError::Unavailable("connection reset".to_string()),
        );

        let mut tx = store.begin().await.unwrap();
        tx.insert_bucket(&Bucket::new(None)).await.unwrap();
        assert!(matches!(tx.commit().await, Err(StoreError::Unavailable(_))));
        assert_eq!(store.bucket_count(), 0);
    }

    #[tokio::test]
    async fn flows_restart_and_enqueue() {
        let store = MemoryStore::new();
        let mut old = Flow::new("dep-1");
        old.tasks.push(FlowTask::new(old.id, TaskKind::ExtractFrames, serde_json::json!({})));
        store.add_flow(old);

        let mut flow = Flow::new("dep-1");
        let mut task = FlowTask::new(flow.id, TaskKind::ExtractFrames, serde_json::json!({}));
        task.status = TaskStatus::Failed;
        let task_id = task.id;
        flow.tasks.push(task);
        let flow_id = flow.id;
        store.add_flow(flow);

        let latest = store.latest_flow_for_deposit("dep-1").await.unwrap().unwrap();
        assert_eq!(latest.id, flow_id);

        let restarted = store.restart_task(task_id).await.unwrap();
        assert_eq!(restarted.status, TaskStatus::Pending);

        store
            .enqueue_task(flow_id, TaskKind::Transcode, serde_json::json!({"preset_quality": "720p"}))
            .await
            .unwrap();
        assert_eq!(store.flow(flow_id).unwrap().tasks.len(), 2);
        assert!(store.restart_task(Uuid::new_v4()).await.is_err());
        assert!(store.latest_flow_for_deposit("dep-2").await.unwrap().is_none());
    }
}
