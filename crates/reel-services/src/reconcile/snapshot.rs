use reel_core::models::{Bucket, ObjectVersionTag, TaggedVersion};
use reel_core::{AppError, AppResult};
use reel_storage::{StoreError, StoreTx};
use uuid::Uuid;

/// Creates point-in-time copies of buckets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotService;

impl SnapshotService {
    pub fn new() -> Self {
        Self
    }

    /// Copy the live content of `source_id` into a new unlocked bucket with the same quota.
    ///
    /// Only head versions with content are copied, each under a fresh version id and
    /// with all of its tags. File content is shared, not duplicated. Everything is
    /// written through `tx`, so a failure leaves no partial bucket behind once the
    /// caller rolls back.
    #[tracing::instrument(skip(self, tx), fields(source_bucket_id = %source_id))]
    pub async fn snapshot(&self, tx: &mut dyn StoreTx, source_id: Uuid) -> AppResult<Bucket> {
        let source = tx
            .get_bucket(source_id)
            .await
            .map_err(|e| unavailable(source_id, e))?
            .ok_or_else(|| {
                AppError::ContainerUnavailable(format!("Bucket {} does not exist", source_id))
            })?;
        let versions = tx
            .head_versions(source_id)
            .await
            .map_err(|e| unavailable(source_id, e))?;
        let tags = tx
            .head_tags(source_id)
            .await
            .map_err(|e| unavailable(source_id, e))?;

        let target = Bucket::new(source.quota_size);
        tx.insert_bucket(&target).await.map_err(not_persisted)?;

        let mut copied = 0usize;
        for item in TaggedVersion::assemble(versions, tags)
            .iter()
            .filter(|t| !t.version.is_delete_marker())
        {
            let copy = item.version.copy_into(target.id);
            tx.insert_version(&copy).await.map_err(not_persisted)?;
            for (key, value) in &item.tags {
                tx.put_tag(&ObjectVersionTag::new(copy.version_id, key, value))
                    .await
                    .map_err(not_persisted)?;
            }
            copied += 1;
        }

        let created = tx
            .get_bucket(target.id)
            .await
            .map_err(not_persisted)?
            .unwrap_or(target);

        tracing::info!(
            source_bucket_id = %source_id,
            new_bucket_id = %created.id,
            objects = copied,
            size = created.size,
            "Bucket snapshot created"
        );
        Ok(created)
    }
}

fn unavailable(bucket_id: Uuid, err: StoreError) -> AppError {
    match err {
        StoreError::NotFound(_) | StoreError::Unavailable(_) | StoreError::Backend(_) => {
            AppError::ContainerUnavailable(format!("Bucket {}: {}", bucket_id, err))
        }
        other => AppError::from(other),
    }
}

fn not_persisted(err: StoreError) -> AppError {
    match err {
        StoreError::Exhausted(msg) => AppError::StorageExhausted(msg),
        other => AppError::from(other),
    }
}
