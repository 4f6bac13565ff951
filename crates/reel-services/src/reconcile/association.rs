use reel_core::models::{Association, BucketRole, ReleaseOutcome};
use reel_core::{AppError, AppResult};
use reel_storage::StoreTx;
use uuid::Uuid;

/// Which bucket backs which (entity, role) pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssociationRepository;

impl AssociationRepository {
    pub fn new() -> Self {
        Self
    }

    #[tracing::instrument(skip(self, tx))]
    pub async fn get(
        &self,
        tx: &mut dyn StoreTx,
        entity_id: Uuid,
        role: BucketRole,
    ) -> AppResult<Association> {
        tx.get_association(entity_id, role).await?.ok_or_else(|| {
            AppError::NotFound(format!("No {} bucket for entity {}", role, entity_id))
        })
    }

    /// Move `current` to `bucket_id`, returning the bucket it pointed at before.
    ///
    /// Fails with `ConflictingAssociation` if the association changed since `current`
    /// was read.
    #[tracing::instrument(
        skip(self, tx, current),
        fields(entity_id = %current.entity_id, role = %current.role, new_bucket_id = %bucket_id)
    )]
    pub async fn repoint(
        &self,
        tx: &mut dyn StoreTx,
        current: &Association,
        bucket_id: Uuid,
    ) -> AppResult<Uuid> {
        let updated = tx
            .compare_and_set_association(
                current.entity_id,
                current.role,
                current.revision,
                bucket_id,
            )
            .await?;

        match updated {
            Some(association) => {
                tracing::info!(
                    entity_id = %current.entity_id,
                    role = %current.role,
                    previous_bucket_id = %current.bucket_id,
                    new_bucket_id = %association.bucket_id,
                    revision = association.revision,
                    "Association repointed"
                );
                Ok(current.bucket_id)
            }
            None => Err(AppError::ConflictingAssociation {
                entity_id: current.entity_id,
                role: current.role,
            }),
        }
    }

    /// Unlock and destroy `bucket_id` unless an association still references it.
    #[tracing::instrument(skip(self, tx))]
    pub async fn release(&self, tx: &mut dyn StoreTx, bucket_id: Uuid) -> AppResult<ReleaseOutcome> {
        let references = tx.count_bucket_references(bucket_id).await?;
        if references > 0 {
            tracing::warn!(
                bucket_id = %bucket_id,
                references,
                "Bucket is still referenced, leaving it in place"
            );
            return Ok(ReleaseOutcome::Retained { references });
        }

        tx.set_bucket_locked(bucket_id, false).await?;
        tx.remove_bucket(bucket_id).await?;
        tracing::info!(bucket_id = %bucket_id, "Bucket destroyed");
        Ok(ReleaseOutcome::Destroyed)
    }
}
