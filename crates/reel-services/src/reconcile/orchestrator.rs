use std::collections::BTreeSet;
use std::sync::Arc;

use reel_core::models::{
    BucketRole, EntityId, FileEntry, ReconcileOutcome, ReconcileStep, ReconcileWarning,
    ReleaseOutcome,
};
use reel_core::{AppError, AppResult};
use reel_storage::{Store, StoreError, StoreTx};
use tokio_util::sync::CancellationToken;

use super::association::AssociationRepository;
use super::snapshot::SnapshotService;
use super::tags::{tagged_heads, TagModel};
use crate::resolver::{EntityResolver, ResolvedPair};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    /// Run every step, then roll back instead of committing.
    pub dry_run: bool,
}

/// Rebuilds a draft's bucket from its published record.
///
/// The draft gets a fresh copy of the record's bucket, subformat tags in the copy are
/// pointed at the copied master, the previous draft bucket is destroyed and both
/// metadata documents are updated. All of it happens in one store transaction, so a
/// failure at any step leaves the previous state untouched.
pub struct Reconciler {
    store: Arc<dyn Store>,
    resolver: EntityResolver,
    snapshots: SnapshotService,
    tags: TagModel,
    associations: AssociationRepository,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: EntityResolver,
        snapshots: SnapshotService,
        tags: TagModel,
        associations: AssociationRepository,
    ) -> Self {
        Self {
            store,
            resolver,
            snapshots,
            tags,
            associations,
        }
    }

    #[tracing::instrument(skip(self, cancel), fields(entity = %id, dry_run = options.dry_run))]
    pub async fn reconcile(
        &self,
        id: &EntityId,
        options: ReconcileOptions,
        cancel: &CancellationToken,
    ) -> AppResult<ReconcileOutcome> {
        let mut tx = self.store.begin().await?;

        let outcome = match self.run(tx.as_mut(), id, options, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Failed to roll back reconciliation");
                }
                tracing::warn!(error = %err, error_type = err.error_type(), "Reconciliation failed, nothing was changed");
                return Err(err);
            }
        };

        if options.dry_run {
            tx.rollback().await?;
            tracing::info!(
                new_bucket_id = %outcome.new_bucket_id,
                "Dry run complete, all changes rolled back"
            );
            return Ok(outcome);
        }

        match tx.commit().await {
            Ok(()) => {}
            Err(StoreError::Conflict(msg)) => {
                tracing::warn!(deposit_id = %outcome.deposit_id, reason = %msg, "Commit rejected by a concurrent change");
                return Err(AppError::ConflictingAssociation {
                    entity_id: outcome.deposit_id,
                    role: BucketRole::Deposit,
                });
            }
            Err(err) => {
                return Err(AppError::from(err).aborted_after(ReconcileStep::MetadataSynced));
            }
        }

        tracing::info!(
            step = %ReconcileStep::Committed,
            old_bucket_id = %outcome.old_bucket_id,
            new_bucket_id = %outcome.new_bucket_id,
            slaves_retagged = outcome.slaves_retagged,
            warnings = outcome.warnings.len(),
            "Reconciliation committed"
        );
        Ok(outcome)
    }

    async fn run(
        &self,
        tx: &mut dyn StoreTx,
        id: &EntityId,
        options: ReconcileOptions,
        cancel: &CancellationToken,
    ) -> AppResult<ReconcileOutcome> {
        let ResolvedPair {
            mut record,
            mut deposit,
        } = self.resolver.resolve_pair(tx, id).await?;
        let record_bucket = self
            .associations
            .get(tx, record.id, BucketRole::Record)
            .await?;
        let draft_bucket = self
            .associations
            .get(tx, deposit.id, BucketRole::Deposit)
            .await?;
        tracing::info!(
            step = %ReconcileStep::Resolved,
            record_id = %record.id,
            deposit_id = %deposit.id,
            record_bucket_id = %record_bucket.bucket_id,
            deposit_bucket_id = %draft_bucket.bucket_id,
            "Resolved record and draft"
        );

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled(format!(
                "Reconciliation of {} cancelled before any change",
                id
            )));
        }

        let draft_keys: BTreeSet<String> = content_keys(tx, draft_bucket.bucket_id).await?;

        let new_bucket = self.snapshots.snapshot(tx, record_bucket.bucket_id).await?;
        tracing::info!(step = %ReconcileStep::Snapshotted, new_bucket_id = %new_bucket.id, "Record bucket copied");

        let old_bucket_id = self
            .associations
            .repoint(tx, &draft_bucket, new_bucket.id)
            .await
            .map_err(|e| e.aborted_after(ReconcileStep::Snapshotted))?;

        let mut warnings = Vec::new();
        let canonical = self
            .tags
            .locate_canonical(tx, new_bucket.id)
            .await
            .map_err(|e| e.aborted_after(ReconcileStep::Repointed))?;
        let slaves_retagged = match &canonical {
            Some(master) => self
                .tags
                .propagate(tx, new_bucket.id, master)
                .await
                .map_err(|e| e.aborted_after(ReconcileStep::Repointed))?,
            None => {
                tracing::warn!(bucket_id = %new_bucket.id, "No master rendition, subformat tags left unchanged");
                warnings.push(ReconcileWarning::CanonicalRenditionMissing {
                    bucket_id: new_bucket.id,
                });
                0
            }
        };
        tracing::info!(step = %ReconcileStep::TagsPropagated, slaves_retagged, "Tags propagated");

        let old_bucket = self
            .associations
            .release(tx, old_bucket_id)
            .await
            .map_err(|e| e.aborted_after(ReconcileStep::TagsPropagated))?;
        if let ReleaseOutcome::Retained { references } = old_bucket {
            warnings.push(ReconcileWarning::OldBucketRetained {
                bucket_id: old_bucket_id,
                references,
            });
        }
        tracing::info!(step = %ReconcileStep::Released, old_bucket_id = %old_bucket_id, "Previous draft bucket released");

        let files: Vec<FileEntry> = tagged_heads(tx, new_bucket.id)
            .await
            .map_err(|e| e.aborted_after(ReconcileStep::Released))?
            .iter()
            .filter(|t| !t.version.is_delete_marker())
            .map(FileEntry::from)
            .collect();
        let new_keys: BTreeSet<&str> = files.iter().map(|f| f.key.as_str()).collect();
        let discarded_draft_keys: Vec<String> = draft_keys
            .into_iter()
            .filter(|key| !new_keys.contains(key.as_str()))
            .collect();

        deposit.document.buckets.deposit = Some(new_bucket.id);
        deposit.document.files = files;
        record.document.buckets.deposit = Some(new_bucket.id);
        record.document.deposit = deposit.document.deposit.clone();

        tx.update_entity(&deposit)
            .await
            .map_err(|e| AppError::from(e).aborted_after(ReconcileStep::Released))?;
        tx.update_entity(&record)
            .await
            .map_err(|e| AppError::from(e).aborted_after(ReconcileStep::Released))?;
        tracing::info!(step = %ReconcileStep::MetadataSynced, "Record and draft metadata updated");

        if !discarded_draft_keys.is_empty() {
            tracing::warn!(keys = ?discarded_draft_keys, "Draft-only files are not part of the new bucket");
            warnings.push(ReconcileWarning::DraftOnlyKeysDiscarded {
                keys: discarded_draft_keys.clone(),
            });
        }

        Ok(ReconcileOutcome {
            record_id: record.id,
            deposit_id: deposit.id,
            old_bucket_id,
            new_bucket_id: new_bucket.id,
            canonical_version_id: canonical.map(|c| c.version_id),
            slaves_retagged,
            old_bucket,
            discarded_draft_keys,
            warnings,
            dry_run: options.dry_run,
        })
    }
}

async fn content_keys(tx: &mut dyn StoreTx, bucket_id: uuid::Uuid) -> AppResult<BTreeSet<String>> {
    Ok(tx
        .head_versions(bucket_id)
        .await?
        .into_iter()
        .filter(|v| !v.is_delete_marker())
        .map(|v| v.key)
        .collect())
}
