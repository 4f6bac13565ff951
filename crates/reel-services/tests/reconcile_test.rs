mod helpers;

use async_trait::async_trait;
use helpers::{published_pair, put_file, put_master, put_slave, reconciler, DEPID, RECID};
use reel_core::constants::MASTER_TAG;
use reel_core::models::{
    Association, BucketRole, EntityId, ReconcileStep, ReconcileWarning, ReleaseOutcome,
};
use reel_core::AppError;
use reel_services::{
    AssociationRepository, EntityResolver, ReconcileOptions, Reconciler, SnapshotService,
    TagModel,
};
use reel_storage::{
    AssociationStore, FailPoint, MemoryStore, Store, StoreError, StoreResult, StoreTx,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn run() -> (ReconcileOptions, CancellationToken) {
    (ReconcileOptions::default(), CancellationToken::new())
}

#[tokio::test]
async fn stale_slave_tags_point_at_the_copied_master() {
    let store = MemoryStore::new();
    let pair = published_pair(&store).await;
    let master = put_master(&store, pair.record_bucket, "video.mp4", 1080).await;
    let slave = put_slave(
        &store,
        pair.record_bucket,
        "video-720p.mp4",
        &Uuid::new_v4().to_string(),
        "720p",
    )
    .await;
    put_file(&store, pair.deposit_bucket, "video.mp4", &[]).await;

    let (options, cancel) = run();
    let outcome = reconciler(&store)
        .reconcile(&EntityId::recid(RECID), options, &cancel)
        .await
        .unwrap();

    assert_eq!(outcome.old_bucket_id, pair.deposit_bucket);
    assert_ne!(outcome.new_bucket_id, pair.record_bucket);
    assert_eq!(outcome.old_bucket, ReleaseOutcome::Destroyed);
    assert_eq!(outcome.slaves_retagged, 1);
    assert!(outcome.warnings.is_empty());

    let heads = store.tagged_heads(outcome.new_bucket_id);
    assert_eq!(heads.len(), 2);
    let copied_master = heads.iter().find(|t| t.version.key == "video.mp4").unwrap();
    let copied_slave = heads
        .iter()
        .find(|t| t.version.key == "video-720p.mp4")
        .unwrap();
    assert_ne!(copied_master.version.version_id, master.version_id);
    assert_ne!(copied_slave.version.version_id, slave.version_id);
    assert_eq!(outcome.canonical_version_id, Some(copied_master.version.version_id));
    assert_eq!(
        copied_slave.tag(MASTER_TAG),
        Some(copied_master.version.version_id.to_string().as_str())
    );

    let new_bucket = store.bucket(outcome.new_bucket_id).unwrap();
    assert!(!new_bucket.locked);
    assert!(store.bucket(pair.deposit_bucket).is_none());
    assert!(store.bucket(pair.record_bucket).unwrap().locked);

    // The published bucket keeps its stale tags; only the copy is rewritten.
    let record_heads = store.tagged_heads(pair.record_bucket);
    let original_slave = record_heads
        .iter()
        .find(|t| t.version.key == "video-720p.mp4")
        .unwrap();
    assert_ne!(
        original_slave.tag(MASTER_TAG),
        Some(master.version_id.to_string().as_str())
    );
}

#[tokio::test]
async fn draft_association_and_metadata_follow_the_new_bucket() {
    let store = MemoryStore::new();
    let pair = published_pair(&store).await;
    put_master(&store, pair.record_bucket, "video.mp4", 720).await;

    let (options, cancel) = run();
    let outcome = reconciler(&store)
        .reconcile(&EntityId::depid(DEPID), options, &cancel)
        .await
        .unwrap();

    let association = store
        .association(pair.deposit.id, BucketRole::Deposit)
        .unwrap();
    assert_eq!(association.bucket_id, outcome.new_bucket_id);
    assert_eq!(association.revision, 2);
    assert!(store.associations_to(pair.deposit_bucket).is_empty());
    assert_eq!(
        store
            .association(pair.record.id, BucketRole::Record)
            .unwrap()
            .bucket_id,
        pair.record_bucket
    );

    let deposit = store.entity(pair.deposit.id).unwrap();
    let record = store.entity(pair.record.id).unwrap();
    assert_eq!(deposit.document.buckets.deposit, Some(outcome.new_bucket_id));
    assert_eq!(record.document.buckets.deposit, Some(outcome.new_bucket_id));
    assert_eq!(record.document.buckets.record, Some(pair.record_bucket));
    assert_eq!(record.document.deposit, deposit.document.deposit);
    assert_eq!(deposit.revision, pair.deposit.revision + 1);
    assert_eq!(record.revision, pair.record.revision + 1);

    assert_eq!(deposit.document.files.len(), 1);
    assert_eq!(deposit.document.files[0].key, "video.mp4");
    assert_eq!(deposit.document.files[0].bucket_id, outcome.new_bucket_id);
    assert!(record.document.extra.contains_key("title"));
}

#[tokio::test]
async fn running_twice_replaces_the_bucket_again() {
    let store = MemoryStore::new();
    let pair = published_pair(&store).await;
    put_master(&store, pair.record_bucket, "video.mp4", 720).await;
    let reconciler = reconciler(&store);
    let id = EntityId::recid(RECID);

    let (options, cancel) = run();
    let first = reconciler.reconcile(&id, options, &cancel).await.unwrap();
    let second = reconciler.reconcile(&id, options, &cancel).await.unwrap();

    assert_ne!(first.new_bucket_id, second.new_bucket_id);
    assert_eq!(second.old_bucket_id, first.new_bucket_id);
    assert!(store.bucket(pair.deposit_bucket).is_none());
    assert!(store.bucket(first.new_bucket_id).is_none());
    assert!(store.bucket(second.new_bucket_id).is_some());
}

#[tokio::test]
async fn missing_master_is_a_warning() {
    let store = MemoryStore::new();
    let pair = published_pair(&store).await;
    let stale = Uuid::new_v4().to_string();
    put_slave(&store, pair.record_bucket, "video-480p.mp4", &stale, "480p").await;

    let (options, cancel) = run();
    let outcome = reconciler(&store)
        .reconcile(&EntityId::recid(RECID), options, &cancel)
        .await
        .unwrap();

    assert_eq!(outcome.canonical_version_id, None);
    assert_eq!(outcome.slaves_retagged, 0);
    assert_eq!(
        outcome.warnings,
        vec![ReconcileWarning::CanonicalRenditionMissing {
            bucket_id: outcome.new_bucket_id
        }]
    );
    let heads = store.tagged_heads(outcome.new_bucket_id);
    assert_eq!(heads[0].tag(MASTER_TAG), Some(stale.as_str()));
}

#[tokio::test]
async fn unknown_identifier_changes_nothing() {
    let store = MemoryStore::new();
    let pair = published_pair(&store).await;
    let before = store.bucket_count();

    let (options, cancel) = run();
    let err = reconciler(&store)
        .reconcile(&EntityId::recid("does-not-exist"), options, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NotFound(_)));
    assert_eq!(store.bucket_count(), before);
    assert_eq!(
        store
            .association(pair.deposit.id, BucketRole::Deposit)
            .unwrap()
            .revision,
        1
    );
}

#[tokio::test]
async fn unknown_deposit_is_not_found() {
    let store = MemoryStore::new();
    published_pair(&store).await;

    let (options, cancel) = run();
    let err = reconciler(&store)
        .reconcile(&EntityId::depid("dep-unknown"), options, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn exhausted_storage_leaves_no_new_bucket() {
    let store = MemoryStore::new();
    let pair = published_pair(&store).await;
    put_master(&store, pair.record_bucket, "video.mp4", 720).await;
    let before = store.bucket_count();

    store.fail_next(
        FailPoint::InsertVersion,
        StoreError::Exhausted("no space left on device".to_string()),
    );
    let (options, cancel) = run();
    let err = reconciler(&store)
        .reconcile(&EntityId::recid(RECID), options, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::StorageExhausted(_)));
    assert_eq!(store.bucket_count(), before);
    assert!(store.bucket(pair.deposit_bucket).is_some());
}

#[tokio::test]
async fn release_failure_is_rolled_back() {
    let store = MemoryStore::new();
    let pair = published_pair(&store).await;
    put_master(&store, pair.record_bucket, "video.mp4", 720).await;
    put_slave(
        &store,
        pair.record_bucket,
        "video-360p.mp4",
        &Uuid::new_v4().to_string(),
        "360p",
    )
    .await;
    let before = store.bucket_count();

    store.fail_next(
        FailPoint::RemoveBucket,
        StoreError::Backend("connection reset".to_string()),
    );
    let (options, cancel) = run();
    let err = reconciler(&store)
        .reconcile(&EntityId::recid(RECID), options, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AppError::Aborted {
            step: ReconcileStep::TagsPropagated,
            ..
        }
    ));
    assert_eq!(store.bucket_count(), before);
    assert!(store.bucket(pair.deposit_bucket).is_some());
    assert_eq!(
        store
            .association(pair.deposit.id, BucketRole::Deposit)
            .unwrap()
            .bucket_id,
        pair.deposit_bucket
    );
}

#[tokio::test]
async fn metadata_failure_reports_the_last_completed_step() {
    let store = MemoryStore::new();
    let pair = published_pair(&store).await;
    put_master(&store, pair.record_bucket, "video.mp4", 720).await;
    let before = store.bucket_count();

    store.fail_next(
        FailPoint::UpdateEntity,
        StoreError::Backend("statement timeout".to_string()),
    );
    let (options, cancel) = run();
    let err = reconciler(&store)
        .reconcile(&EntityId::recid(RECID), options, &cancel)
        .await
        .unwrap_err();

    match err {
        AppError::Aborted { step, .. } => assert_eq!(step, ReconcileStep::Released),
        other => panic!("expected an aborted reconciliation, got {other:?}"),
    }
    assert_eq!(store.bucket_count(), before);
    assert!(store.bucket(pair.deposit_bucket).is_some());
    assert_eq!(
        store.entity(pair.deposit.id).unwrap().document,
        pair.deposit.document
    );
}

#[tokio::test]
async fn commit_failure_keeps_the_old_state() {
    let store = MemoryStore::new();
    let pair = published_pair(&store).await;
    put_master(&store, pair.record_bucket, "video.mp4", 720).await;
    let before = store.bucket_count();

    store.fail_next(
        FailPoint::Commit,
        StoreError::Unavailable("connection lost".to_string()),
    );
    let (options, cancel) = run();
    let err = reconciler(&store)
        .reconcile(&EntityId::recid(RECID), options, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AppError::Aborted {
            step: ReconcileStep::MetadataSynced,
            ..
        }
    ));
    assert_eq!(store.bucket_count(), before);
    assert_eq!(
        store
            .association(pair.deposit.id, BucketRole::Deposit)
            .unwrap()
            .bucket_id,
        pair.deposit_bucket
    );
}

/// Lets a rival transaction repoint the draft right after ours has started.
struct RacingStore {
    inner: MemoryStore,
    deposit_id: Uuid,
    rival_bucket: Uuid,
}

#[async_trait]
impl Store for RacingStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let ours = self.inner.begin().await?;
        let mut rival = self.inner.begin().await?;
        rival
            .compare_and_set_association(self.deposit_id, BucketRole::Deposit, 1, self.rival_bucket)
            .await?;
        rival.commit().await?;
        Ok(ours)
    }
}

#[tokio::test]
async fn concurrent_repoint_conflicts() {
    let store = MemoryStore::new();
    let pair = published_pair(&store).await;
    put_master(&store, pair.record_bucket, "video.mp4", 720).await;
    let before = store.bucket_count();

    let racing = RacingStore {
        inner: store.clone(),
        deposit_id: pair.deposit.id,
        rival_bucket: pair.record_bucket,
    };
    let reconciler = Reconciler::new(
        Arc::new(racing),
        EntityResolver::new(),
        SnapshotService::new(),
        TagModel::new(),
        AssociationRepository::new(),
    );
    let (options, cancel) = run();
    let err = reconciler
        .reconcile(&EntityId::recid(RECID), options, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AppError::ConflictingAssociation { entity_id, role: BucketRole::Deposit }
            if entity_id == pair.deposit.id
    ));
    assert_eq!(store.bucket_count(), before);
    // Only the rival's change is visible.
    assert_eq!(
        store
            .association(pair.deposit.id, BucketRole::Deposit)
            .unwrap()
            .bucket_id,
        pair.record_bucket
    );
}

#[tokio::test]
async fn conflict_at_commit_is_reported_as_conflicting_association() {
    let store = MemoryStore::new();
    let pair = published_pair(&store).await;
    put_master(&store, pair.record_bucket, "video.mp4", 720).await;

    store.fail_next(
        FailPoint::Commit,
        StoreError::Conflict("association revision changed".to_string()),
    );
    let (options, cancel) = run();
    let err = reconciler(&store)
        .reconcile(&EntityId::recid(RECID), options, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AppError::ConflictingAssociation { entity_id, role: BucketRole::Deposit }
            if entity_id == pair.deposit.id
    ));
    assert!(store.bucket(pair.deposit_bucket).is_some());
}

#[tokio::test]
async fn cancellation_before_snapshot_writes_nothing() {
    let store = MemoryStore::new();
    let pair = published_pair(&store).await;
    put_master(&store, pair.record_bucket, "video.mp4", 720).await;
    let before = store.bucket_count();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = reconciler(&store)
        .reconcile(&EntityId::recid(RECID), ReconcileOptions::default(), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Cancelled(_)));
    assert_eq!(store.bucket_count(), before);
    assert!(store.bucket(pair.deposit_bucket).is_some());
}

#[tokio::test]
async fn dry_run_reports_without_writing() {
    let store = MemoryStore::new();
    let pair = published_pair(&store).await;
    put_master(&store, pair.record_bucket, "video.mp4", 720).await;
    let before = store.bucket_count();

    let outcome = reconciler(&store)
        .reconcile(
            &EntityId::recid(RECID),
            ReconcileOptions { dry_run: true },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(outcome.dry_run);
    assert_eq!(outcome.old_bucket_id, pair.deposit_bucket);
    assert!(store.bucket(outcome.new_bucket_id).is_none());
    assert_eq!(store.bucket_count(), before);
    assert_eq!(store.entity(pair.deposit.id).unwrap(), pair.deposit);
}

#[tokio::test]
async fn draft_only_files_are_reported() {
    let store = MemoryStore::new();
    let pair = published_pair(&store).await;
    put_master(&store, pair.record_bucket, "video.mp4", 720).await;
    put_file(&store, pair.deposit_bucket, "video.mp4", &[]).await;
    put_file(&store, pair.deposit_bucket, "subtitles_en.vtt", &[]).await;

    let (options, cancel) = run();
    let outcome = reconciler(&store)
        .reconcile(&EntityId::recid(RECID), options, &cancel)
        .await
        .unwrap();

    assert_eq!(outcome.discarded_draft_keys, vec!["subtitles_en.vtt".to_string()]);
    assert!(outcome
        .warnings
        .contains(&ReconcileWarning::DraftOnlyKeysDiscarded {
            keys: vec!["subtitles_en.vtt".to_string()]
        }));
}

#[tokio::test]
async fn shared_draft_bucket_is_retained() {
    let store = MemoryStore::new();
    let pair = published_pair(&store).await;
    put_master(&store, pair.record_bucket, "video.mp4", 720).await;

    // Another entity still points at the draft bucket.
    {
        let mut tx = store.begin().await.unwrap();
        tx.insert_association(&Association::new(
            Uuid::new_v4(),
            BucketRole::Deposit,
            pair.deposit_bucket,
        ))
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    let (options, cancel) = run();
    let outcome = reconciler(&store)
        .reconcile(&EntityId::recid(RECID), options, &cancel)
        .await
        .unwrap();

    assert_eq!(outcome.old_bucket, ReleaseOutcome::Retained { references: 1 });
    assert!(outcome
        .warnings
        .contains(&ReconcileWarning::OldBucketRetained {
            bucket_id: pair.deposit_bucket,
            references: 1
        }));
    assert!(store.bucket(pair.deposit_bucket).is_some());
}
