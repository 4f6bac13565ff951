//! Fixtures on the in-memory store.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use reel_core::constants::{
    CONTEXT_TYPE_MASTER, CONTEXT_TYPE_SUBFORMAT, CONTEXT_TYPE_TAG, HEIGHT_TAG, MASTER_TAG,
    PRESET_QUALITY_TAG,
};
use reel_core::models::{
    Association, Bucket, BucketRole, EntityDocument, EntityKind, EntityMetadata,
    ObjectVersion, ObjectVersionTag, PidType,
};
use reel_services::{
    AssociationRepository, EntityResolver, Reconciler, SnapshotService, TagModel,
};
use reel_storage::{AssociationStore, BucketStore, EntityStore, MemoryStore, Store, StoreTx};
use serde_json::json;
use uuid::Uuid;

pub const RECID: &str = "42";
pub const DEPID: &str = "dep-42";

/// A published record and its draft, each with its own bucket.
pub struct Pair {
    pub record: EntityMetadata,
    pub deposit: EntityMetadata,
    pub record_bucket: Uuid,
    pub deposit_bucket: Uuid,
}

pub fn reconciler(store: &MemoryStore) -> Reconciler {
    Reconciler::new(
        Arc::new(store.clone()),
        EntityResolver::new(),
        SnapshotService::new(),
        TagModel::new(),
        AssociationRepository::new(),
    )
}

fn document(buckets: serde_json::Value, status: &str) -> EntityDocument {
    serde_json::from_value(json!({
        "title": {"title": "CERN openlab summer students"},
        "_buckets": buckets,
        "_deposit": {
            "id": DEPID,
            "status": status,
            "owners": [7],
            "pid": {"type": "recid", "value": RECID, "revision_id": 0}
        }
    }))
    .expect("valid fixture document")
}

/// Seed a published record (locked bucket) and its draft (unlocked bucket).
pub async fn published_pair(store: &MemoryStore) -> Pair {
    let mut record_bucket = Bucket::new(Some(10_000_000));
    record_bucket.locked = true;
    let deposit_bucket = Bucket::new(Some(10_000_000));

    let record = EntityMetadata::new(
        EntityKind::Record,
        document(
            json!({"record": record_bucket.id, "deposit": deposit_bucket.id}),
            "published",
        ),
    );
    let deposit = EntityMetadata::new(
        EntityKind::Deposit,
        document(json!({"deposit": deposit_bucket.id}), "draft"),
    );

    let mut tx = store.begin().await.unwrap();
    tx.insert_bucket(&record_bucket).await.unwrap();
    tx.insert_bucket(&deposit_bucket).await.unwrap();
    tx.insert_entity(&record).await.unwrap();
    tx.insert_entity(&deposit).await.unwrap();
    tx.register_pid(PidType::Recid, RECID, record.id).await.unwrap();
    tx.register_pid(PidType::Depid, DEPID, deposit.id).await.unwrap();
    tx.insert_association(&Association::new(
        record.id,
        BucketRole::Record,
        record_bucket.id,
    ))
    .await
    .unwrap();
    tx.insert_association(&Association::new(
        deposit.id,
        BucketRole::Deposit,
        deposit_bucket.id,
    ))
    .await
    .unwrap();
    tx.commit().await.unwrap();

    Pair {
        record,
        deposit,
        record_bucket: record_bucket.id,
        deposit_bucket: deposit_bucket.id,
    }
}

/// Store a file in `bucket_id`, unlocking the bucket for the write if needed.
pub async fn put_file(
    store: &MemoryStore,
    bucket_id: Uuid,
    key: &str,
    tags: &[(&str, String)],
) -> ObjectVersion {
    let version = ObjectVersion {
        version_id: Uuid::new_v4(),
        bucket_id,
        key: key.to_string(),
        file_id: Some(Uuid::new_v4()),
        size: 1_024,
        is_head: true,
        created_at: Utc::now(),
    };

    let mut tx = store.begin().await.unwrap();
    let locked = tx.get_bucket(bucket_id).await.unwrap().unwrap().locked;
    if locked {
        tx.set_bucket_locked(bucket_id, false).await.unwrap();
    }
    tx.insert_version(&version).await.unwrap();
    for (tag, value) in tags {
        tx.put_tag(&ObjectVersionTag::new(version.version_id, *tag, value.as_str()))
            .await
            .unwrap();
    }
    if locked {
        tx.set_bucket_locked(bucket_id, true).await.unwrap();
    }
    tx.commit().await.unwrap();
    version
}

pub async fn put_master(store: &MemoryStore, bucket_id: Uuid, key: &str, height: u32) -> ObjectVersion {
    put_file(
        store,
        bucket_id,
        key,
        &[
            (CONTEXT_TYPE_TAG, CONTEXT_TYPE_MASTER.to_string()),
            (HEIGHT_TAG, height.to_string()),
        ],
    )
    .await
}

pub async fn put_slave(
    store: &MemoryStore,
    bucket_id: Uuid,
    key: &str,
    master: &str,
    quality: &str,
) -> ObjectVersion {
    put_file(
        store,
        bucket_id,
        key,
        &[
            (MASTER_TAG, master.to_string()),
            (CONTEXT_TYPE_TAG, CONTEXT_TYPE_SUBFORMAT.to_string()),
            (PRESET_QUALITY_TAG, quality.to_string()),
        ],
    )
    .await
}
