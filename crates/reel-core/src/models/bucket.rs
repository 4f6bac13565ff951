//! Buckets, object versions and their tags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::constants::{CONTEXT_TYPE_MASTER, CONTEXT_TYPE_TAG, MASTER_TAG};

/// A versioned object container scoped to one entity.
///
/// A locked bucket is immutable: it can be read and cloned but never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: Uuid,
    pub locked: bool,
    /// Maximum total size in bytes; `None` means unlimited.
    pub quota_size: Option<i64>,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bucket {
    /// A fresh, empty, unlocked bucket.
    pub fn new(quota_size: Option<i64>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            locked: false,
            quota_size,
            size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `additional` bytes still fit under the quota.
    pub fn has_room_for(&self, additional: i64) -> bool {
        match self.quota_size {
            Some(quota) => self.size.saturating_add(additional) <= quota,
            None => true,
        }
    }
}

/// One immutable revision of a named object inside exactly one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectVersion {
    /// Unique across all buckets.
    pub version_id: Uuid,
    pub bucket_id: Uuid,
    pub key: String,
    /// Content reference. `None` marks a deletion.
    pub file_id: Option<Uuid>,
    pub size: i64,
    pub is_head: bool,
    pub created_at: DateTime<Utc>,
}

impl ObjectVersion {
    pub fn is_delete_marker(&self) -> bool {
        self.file_id.is_none()
    }

    /// Copy of this version into `bucket_id` under a fresh version id.
    /// Content is shared by reference, never duplicated.
    pub fn copy_into(&self, bucket_id: Uuid) -> Self {
        Self {
            version_id: Uuid::new_v4(),
            bucket_id,
            key: self.key.clone(),
            file_id: self.file_id,
            size: self.size,
            is_head: true,
            created_at: Utc::now(),
        }
    }
}

/// A key/value annotation attached to one object version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectVersionTag {
    pub version_id: Uuid,
    pub key: String,
    pub value: String,
}

impl ObjectVersionTag {
    pub fn new(version_id: Uuid, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            version_id,
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A head version together with all of its tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaggedVersion {
    pub version: ObjectVersion,
    pub tags: BTreeMap<String, String>,
}

impl TaggedVersion {
    /// Group `tags` onto their versions. Tags of versions not in `versions` are ignored.
    pub fn assemble(versions: Vec<ObjectVersion>, tags: Vec<ObjectVersionTag>) -> Vec<Self> {
        let mut by_version: BTreeMap<Uuid, BTreeMap<String, String>> = BTreeMap::new();
        for tag in tags {
            by_version
                .entry(tag.version_id)
                .or_default()
                .insert(tag.key, tag.value);
        }
        versions
            .into_iter()
            .map(|version| {
                let tags = by_version.remove(&version.version_id).unwrap_or_default();
                Self { version, tags }
            })
            .collect()
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// A derived rendition: has content and points at a master.
    pub fn is_slave(&self) -> bool {
        !self.version.is_delete_marker() && self.tags.contains_key(MASTER_TAG)
    }

    /// A candidate canonical rendition: has content, is classified as master and
    /// does not itself point at another master.
    pub fn is_canonical_candidate(&self) -> bool {
        !self.version.is_delete_marker()
            && !self.tags.contains_key(MASTER_TAG)
            && self.tag(CONTEXT_TYPE_TAG) == Some(CONTEXT_TYPE_MASTER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(bucket_id: Uuid, key: &str, file: bool) -> ObjectVersion {
        ObjectVersion {
            version_id: Uuid::new_v4(),
            bucket_id,
            key: key.to_string(),
            file_id: file.then(Uuid::new_v4),
            size: 10,
            is_head: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn quota_limits_room() {
        let mut bucket = Bucket::new(Some(100));
        bucket.size = 90;
        assert!(bucket.has_room_for(10));
        assert!(!bucket.has_room_for(11));
        assert!(Bucket::new(None).has_room_for(i64::MAX));
    }

    #[test]
    fn copy_keeps_content_and_changes_identity() {
        let source = version(Uuid::new_v4(), "video.mp4", true);
        let target_bucket = Uuid::new_v4();
        let copy = source.copy_into(target_bucket);
        assert_ne!(copy.version_id, source.version_id);
        assert_eq!(copy.bucket_id, target_bucket);
        assert_eq!(copy.file_id, source.file_id);
        assert_eq!(copy.key, source.key);
    }

    #[test]
    fn classifies_master_and_slaves() {
        let bucket_id = Uuid::new_v4();
        let master = version(bucket_id, "video.mp4", true);
        let slave = version(bucket_id, "video-720p.mp4", true);
        let deleted = version(bucket_id, "old-360p.mp4", false);
        let tags = vec![
            ObjectVersionTag::new(master.version_id, CONTEXT_TYPE_TAG, CONTEXT_TYPE_MASTER),
            ObjectVersionTag::new(slave.version_id, MASTER_TAG, "stale"),
            ObjectVersionTag::new(deleted.version_id, MASTER_TAG, "stale"),
        ];

        let tagged = TaggedVersion::assemble(vec![master, slave, deleted], tags);
        assert!(tagged[0].is_canonical_candidate());
        assert!(!tagged[0].is_slave());
        assert!(tagged[1].is_slave());
        assert!(!tagged[1].is_canonical_candidate());
        assert!(!tagged[2].is_slave(), "deletion markers are never slaves");
    }
}
