//! Published records, drafts (deposits) and the identifiers that resolve to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use super::bucket::TaggedVersion;

/// Persistent identifier namespaces accepted by the maintenance commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PidType {
    Recid,
    Depid,
}

impl Display for PidType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            PidType::Recid => write!(f, "recid"),
            PidType::Depid => write!(f, "depid"),
        }
    }
}

impl FromStr for PidType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recid" => Ok(PidType::Recid),
            "depid" => Ok(PidType::Depid),
            _ => Err(anyhow::anyhow!("Invalid pid type: {}", s)),
        }
    }
}

/// An operator-supplied identifier: either a record id or a deposit id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub pid_type: PidType,
    pub value: String,
}

impl EntityId {
    pub fn recid(value: impl Into<String>) -> Self {
        Self {
            pid_type: PidType::Recid,
            value: value.into(),
        }
    }

    pub fn depid(value: impl Into<String>) -> Self {
        Self {
            pid_type: PidType::Depid,
            value: value.into(),
        }
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}:{}", self.pid_type, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Record,
    Deposit,
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            EntityKind::Record => write!(f, "record"),
            EntityKind::Deposit => write!(f, "deposit"),
        }
    }
}

impl FromStr for EntityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "record" => Ok(EntityKind::Record),
            "deposit" => Ok(EntityKind::Deposit),
            _ => Err(anyhow::anyhow!("Invalid entity kind: {}", s)),
        }
    }
}

/// Denormalized bucket references cached on an entity's metadata (`_buckets`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposit: Option<Uuid>,
}

/// Identifier a draft was published under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPid {
    pub value: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Draft bookkeeping (`_deposit`). Fields other than `id` and `pid` are carried
/// through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<PublishedPid>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One entry of the `_files` dump kept on a draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub key: String,
    pub version_id: Uuid,
    pub bucket_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<Uuid>,
    pub size: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl From<&TaggedVersion> for FileEntry {
    fn from(tagged: &TaggedVersion) -> Self {
        Self {
            key: tagged.version.key.clone(),
            version_id: tagged.version.version_id,
            bucket_id: tagged.version.bucket_id,
            file_id: tagged.version.file_id,
            size: tagged.version.size,
            tags: tagged.tags.clone(),
        }
    }
}

/// The JSON metadata document of a record or deposit.
///
/// Only the fields the reconciliation touches are typed; everything else is kept
/// verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDocument {
    #[serde(rename = "_buckets", default)]
    pub buckets: BucketRefs,
    #[serde(rename = "_deposit", default, skip_serializing_if = "Option::is_none")]
    pub deposit: Option<DepositInfo>,
    #[serde(rename = "_files", default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A stored record or deposit with its metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub id: Uuid,
    pub kind: EntityKind,
    pub document: EntityDocument,
    /// Optimistic concurrency token, bumped on every update.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityMetadata {
    pub fn new(kind: EntityKind, document: EntityDocument) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            document,
            revision: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// The draft identifier recorded in `_deposit.id`.
    pub fn deposit_pid(&self) -> Option<&str> {
        self.document.deposit.as_ref().map(|d| d.id.as_str())
    }

    /// The record identifier the draft was published under (`_deposit.pid.value`).
    pub fn published_pid(&self) -> Option<&str> {
        self.document
            .deposit
            .as_ref()
            .and_then(|d| d.pid.as_ref())
            .map(|pid| pid.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_keeps_unknown_fields() {
        let raw = json!({
            "title": {"title": "CERN video"},
            "_buckets": {"record": "7f2b1c8e-9a3d-4b5e-8f10-2c3d4e5f6a7b"},
            "_deposit": {
                "id": "dep-42",
                "status": "published",
                "owners": [1],
                "pid": {"type": "recid", "value": "42", "revision_id": 3}
            }
        });

        let doc: EntityDocument = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(doc.deposit.as_ref().unwrap().id, "dep-42");
        assert!(doc.buckets.deposit.is_none());
        assert_eq!(doc.extra.get("title"), raw.get("title"));

        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["_deposit"]["status"], "published");
        assert_eq!(back["_deposit"]["pid"]["revision_id"], 3);
        assert!(back.get("_files").is_none());
    }

    #[test]
    fn pid_accessors() {
        let doc: EntityDocument = serde_json::from_value(json!({
            "_deposit": {"id": "dep-1", "pid": {"type": "recid", "value": "1"}}
        }))
        .unwrap();
        let entity = EntityMetadata::new(EntityKind::Deposit, doc);
        assert_eq!(entity.deposit_pid(), Some("dep-1"));
        assert_eq!(entity.published_pid(), Some("1"));
    }

    #[test]
    fn entity_id_display() {
        assert_eq!(EntityId::recid("12").to_string(), "recid:12");
        assert_eq!(EntityId::depid("ab").to_string(), "depid:ab");
    }
}
