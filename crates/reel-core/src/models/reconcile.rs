//! Reconciliation progress markers and outcome reporting.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use uuid::Uuid;

/// Steps of a reconciliation, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStep {
    Resolved,
    Snapshotted,
    Repointed,
    TagsPropagated,
    Released,
    MetadataSynced,
    Committed,
}

impl Display for ReconcileStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ReconcileStep::Resolved => write!(f, "resolved"),
            ReconcileStep::Snapshotted => write!(f, "snapshotted"),
            ReconcileStep::Repointed => write!(f, "repointed"),
            ReconcileStep::TagsPropagated => write!(f, "tags_propagated"),
            ReconcileStep::Released => write!(f, "released"),
            ReconcileStep::MetadataSynced => write!(f, "metadata_synced"),
            ReconcileStep::Committed => write!(f, "committed"),
        }
    }
}

/// What happened to the bucket the draft used before reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Destroyed,
    /// Still referenced by other associations, left in place.
    Retained { references: i64 },
}

/// Non-fatal conditions reported alongside a successful reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconcileWarning {
    /// No canonical rendition in the new bucket; slave tags were left as they were.
    CanonicalRenditionMissing { bucket_id: Uuid },
    /// The previous draft bucket is still referenced and was not destroyed.
    OldBucketRetained { bucket_id: Uuid, references: i64 },
    /// Keys that only existed in the draft bucket and are gone after the copy.
    DraftOnlyKeysDiscarded { keys: Vec<String> },
}

impl Display for ReconcileWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ReconcileWarning::CanonicalRenditionMissing { bucket_id } => write!(
                f,
                "no master video found in bucket {}; subformat tags left unchanged",
                bucket_id
            ),
            ReconcileWarning::OldBucketRetained {
                bucket_id,
                references,
            } => write!(
                f,
                "old bucket {} still has {} reference(s) and was not removed",
                bucket_id, references
            ),
            ReconcileWarning::DraftOnlyKeysDiscarded { keys } => write!(
                f,
                "{} draft-only file(s) discarded: {}",
                keys.len(),
                keys.join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub record_id: Uuid,
    pub deposit_id: Uuid,
    pub old_bucket_id: Uuid,
    pub new_bucket_id: Uuid,
    pub canonical_version_id: Option<Uuid>,
    pub slaves_retagged: usize,
    pub old_bucket: ReleaseOutcome,
    /// Keys present in the old draft bucket but absent from the published one.
    pub discarded_draft_keys: Vec<String>,
    pub warnings: Vec<ReconcileWarning>,
    /// True when the changes were rolled back on purpose.
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_ordered() {
        assert!(ReconcileStep::Snapshotted < ReconcileStep::Repointed);
        assert!(ReconcileStep::Released < ReconcileStep::Committed);
        assert!(serde_json::from_str::<ReconcileStep>("\"started\"").is_err());
        assert_eq!(
            serde_json::from_str::<ReconcileStep>("\"resolved\"").unwrap(),
            ReconcileStep::Resolved
        );
    }

    #[test]
    fn warnings_render_for_operators() {
        let w = ReconcileWarning::DraftOnlyKeysDiscarded {
            keys: vec!["a.mp4".into(), "b.vtt".into()],
        };
        assert_eq!(w.to_string(), "2 draft-only file(s) discarded: a.mp4, b.vtt");
    }
}
