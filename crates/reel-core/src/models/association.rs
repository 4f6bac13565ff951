use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// Which side of a record/deposit pair a bucket backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketRole {
    /// The published record's bucket (locked).
    Record,
    /// The draft's working bucket (unlocked).
    Deposit,
}

impl FromStr for BucketRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "record" => Ok(BucketRole::Record),
            "deposit" => Ok(BucketRole::Deposit),
            _ => Err(anyhow::anyhow!("Invalid bucket role: {}", s)),
        }
    }
}

impl Display for BucketRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            BucketRole::Record => write!(f, "record"),
            BucketRole::Deposit => write!(f, "deposit"),
        }
    }
}

/// The live mapping from (entity, role) to the bucket currently backing it.
///
/// `revision` increases on every repoint and is the optimistic concurrency token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub entity_id: Uuid,
    pub role: BucketRole,
    pub bucket_id: Uuid,
    pub revision: i64,
    pub updated_at: DateTime<Utc>,
}

impl Association {
    pub fn new(entity_id: Uuid, role: BucketRole, bucket_id: Uuid) -> Self {
        Self {
            entity_id,
            role,
            bucket_id,
            revision: 1,
            updated_at: Utc::now(),
        }
    }
}
