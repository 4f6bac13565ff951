pub mod association;
pub mod bucket;
pub mod entity;
pub mod flow;
pub mod reconcile;
pub mod subformat;

pub use association::{Association, BucketRole};
pub use bucket::{Bucket, ObjectVersion, ObjectVersionTag, TaggedVersion};
pub use entity::{
    BucketRefs, DepositInfo, EntityDocument, EntityId, EntityKind, EntityMetadata, FileEntry,
    PidType, PublishedPid,
};
pub use flow::{Flow, FlowTask, TaskKind, TaskStatus};
pub use reconcile::{
    ReconcileOutcome, ReconcileStep, ReconcileWarning, ReleaseOutcome,
};
pub use subformat::{subformat_key, Quality, SubformatDescriptor};
