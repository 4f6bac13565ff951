//! Draft bucket reconciliation.

mod association;
mod orchestrator;
mod snapshot;
mod tags;

pub use association::AssociationRepository;
pub use orchestrator::{ReconcileOptions, Reconciler};
pub use snapshot::SnapshotService;
pub use tags::TagModel;

pub(crate) use tags::tagged_heads;
