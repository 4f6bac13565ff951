//! Maintenance operations on records, drafts and their storage buckets.
//!
//! Every service works against the `reel_storage` traits and is handed its
//! collaborators at construction.

pub mod flows;
pub mod reconcile;
pub mod resolver;
pub mod subformats;

pub use flows::TaskRestartService;
pub use reconcile::{
    AssociationRepository, ReconcileOptions, Reconciler, SnapshotService, TagModel,
};
pub use resolver::{EntityResolver, ResolvedPair};
pub use subformats::{FlowTranscoder, SubformatService, TranscodeRequest, Transcoder};
