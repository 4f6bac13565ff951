//! Postgres implementations of the store traits.
//
// Store transactions (buckets, associations, entities)
pub mod store;
//
// Workflow engine
pub mod flow;
//
// Pool and migrations
pub mod pool;
//
mod error;

pub use flow::FlowRepository;
pub use pool::{connect, run_migrations};
pub use store::{PgStore, PgStoreTx};
