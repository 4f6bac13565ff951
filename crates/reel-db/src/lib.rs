//! Reel Database Layer
//!
//! Postgres backend for the reel store traits: `PgStore` hands out `PgStoreTx`
//! transactions for the reconciliation, `FlowRepository` talks to the workflow engine
//! tables.

pub mod db;

pub use db::{connect, run_migrations, FlowRepository, PgStore, PgStoreTx};
