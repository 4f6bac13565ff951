//! Reel Core Library
//!
//! This crate provides the domain models, error types and configuration shared by
//! the storage backends, the reconciliation services and the maintenance CLI.

pub mod config;
pub mod constants;
pub mod error;
pub mod models;

// Re-export commonly used types
pub use config::{Config, LogFormat};
pub use error::{AppError, AppResult, ErrorMetadata, LogLevel};
pub use models::{
    Association, Bucket, BucketRole, EntityId, EntityKind, EntityMetadata, ObjectVersion,
    ObjectVersionTag, PidType, Quality, ReconcileStep, TaggedVersion,
};
