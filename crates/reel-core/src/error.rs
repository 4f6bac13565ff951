//! Error types module
//!
//! All failures surfaced by the reconciliation engine and the maintenance commands are
//! unified under `AppError`. The CLI renders them through `ErrorMetadata` as an operator
//! message plus a distinct process exit code.
//!
//! The `Database` variant and `From<sqlx::Error>` are gated behind the `sqlx` feature.

use std::io;

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

use crate::models::{BucketRole, ReconcileStep};

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like unknown identifiers
    Debug,
    /// Warning level - for conditions an operator can retry or fix
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Describes how an error should be presented to the operator running a command.
pub trait ErrorMetadata {
    /// Process exit code
    fn exit_code(&self) -> u8;

    /// Machine-readable error code (e.g., "CONTAINER_UNAVAILABLE")
    fn error_code(&self) -> &'static str;

    /// Whether running the command again may succeed
    fn is_recoverable(&self) -> bool;

    /// Suggested next step for the operator
    fn suggested_action(&self) -> Option<&'static str>;

    /// One-line message printed by the CLI
    fn operator_message(&self) -> String;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage container unavailable: {0}")]
    ContainerUnavailable(String),

    #[error("Storage exhausted: {0}")]
    StorageExhausted(String),

    #[error("Association ({entity_id}, {role}) was modified concurrently")]
    ConflictingAssociation { entity_id: uuid::Uuid, role: BucketRole },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Reconciliation aborted after step '{step}', all changes rolled back")]
    Aborted {
        step: ReconcileStep,
        #[source]
        source: Box<AppError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        AppError::Database(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::Internal(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::InvalidInput(format!("UUID parsing error: {}", err))
    }
}

/// Static metadata for each variant: (exit_code, error_code, recoverable, suggested_action, log_level).
fn app_error_static_metadata(
    err: &AppError,
) -> (u8, &'static str, bool, Option<&'static str>, LogLevel) {
    match err {
        AppError::Database(_) => (
            1,
            "DATABASE_ERROR",
            true,
            Some("Check DATABASE_URL and retry"),
            LogLevel::Error,
        ),
        AppError::InvalidInput(_) => (
            2,
            "INVALID_INPUT",
            false,
            Some("Check the command arguments and try again"),
            LogLevel::Debug,
        ),
        AppError::NotFound(_) => (
            3,
            "NOT_FOUND",
            false,
            Some("Verify the record or deposit identifier exists"),
            LogLevel::Debug,
        ),
        AppError::ConflictingAssociation { .. } => (
            4,
            "CONFLICTING_ASSOCIATION",
            true,
            Some("Another run touched this deposit; retry the command"),
            LogLevel::Warn,
        ),
        AppError::ContainerUnavailable(_) => (
            5,
            "CONTAINER_UNAVAILABLE",
            true,
            Some("Check that the record bucket exists and the store is reachable"),
            LogLevel::Error,
        ),
        AppError::StorageExhausted(_) => (
            5,
            "STORAGE_EXHAUSTED",
            true,
            Some("Free space or raise the bucket quota, then retry"),
            LogLevel::Warn,
        ),
        AppError::Aborted { .. } => (
            6,
            "RECONCILIATION_ABORTED",
            true,
            Some("Nothing was committed; inspect the cause and retry"),
            LogLevel::Error,
        ),
        AppError::Cancelled(_) => (130, "CANCELLED", true, None, LogLevel::Warn),
        AppError::Internal(_) | AppError::InternalWithSource { .. } => (
            1,
            "INTERNAL_ERROR",
            true,
            Some("Retry after a short delay"),
            LogLevel::Error,
        ),
    }
}

impl AppError {
    /// Get error type name for logging
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Database(_) => "Database",
            AppError::InvalidInput(_) => "InvalidInput",
            AppError::NotFound(_) => "NotFound",
            AppError::ContainerUnavailable(_) => "ContainerUnavailable",
            AppError::StorageExhausted(_) => "StorageExhausted",
            AppError::ConflictingAssociation { .. } => "ConflictingAssociation",
            AppError::Cancelled(_) => "Cancelled",
            AppError::Aborted { .. } => "Aborted",
            AppError::Internal(_) => "Internal",
            AppError::InternalWithSource { .. } => "Internal",
        }
    }

    /// Wrap a failure that happened after `step` completed.
    ///
    /// Errors that already describe a rolled-back outcome the operator acts on directly
    /// are returned unchanged.
    pub fn aborted_after(self, step: ReconcileStep) -> Self {
        match self {
            AppError::ConflictingAssociation { .. }
            | AppError::Cancelled(_)
            | AppError::Aborted { .. } => self,
            other => AppError::Aborted {
                step,
                source: Box::new(other),
            },
        }
    }

    /// Get detailed error information including error chain
    pub fn detailed_message(&self) -> String {
        use std::error::Error;

        let mut details = self.to_string();

        let mut source = self.source();
        let mut depth = 0;
        while let Some(err) = source {
            depth += 1;
            if depth > 5 {
                details.push_str("\n  ... (truncated)");
                break;
            }
            details.push_str(&format!("\n  Caused by: {}", err));
            source = err.source();
        }

        details
    }
}

impl ErrorMetadata for AppError {
    fn exit_code(&self) -> u8 {
        app_error_static_metadata(self).0
    }

    fn error_code(&self) -> &'static str {
        app_error_static_metadata(self).1
    }

    fn is_recoverable(&self) -> bool {
        app_error_static_metadata(self).2
    }

    fn suggested_action(&self) -> Option<&'static str> {
        app_error_static_metadata(self).3
    }

    fn log_level(&self) -> LogLevel {
        app_error_static_metadata(self).4
    }

    fn operator_message(&self) -> String {
        match self {
            AppError::Database(_) => "Failed to access database".to_string(),
            AppError::InvalidInput(ref msg) => msg.clone(),
            AppError::NotFound(ref msg) => msg.clone(),
            AppError::ContainerUnavailable(ref msg) => {
                format!("Record bucket cannot be read: {}", msg)
            }
            AppError::StorageExhausted(ref msg) => {
                format!("Bucket copy cannot be stored: {}", msg)
            }
            AppError::ConflictingAssociation { entity_id, role } => format!(
                "The {} bucket of {} changed while reconciling",
                role, entity_id
            ),
            AppError::Cancelled(ref msg) => msg.clone(),
            AppError::Aborted { step, source } => format!(
                "Reconciliation rolled back after step '{}': {}",
                step,
                source.operator_message()
            ),
            AppError::Internal(ref msg) => msg.clone(),
            AppError::InternalWithSource { message, .. } => message.clone(),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
