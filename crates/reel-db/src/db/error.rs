//! Mapping of sqlx failures onto `StoreError`.

use reel_storage::StoreError;

/// SQLSTATE codes that mean another transaction got there first.
const CONFLICT_CODES: &[&str] = &[
    "23505", // unique_violation
    "23503", // foreign_key_violation
    "40001", // serialization_failure
    "40P01", // deadlock_detected
];

pub(crate) fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            if code.starts_with("53") {
                // insufficient_resources class: disk_full, out_of_memory, ...
                StoreError::Exhausted(db_err.message().to_string())
            } else if code == "23514" && db_err.constraint() == Some("buckets_size_within_quota") {
                StoreError::Exhausted(db_err.message().to_string())
            } else if CONFLICT_CODES.contains(&code.as_str()) {
                StoreError::Conflict(db_err.message().to_string())
            } else {
                StoreError::Backend(err.to_string())
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
        sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}
