//! Errors shared by the source, artifact and catalog stores.

use thiserror::Error;

/// Storage failure outside the job table.
///
/// Every variant is treated as transient by the refresh pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Map an SQLx error raised during `operation` to a [`StoreError`].
///
/// | SQLx error | Code | StoreError |
/// |---|---|---|
/// | Database (unique violation) | `23505` | `Conflict` |
/// | Database (foreign key violation) | `23503` | `NotFound` |
/// | Decode / ColumnDecode | n/a | `Serialization` |
/// | anything else | n/a | `Storage` |
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") => StoreError::NotFound(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode error in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
