//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// Whether this error reports a duplicate key.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::AlreadyExists(_) => true,
            Self::Database(err) => is_unique_violation(err),
            _ => false,
        }
    }

    /// Whether retrying the same operation may succeed.
    ///
    /// Covers SQLite lock contention, PostgreSQL serialization failures and
    /// deadlocks, and pool exhaustion.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(err) => is_transient(err),
            _ => false,
        }
    }
}

impl From<std::io::Error> for MetadataError {
    fn from(e: std::io::Error) -> Self {
        MetadataError::Config(e.to_string())
    }
}

/// Whether `err` is a unique or primary key violation.
///
/// SQLite reports "UNIQUE constraint failed: ..."; PostgreSQL uses SQLSTATE 23505.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation()
                || db_err.code().as_deref() == Some("23505")
                || db_err.message().contains("UNIQUE constraint")
        }
        _ => false,
    }
}

pub(crate) fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
            let sqlite_busy = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, 5 | 6));
            let pg_retry = matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"));
            sqlite_busy
                || pg_retry
                || db_err.message().contains("database is locked")
                || db_err.message().contains("database is busy")
        }
        _ => false,
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
