//! Repository error taxonomy.
//!
//! Every failure surfaced to callers is one of these kinds, each with a
//! stable machine-readable code and a retry hint.

use thiserror::Error;
use vellum_core::Version;
use vellum_metadata::MetadataError;

/// Repository operation errors.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The file does not exist or has been deleted.
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("version {version} of file {file_id} not found")]
    VersionNotFound { file_id: String, version: Version },

    /// An idempotency key was reused for a different file.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage write failed: {0}")]
    StorageWrite(String),

    /// Metadata points at a blob that cannot be read.
    #[error("storage read failed: {0}")]
    StorageRead(String),

    #[error("metadata transaction failed: {0}")]
    MetadataTransaction(String),
}

impl RepositoryError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::VersionNotFound { .. } => "version_not_found",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation_error",
            Self::StorageWrite(_) => "storage_write_error",
            Self::StorageRead(_) => "storage_read_error",
            Self::MetadataTransaction(_) => "metadata_transaction_error",
        }
    }

    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageWrite(_) | Self::MetadataTransaction(_))
    }
}

impl From<vellum_core::Error> for RepositoryError {
    fn from(e: vellum_core::Error) -> Self {
        match e {
            vellum_core::Error::Serialization(msg) => Self::MetadataTransaction(msg),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<MetadataError> for RepositoryError {
    fn from(e: MetadataError) -> Self {
        match e {
            MetadataError::NotFound(what) => Self::NotFound(what),
            other => Self::MetadataTransaction(other.to_string()),
        }
    }
}

/// Result type for repository operations.
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;
