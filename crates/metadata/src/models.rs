//! Database models mapping to the metadata schema.

use sqlx::FromRow;
use time::OffsetDateTime;

/// A logical file. Soft-deleted rows stay behind with `deleted = true`.
#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub file_id: String,
    /// Sanitized namespace the file's blobs live under. May be empty.
    pub prefix: String,
    /// Object key of the current version's blob.
    pub path: String,
    pub current_version: i64,
    /// Highest version number handed out to a writer so far.
    pub reserved_version: i64,
    pub created_by: Option<String>,
    pub created_at: OffsetDateTime,
    pub deleted: bool,
}

/// One immutable version of a file.
#[derive(Debug, Clone, FromRow)]
pub struct FileVersionRow {
    pub file_id: String,
    pub version: i64,
    pub object_key: String,
    /// Lowercase hex SHA-256 of the content.
    pub checksum: String,
    pub size_bytes: i64,
    pub created_at: OffsetDateTime,
}

/// Stored result of the first upload carrying an idempotency key.
#[derive(Debug, Clone, FromRow)]
pub struct IdempotencyRow {
    pub idempotency_key: String,
    /// Serialized upload receipt, replayed verbatim.
    pub result_json: String,
    pub created_at: OffsetDateTime,
}

/// Outcome of a write that may race on an idempotency key.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// Our write committed.
    Committed,
    /// Another writer recorded the key first. Nothing of ours was committed.
    Duplicate(IdempotencyRow),
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}
