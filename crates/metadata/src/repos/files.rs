//! File and version repository.

use crate::error::MetadataResult;
use crate::models::{CommitOutcome, FileRow, FileVersionRow, IdempotencyRow};
use async_trait::async_trait;

/// Repository for files and their versions.
///
/// Version numbers are handed out by [`reserve_version`](FileRepo::reserve_version)
/// in a short transaction so that blob writes happen without any lock held.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Insert a file together with its first version in one transaction.
    ///
    /// When `idempotency` is given its row is inserted in the same
    /// transaction. If the key is already recorded nothing is committed and
    /// the existing row is returned as [`CommitOutcome::Duplicate`].
    async fn create_file(
        &self,
        file: &FileRow,
        first_version: &FileVersionRow,
        idempotency: Option<&IdempotencyRow>,
    ) -> MetadataResult<CommitOutcome>;

    /// Get a file by id, including soft-deleted ones.
    async fn get_file(&self, file_id: &str) -> MetadataResult<Option<FileRow>>;

    /// Hand out the next version number for a live file.
    ///
    /// Returns `NotFound` if the file is missing or deleted.
    async fn reserve_version(&self, file_id: &str) -> MetadataResult<i64>;

    /// Give back a reservation that will never be committed.
    ///
    /// Only takes effect while `version` is still the highest reservation
    /// and above the current version. Returns whether it did.
    async fn release_version(&self, file_id: &str, version: i64) -> MetadataResult<bool>;

    /// Insert a reserved version and advance the file's current version.
    ///
    /// `current_version` becomes `max(current_version, version)` and `path`
    /// follows it. Returns `NotFound` if the file was deleted meanwhile and
    /// `AlreadyExists` if the version row is already present.
    async fn commit_version(
        &self,
        version: &FileVersionRow,
        idempotency: Option<&IdempotencyRow>,
    ) -> MetadataResult<CommitOutcome>;

    /// Get one version of a file.
    async fn get_version(
        &self,
        file_id: &str,
        version: i64,
    ) -> MetadataResult<Option<FileVersionRow>>;

    /// All versions of a file, ascending.
    async fn list_versions(&self, file_id: &str) -> MetadataResult<Vec<FileVersionRow>>;

    /// Soft-delete a file and drop its version rows in one transaction.
    ///
    /// Returns the number of version rows removed, or `NotFound` if the file
    /// is missing or already deleted.
    async fn mark_deleted(&self, file_id: &str) -> MetadataResult<u64>;
}
