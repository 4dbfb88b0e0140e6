//! Version number allocation and commit.
//!
//! A version number is reserved in a short transaction before any blob I/O,
//! which makes the blob key `prefix/file_id/vN` exclusive to one writer. The
//! version row is inserted and the current pointer advanced in a second
//! transaction once the blob is durable. No lock is held in between.

use crate::error::{RepositoryError, RepositoryResult};
use crate::streamer::KeyInDoubt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use vellum_core::config::RepositoryConfig;
use vellum_core::{FileId, Version};
use vellum_metadata::{
    CommitOutcome, FileRow, FileVersionRow, IdempotencyRow, MetadataError, MetadataResult,
    MetadataStore,
};

/// Retry policy for transient metadata failures.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RepositoryConfig) -> Self {
        Self {
            max_retries: config.max_commit_retries,
            base_backoff: config.commit_retry_backoff(1),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(1 << attempt.saturating_sub(1).min(10))
    }

    /// Run `f`, retrying transient metadata failures with exponential backoff.
    pub(crate) async fn run<T, F, Fut>(&self, op: &'static str, mut f: F) -> MetadataResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MetadataResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient metadata failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RepositoryConfig::default())
    }
}

pub struct VersionSequencer {
    metadata: Arc<dyn MetadataStore>,
    retry: RetryPolicy,
}

impl VersionSequencer {
    pub fn new(metadata: Arc<dyn MetadataStore>, retry: RetryPolicy) -> Self {
        Self { metadata, retry }
    }

    /// Insert a new file at version 1, optionally recording an idempotency key.
    pub async fn create_file(
        &self,
        file: &FileRow,
        first_version: &FileVersionRow,
        idempotency: Option<&IdempotencyRow>,
    ) -> RepositoryResult<CommitOutcome> {
        self.retry
            .run("create_file", move || {
            self.metadata.create_file(file, first_version, idempotency)
        })
        .await
        .map_err(|e| metadata_error(&file.file_id, e))
    }

    /// Reserve the next version number of a live file.
    pub async fn next_version(&self, file_id: &FileId) -> RepositoryResult<Reservation> {
        let id = file_id.to_string();
        let key = id.as_str();
        let reserved = self
            .retry
            .run("reserve_version", move || self.metadata.reserve_version(key))
            .await
            .map_err(|e| metadata_error(&id, e))?;

        let version = Version::try_from(reserved).map_err(|_| {
            RepositoryError::MetadataTransaction(format!(
                "reserved version {reserved} of file {id} is out of range"
            ))
        })?;

        tracing::debug!(file_id = %id, version, "Reserved version");
        Ok(Reservation {
            file_id: id,
            version,
            metadata: Some(self.metadata.clone()),
            key_in_doubt: KeyInDoubt::default(),
            runtime_handle: tokio::runtime::Handle::try_current().ok(),
        })
    }

    /// Commit a reserved version and advance the file's current pointer.
    ///
    /// The reservation is disarmed only when the version commits. On any
    /// other outcome it stays armed so the caller can clean up the blob
    /// before the number is released or skipped.
    pub async fn advance_current(
        &self,
        reservation: &mut Reservation,
        version_row: &FileVersionRow,
        idempotency: Option<&IdempotencyRow>,
    ) -> RepositoryResult<CommitOutcome> {
        let outcome = self
            .retry
            .run("commit_version", move || {
                self.metadata.commit_version(version_row, idempotency)
            })
            .await
            .map_err(|e| metadata_error(&reservation.file_id, e))?;

        if outcome.is_committed() {
            reservation.disarm();
            tracing::debug!(
                file_id = %reservation.file_id,
                version = reservation.version,
                "Committed version"
            );
        }
        Ok(outcome)
    }
}

fn metadata_error(file_id: &str, e: MetadataError) -> RepositoryError {
    match e {
        MetadataError::NotFound(_) => RepositoryError::NotFound(file_id.to_string()),
        other => other.into(),
    }
}

/// A version number handed out to one writer.
///
/// Dropping an unreleased, uncommitted reservation gives the number back in
/// the background, unless its blob key is in doubt. A number whose key may
/// still receive a late write is skipped instead.
pub struct Reservation {
    file_id: String,
    version: Version,
    metadata: Option<Arc<dyn MetadataStore>>,
    key_in_doubt: KeyInDoubt,
    runtime_handle: Option<tokio::runtime::Handle>,
}

impl Reservation {
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Flag shared with the blob write to this version's key.
    pub fn key_in_doubt(&self) -> &KeyInDoubt {
        &self.key_in_doubt
    }

    fn disarm(&mut self) {
        self.metadata = None;
    }

    /// Give the version number back.
    ///
    /// Only succeeds while this is the highest reservation and the key is not
    /// in doubt; otherwise the number is skipped.
    pub async fn release(mut self) {
        if self.key_in_doubt.is_set() {
            self.skip();
            return;
        }
        if let Some(metadata) = self.metadata.take() {
            release(metadata.as_ref(), &self.file_id, self.version).await;
        }
    }

    /// Keep the number reserved forever, leaving a gap in the history.
    pub fn skip(mut self) {
        if self.metadata.take().is_some() {
            tracing::warn!(
                file_id = %self.file_id,
                version = self.version,
                "Version number skipped"
            );
        }
    }
}

async fn release(metadata: &dyn MetadataStore, file_id: &str, version: Version) {
    match metadata.release_version(file_id, i64::from(version)).await {
        Ok(true) => tracing::debug!(file_id = %file_id, version, "Released reservation"),
        Ok(false) => {
            tracing::debug!(file_id = %file_id, version, "Reservation superseded, version skipped")
        }
        Err(e) => {
            tracing::warn!(file_id = %file_id, version, error = %e, "Failed to release reservation")
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let Some(metadata) = self.metadata.take() else {
            return;
        };
        if self.key_in_doubt.is_set() {
            tracing::warn!(file_id = %self.file_id, version = self.version, "Reservation dropped with blob key in doubt, version skipped");
            return;
        }
        let file_id = std::mem::take(&mut self.file_id);
        let version = self.version;
        match self.runtime_handle {
            Some(ref handle) => {
                handle.spawn(async move {
                    release(metadata.as_ref(), &file_id, version).await;
                });
            }
            None => {
                tracing::warn!(file_id = %file_id, version, "Reservation dropped without runtime handle, version will be skipped");
            }
        }
    }
}
