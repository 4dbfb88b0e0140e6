//! The repository facade: create, add-version, resolve, open and delete.

use crate::coordinator::{BlobCoordinator, DeletionWarning};
use crate::error::{RepositoryError, RepositoryResult};
use crate::idempotency::{CachedResult, IdempotencyCache, pending_row};
use crate::sequencer::{Reservation, RetryPolicy, VersionSequencer};
use crate::streamer::{ContentStreamer, KeyInDoubt, StreamSummary};
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;
use vellum_core::config::{AppConfig, RepositoryConfig};
use vellum_core::{
    FIRST_VERSION, FileId, IdempotencyKey, ObjectKey, UploadReceipt, Version, sanitize_segments,
};
use vellum_metadata::{CommitOutcome, FileRow, FileVersionRow, MetadataError, MetadataStore};
use vellum_storage::{ByteStream, ObjectStore};

/// Maximum length of the `created_by` principal.
pub const MAX_CREATED_BY_LEN: usize = 128;

/// Request to create a new file.
#[derive(Clone, Debug, Default)]
pub struct CreateFile {
    /// Namespace segments. Sanitized before use.
    pub dir: Vec<String>,
    pub idempotency_key: Option<IdempotencyKey>,
    /// Principal the caller authenticated. Informational only.
    pub created_by: Option<String>,
}

/// Request to add a version to an existing file.
#[derive(Clone, Debug, Default)]
pub struct AddVersion {
    pub idempotency_key: Option<IdempotencyKey>,
}

/// Result of an upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadOutcome {
    pub receipt: UploadReceipt,
    /// Exact JSON returned to the client.
    pub payload: String,
    /// The result was recorded by an earlier request with the same key.
    pub replayed: bool,
}

impl UploadOutcome {
    fn replay(cached: CachedResult) -> Self {
        Self {
            receipt: cached.receipt,
            payload: cached.payload,
            replayed: true,
        }
    }
}

/// A committed version, as seen by readers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolvedVersion {
    pub file_id: String,
    pub version: Version,
    pub object_key: String,
    pub checksum: String,
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ResolvedVersion {
    /// Name offered to clients downloading this version.
    pub fn download_name(&self) -> String {
        format!("{}_v{}", self.file_id, self.version)
    }

    /// Entity tag for conditional requests.
    pub fn etag(&self) -> &str {
        &self.checksum
    }

    fn from_row(row: FileVersionRow) -> RepositoryResult<Self> {
        let version = Version::try_from(row.version).map_err(|_| {
            RepositoryError::MetadataTransaction(format!(
                "file {} has out-of-range version {}",
                row.file_id, row.version
            ))
        })?;
        let size = u64::try_from(row.size_bytes).map_err(|_| {
            RepositoryError::MetadataTransaction(format!(
                "version {version} of file {} has negative size",
                row.file_id
            ))
        })?;
        Ok(Self {
            file_id: row.file_id,
            version,
            object_key: row.object_key,
            checksum: row.checksum,
            size,
            created_at: row.created_at,
        })
    }
}

/// Outcome of deleting a file.
#[derive(Clone, Debug, Serialize)]
pub struct DeleteReport {
    pub file_id: String,
    pub versions_removed: u64,
    /// Blobs that could not be removed and are now orphaned.
    pub warnings: Vec<DeletionWarning>,
}

/// Versioned file repository.
///
/// Blobs are written before the metadata that references them, and the
/// current-version pointer only moves inside the metadata transaction that
/// inserts the version row. All methods take `&self`; share it behind an
/// `Arc`.
pub struct Repository {
    metadata: Arc<dyn MetadataStore>,
    coordinator: BlobCoordinator,
    idempotency: IdempotencyCache,
    sequencer: VersionSequencer,
    retry: RetryPolicy,
    server_name: String,
}

impl Repository {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        store: Arc<dyn ObjectStore>,
        config: &RepositoryConfig,
    ) -> Self {
        let retry = RetryPolicy::from_config(config);
        Self {
            coordinator: BlobCoordinator::new(store, ContentStreamer::from_config(config)),
            idempotency: IdempotencyCache::new(metadata.clone()),
            sequencer: VersionSequencer::new(metadata.clone(), retry.clone()),
            retry,
            metadata,
            server_name: config.server_name.clone(),
        }
    }

    /// Open the configured metadata and blob stores.
    pub async fn from_config(config: &AppConfig) -> RepositoryResult<Self> {
        config.validate().map_err(RepositoryError::Validation)?;

        let metadata = vellum_metadata::from_config(&config.metadata).await?;
        let store = vellum_storage::from_config(&config.storage)
            .await
            .map_err(|e| RepositoryError::StorageWrite(format!("opening blob store: {e}")))?;

        let repository = Self::new(metadata, store, &config.repository);
        if config.repository.ensure_bucket {
            repository.ensure_bucket().await?;
        }
        tracing::info!(
            metadata = repository.metadata.backend_name(),
            storage = repository.coordinator.store().backend_name(),
            "Repository ready"
        );
        Ok(repository)
    }

    /// Create the bucket or storage root if it is missing.
    pub async fn ensure_bucket(&self) -> RepositoryResult<bool> {
        self.coordinator.ensure_bucket().await
    }

    /// Check connectivity of both stores.
    pub async fn health_check(&self) -> RepositoryResult<()> {
        self.metadata.health_check().await?;
        self.coordinator
            .store()
            .health_check()
            .await
            .map_err(|e| RepositoryError::StorageRead(format!("blob store health check: {e}")))
    }

    /// Create a file whose version 1 is `body`.
    #[instrument(skip(self, body), fields(file_id = tracing::field::Empty))]
    pub async fn create_file<S>(&self, request: CreateFile, body: S) -> RepositoryResult<UploadOutcome>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        if let Some(created_by) = &request.created_by
            && (created_by.len() > MAX_CREATED_BY_LEN || created_by.chars().any(char::is_control))
        {
            return Err(RepositoryError::Validation(format!(
                "created_by must be at most {MAX_CREATED_BY_LEN} printable bytes"
            )));
        }

        if let Some(key) = &request.idempotency_key
            && let Some(cached) = self.idempotency.lookup(key).await?
        {
            tracing::info!(file_id = %cached.receipt.file_id, "Replaying recorded create");
            return Ok(UploadOutcome::replay(cached));
        }

        let file_id = FileId::new().to_string();
        tracing::Span::current().record("file_id", file_id.as_str());
        let prefix = sanitize_segments(&request.dir)?;
        let key = ObjectKey::for_version(&[prefix.as_str()], &file_id, FIRST_VERSION)?;

        let summary = self
            .coordinator
            .put(&key, body, &KeyInDoubt::default())
            .await?;
        let receipt = self.receipt(&file_id, &key, FIRST_VERSION, &summary);
        let now = OffsetDateTime::now_utc();
        let (payload, version) = match receipt
            .to_json()
            .map_err(RepositoryError::from)
            .and_then(|payload| {
                version_row(&file_id, FIRST_VERSION, &key, &summary, now).map(|v| (payload, v))
            }) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.coordinator.remove(key.as_str()).await;
                return Err(e);
            }
        };

        let file = FileRow {
            file_id: file_id.clone(),
            prefix,
            path: key.to_string(),
            current_version: i64::from(FIRST_VERSION),
            reserved_version: i64::from(FIRST_VERSION),
            created_by: request.created_by.clone(),
            created_at: now,
            deleted: false,
        };
        let idempotency = request
            .idempotency_key
            .as_ref()
            .map(|k| pending_row(k, &payload));

        match self
            .sequencer
            .create_file(&file, &version, idempotency.as_ref())
            .await
        {
            Ok(CommitOutcome::Committed) => {
                tracing::info!(key = %key, size = summary.size, "Created file");
                Ok(UploadOutcome {
                    receipt,
                    payload,
                    replayed: false,
                })
            }
            Ok(CommitOutcome::Duplicate(winner)) => {
                self.coordinator.remove(key.as_str()).await;
                let cached = CachedResult::from_row(&winner)?;
                tracing::info!(winner = %cached.receipt.file_id, "Lost idempotent create race");
                Ok(UploadOutcome::replay(cached))
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Create did not commit, blob left in place");
                Err(e)
            }
        }
    }

    /// Store `body` as the next version of `file_id`.
    #[instrument(skip(self, body), fields(file_id = %file_id, version = tracing::field::Empty))]
    pub async fn add_version<S>(
        &self,
        file_id: &FileId,
        request: AddVersion,
        body: S,
    ) -> RepositoryResult<UploadOutcome>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let id = file_id.to_string();

        if let Some(key) = &request.idempotency_key
            && let Some(cached) = self.idempotency.lookup(key).await?
        {
            return replay_for(&id, key, cached);
        }

        let file = self.live_file(&id).await?;
        let mut reservation = self.sequencer.next_version(file_id).await?;
        let version = reservation.version();
        tracing::Span::current().record("version", version);

        let key = match ObjectKey::for_version(&[file.prefix.as_str()], &id, version) {
            Ok(key) => key,
            Err(e) => {
                reservation.release().await;
                return Err(e.into());
            }
        };

        let in_doubt = reservation.key_in_doubt().clone();
        let summary = match self.coordinator.put(&key, body, &in_doubt).await {
            Ok(summary) => summary,
            Err(e) => {
                reservation.release().await;
                return Err(e);
            }
        };

        let receipt = self.receipt(&id, &key, version, &summary);
        let (payload, row) = match receipt
            .to_json()
            .map_err(RepositoryError::from)
            .and_then(|payload| {
                version_row(&id, version, &key, &summary, OffsetDateTime::now_utc())
                    .map(|row| (payload, row))
            }) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.abandon(&key, reservation).await;
                return Err(e);
            }
        };
        let idempotency = request
            .idempotency_key
            .as_ref()
            .map(|k| pending_row(k, &payload));

        match self
            .sequencer
            .advance_current(&mut reservation, &row, idempotency.as_ref())
            .await
        {
            Ok(CommitOutcome::Committed) => {
                tracing::info!(key = %key, size = summary.size, "Added version");
                Ok(UploadOutcome {
                    receipt,
                    payload,
                    replayed: false,
                })
            }
            Ok(CommitOutcome::Duplicate(winner)) => {
                self.abandon(&key, reservation).await;
                let cached = CachedResult::from_row(&winner)?;
                match request.idempotency_key.as_ref() {
                    Some(token) => replay_for(&id, token, cached),
                    None => Ok(UploadOutcome::replay(cached)),
                }
            }
            Err(e @ RepositoryError::NotFound(_)) => {
                self.abandon(&key, reservation).await;
                Err(e)
            }
            Err(e) => {
                // The commit may have landed; its blob must stay.
                tracing::warn!(key = %key, error = %e, "Commit outcome unknown, blob left in place");
                reservation.skip();
                Err(e)
            }
        }
    }

    /// Look up a version of a file; the current one when `version` is `None`.
    pub async fn resolve(
        &self,
        file_id: &FileId,
        version: Option<Version>,
    ) -> RepositoryResult<ResolvedVersion> {
        let id = file_id.to_string();
        let file = self.live_file(&id).await?;
        let version = match version {
            Some(v) => v,
            None => Version::try_from(file.current_version).map_err(|_| {
                RepositoryError::MetadataTransaction(format!(
                    "file {id} has out-of-range current version {}",
                    file.current_version
                ))
            })?,
        };

        let row = self
            .metadata
            .get_version(&id, i64::from(version))
            .await?
            .ok_or_else(|| RepositoryError::VersionNotFound {
                file_id: id.clone(),
                version,
            })?;
        ResolvedVersion::from_row(row)
    }

    /// Resolve a version and open its bytes.
    #[instrument(skip(self), fields(file_id = %file_id))]
    pub async fn open(
        &self,
        file_id: &FileId,
        version: Option<Version>,
    ) -> RepositoryResult<(ResolvedVersion, ByteStream)> {
        let resolved = self.resolve(file_id, version).await?;
        let stream = self.coordinator.get_stream(&resolved.object_key).await?;
        Ok((resolved, stream))
    }

    /// All versions of a file, oldest first.
    pub async fn list_versions(&self, file_id: &FileId) -> RepositoryResult<Vec<ResolvedVersion>> {
        let id = file_id.to_string();
        self.live_file(&id).await?;
        self.metadata
            .list_versions(&id)
            .await?
            .into_iter()
            .map(ResolvedVersion::from_row)
            .collect()
    }

    /// Remove every blob of a file, then soft-delete it.
    ///
    /// Blob removal failures are reported as warnings and do not stop the
    /// delete.
    #[instrument(skip(self), fields(file_id = %file_id))]
    pub async fn delete_file(&self, file_id: &FileId) -> RepositoryResult<DeleteReport> {
        let id = file_id.to_string();
        self.live_file(&id).await?;

        let keys: Vec<String> = self
            .metadata
            .list_versions(&id)
            .await?
            .into_iter()
            .map(|row| row.object_key)
            .collect();
        let warnings = self.coordinator.remove_all(&keys).await;

        let key = id.as_str();
        let versions_removed = self
            .retry
            .run("mark_deleted", move || self.metadata.mark_deleted(key))
            .await
            .map_err(|e| match e {
                MetadataError::NotFound(_) => RepositoryError::NotFound(id.clone()),
                other => other.into(),
            })?;

        if warnings.is_empty() {
            tracing::info!(versions_removed, "Deleted file");
        } else {
            tracing::warn!(
                versions_removed,
                orphaned = warnings.len(),
                "Deleted file, some blobs could not be removed"
            );
        }
        Ok(DeleteReport {
            file_id: id,
            versions_removed,
            warnings,
        })
    }

    /// Remove a blob no version row references, then give its number back.
    ///
    /// The number is skipped instead when the blob could not be removed, so
    /// the key is never handed to another writer while stale bytes sit there.
    async fn abandon(&self, key: &ObjectKey, reservation: Reservation) {
        if self.coordinator.remove(key.as_str()).await {
            reservation.release().await;
        } else {
            reservation.skip();
        }
    }

    async fn live_file(&self, file_id: &str) -> RepositoryResult<FileRow> {
        match self.metadata.get_file(file_id).await? {
            Some(file) if !file.deleted => Ok(file),
            _ => Err(RepositoryError::NotFound(file_id.to_string())),
        }
    }

    fn receipt(
        &self,
        file_id: &str,
        key: &ObjectKey,
        version: Version,
        summary: &StreamSummary,
    ) -> UploadReceipt {
        UploadReceipt {
            file_id: file_id.to_string(),
            path: key.to_string(),
            version,
            checksum: summary.checksum.to_hex(),
            size: summary.size,
            server: self.server_name.clone(),
        }
    }
}

fn version_row(
    file_id: &str,
    version: Version,
    key: &ObjectKey,
    summary: &StreamSummary,
    created_at: OffsetDateTime,
) -> RepositoryResult<FileVersionRow> {
    let size_bytes = i64::try_from(summary.size).map_err(|_| {
        RepositoryError::Validation(format!(
            "blob of {} bytes exceeds the recordable size",
            summary.size
        ))
    })?;
    Ok(FileVersionRow {
        file_id: file_id.to_string(),
        version: i64::from(version),
        object_key: key.to_string(),
        checksum: summary.checksum.to_hex(),
        size_bytes,
        created_at,
    })
}

/// Replay a recorded add-version result, unless it belongs to another file.
fn replay_for(
    file_id: &str,
    key: &IdempotencyKey,
    cached: CachedResult,
) -> RepositoryResult<UploadOutcome> {
    if cached.receipt.file_id != file_id {
        return Err(RepositoryError::Conflict(format!(
            "idempotency key {key} was used for file {}",
            cached.receipt.file_id
        )));
    }
    tracing::info!(version = cached.receipt.version, "Replaying recorded upload");
    Ok(UploadOutcome::replay(cached))
}
