//! Blob store coordination: streaming writes, reads and best-effort removal.

use crate::error::{RepositoryError, RepositoryResult};
use crate::streamer::{ContentStreamer, KeyInDoubt, StreamSummary};
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use tracing::instrument;
use vellum_core::ObjectKey;
use vellum_storage::{ByteStream, ObjectStore};

/// A blob that could not be removed. Reported, never fatal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeletionWarning {
    pub key: String,
    pub message: String,
}

/// Wraps an [`ObjectStore`] with the repository's error semantics.
///
/// The store is only ever trusted for bytes. A blob is always fully written
/// before any metadata references it, so a crash leaves at worst an
/// unreferenced blob.
pub struct BlobCoordinator {
    store: Arc<dyn ObjectStore>,
    streamer: ContentStreamer,
}

impl BlobCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>, streamer: ContentStreamer) -> Self {
        Self { store, streamer }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Stream `body` into a new blob at `key`.
    #[instrument(skip(self, key, body, in_doubt), fields(backend = self.store.backend_name(), key = %key))]
    pub async fn put<S>(
        &self,
        key: &ObjectKey,
        body: S,
        in_doubt: &KeyInDoubt,
    ) -> RepositoryResult<StreamSummary>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let sink = self
            .store
            .put_stream(key.as_str())
            .await
            .map_err(|e| RepositoryError::StorageWrite(format!("opening {key}: {e}")))?;

        let summary = self
            .streamer
            .stream_into(key.as_str(), body, sink, in_doubt)
            .await?;
        tracing::debug!(size = summary.size, checksum = %summary.checksum, "Blob written");
        Ok(summary)
    }

    /// Open a committed blob for reading.
    ///
    /// A missing blob here means metadata references bytes that are gone,
    /// which is reported as `StorageRead` rather than `NotFound`.
    #[instrument(skip(self), fields(backend = self.store.backend_name()))]
    pub async fn get_stream(&self, key: &str) -> RepositoryResult<ByteStream> {
        self.store.get_stream(key).await.map_err(|e| {
            if e.is_not_found() {
                tracing::error!(key = %key, "Blob referenced by metadata is missing");
                RepositoryError::StorageRead(format!("blob {key} is missing"))
            } else {
                RepositoryError::StorageRead(format!("reading {key}: {e}"))
            }
        })
    }

    /// Remove a blob. A blob that is already gone counts as removed.
    pub async fn try_remove(&self, key: &str) -> Result<(), DeletionWarning> {
        match self.store.delete(key).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to remove blob");
                Err(DeletionWarning {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Best-effort removal. Returns whether the blob is gone.
    pub async fn remove(&self, key: &str) -> bool {
        self.try_remove(key).await.is_ok()
    }

    /// Attempt removal of every key, continuing past failures.
    pub async fn remove_all<I, K>(&self, keys: I) -> Vec<DeletionWarning>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut warnings = Vec::new();
        for key in keys {
            if let Err(warning) = self.try_remove(key.as_ref()).await {
                warnings.push(warning);
            }
        }
        warnings
    }

    /// Create the bucket or storage root if it is missing.
    #[instrument(skip(self), fields(backend = self.store.backend_name()))]
    pub async fn ensure_bucket(&self) -> RepositoryResult<bool> {
        let created = self
            .store
            .ensure_bucket()
            .await
            .map_err(|e| RepositoryError::StorageWrite(format!("ensuring bucket: {e}")))?;
        if created {
            tracing::info!("Created missing bucket");
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use vellum_storage::FilesystemBackend;

    async fn coordinator(dir: &std::path::Path) -> BlobCoordinator {
        let store = FilesystemBackend::new(dir).await.unwrap();
        BlobCoordinator::new(Arc::new(store), ContentStreamer::new(4, None))
    }

    #[tokio::test]
    async fn test_put_then_stream_back() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;
        let key = ObjectKey::for_version(&["docs"], "f", 1).unwrap();

        let body = futures::stream::iter(vec![Ok(Bytes::from_static(b"contents"))]);
        let summary = coordinator
            .put(&key, body, &KeyInDoubt::default())
            .await
            .unwrap();
        assert_eq!(summary.size, 8);

        let read: Vec<Bytes> = coordinator
            .get_stream(key.as_str())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(read.concat(), b"contents");
    }

    #[tokio::test]
    async fn test_missing_blob_is_storage_read() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;

        let err = coordinator.get_stream("docs/f/v9").await.err().unwrap();
        assert_eq!(err.code(), "storage_read_error");
    }

    #[tokio::test]
    async fn test_remove_missing_counts_as_removed() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;

        assert!(coordinator.remove("docs/f/v1").await);
        assert!(coordinator.remove_all(["a/v1", "b/v1"]).await.is_empty());
    }
}
