//! Hash-while-streaming writes into a blob sink.

use crate::error::{RepositoryError, RepositoryResult};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use vellum_core::config::RepositoryConfig;
use vellum_core::{ContentHash, ContentHasher};
use vellum_storage::{StorageResult, StreamingUpload};

/// Checksum and length of a completed write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSummary {
    pub checksum: ContentHash,
    pub size: u64,
}

/// Set while a sink's `finish()` may still land the blob at its key.
///
/// A `finish()` that timed out or was dropped can complete later, so the key
/// must not be handed to another writer while this is set.
#[derive(Clone, Debug, Default)]
pub struct KeyInDoubt(Arc<AtomicBool>);

impl KeyInDoubt {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, value: bool) {
        self.0.store(value, Ordering::Release);
    }
}

/// Streams a request body into a [`StreamingUpload`], hashing as it goes.
///
/// Writes handed to the sink never exceed `chunk_size`. Nothing is buffered
/// beyond the chunk in flight.
#[derive(Clone, Debug)]
pub struct ContentStreamer {
    chunk_size: usize,
    write_timeout: Option<Duration>,
}

impl ContentStreamer {
    pub fn new(chunk_size: usize, write_timeout: Option<Duration>) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            write_timeout,
        }
    }

    pub fn from_config(config: &RepositoryConfig) -> Self {
        Self::new(config.stream_chunk_size, config.blob_write_timeout())
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Copy `body` into `sink` and finish it.
    ///
    /// Any body or sink error aborts the sink and yields `StorageWrite`. If
    /// the returned future is dropped before completion the sink is aborted
    /// in the background. `in_doubt` is left set when `finish()` fails or
    /// never returns.
    pub async fn stream_into<S>(
        &self,
        key: &str,
        body: S,
        sink: Box<dyn StreamingUpload>,
        in_doubt: &KeyInDoubt,
    ) -> RepositoryResult<StreamSummary>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let mut guard = UploadGuard::new(key, sink);
        let mut hasher = ContentHasher::default();
        let mut size = 0u64;
        let mut body = std::pin::pin!(body);

        while let Some(next) = body.next().await {
            let mut data = match next {
                Ok(data) => data,
                Err(e) => {
                    guard.abort().await;
                    return Err(RepositoryError::StorageWrite(format!(
                        "reading upload body for {key}: {e}"
                    )));
                }
            };

            while !data.is_empty() {
                let chunk = data.split_to(data.len().min(self.chunk_size));
                hasher.update(&chunk);
                size += chunk.len() as u64;

                let len = chunk.len();
                let result = match guard.upload.as_mut() {
                    Some(upload) => self.timed(upload.write(chunk)).await,
                    None => Ok(()),
                };
                if let Err(e) = result {
                    guard.abort().await;
                    return Err(RepositoryError::StorageWrite(format!(
                        "writing {len} bytes to {key}: {e}"
                    )));
                }
            }
        }

        in_doubt.set(true);
        let written = match guard.upload.take() {
            Some(upload) => self.timed(upload.finish()).await,
            None => Ok(size),
        }
        .map_err(|e| RepositoryError::StorageWrite(format!("finishing {key}: {e}")))?;
        in_doubt.set(false);

        if written != size {
            tracing::warn!(key = %key, written, size, "Sink reported a different byte count");
        }

        Ok(StreamSummary {
            checksum: hasher.finalize(),
            size,
        })
    }

    async fn timed<T>(
        &self,
        fut: impl Future<Output = StorageResult<T>>,
    ) -> Result<T, String> {
        match self.write_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("timed out after {}s", limit.as_secs_f64())),
            },
            None => fut.await.map_err(|e| e.to_string()),
        }
    }
}

/// Aborts the wrapped upload on drop unless it was taken for `finish()`.
struct UploadGuard {
    key: String,
    upload: Option<Box<dyn StreamingUpload>>,
    runtime_handle: Option<tokio::runtime::Handle>,
}

impl UploadGuard {
    fn new(key: &str, upload: Box<dyn StreamingUpload>) -> Self {
        Self {
            key: key.to_string(),
            upload: Some(upload),
            runtime_handle: tokio::runtime::Handle::try_current().ok(),
        }
    }

    async fn abort(&mut self) {
        if let Some(upload) = self.upload.take()
            && let Err(e) = upload.abort().await
        {
            tracing::warn!(key = %self.key, error = %e, "Failed to abort blob upload");
        }
    }
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        let Some(upload) = self.upload.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        match self.runtime_handle {
            Some(ref handle) => {
                handle.spawn(async move {
                    match upload.abort().await {
                        Ok(()) => tracing::info!(key = %key, "Aborted orphaned blob upload"),
                        Err(e) => {
                            tracing::error!(key = %key, error = %e, "Failed to abort orphaned blob upload")
                        }
                    }
                });
            }
            None => {
                tracing::warn!(key = %key, "Upload guard dropped without runtime handle, partial blob may remain");
            }
        }
    }
}
