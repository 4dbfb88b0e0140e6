use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use vellum_metadata::{
    CommitOutcome, FileRepo, FileRow, FileVersionRow, IdempotencyRepo, IdempotencyRow,
    MetadataError, MetadataResult, MetadataStore,
};
use vellum_storage::{
    ByteStream, ObjectMeta, ObjectStore, StorageError, StorageResult, StreamingUpload,
};

const NEVER: usize = usize::MAX;

/// Notified when the paused call is reached, and the one the test notifies
/// to let it continue.
pub type Pause = (Arc<Notify>, Arc<Notify>);

/// Delegating store with injectable delete and write failures.
pub struct FaultyStore {
    inner: Arc<dyn ObjectStore>,
    failing_deletes: AtomicUsize,
    fail_next_upload_after: AtomicUsize,
    stall_next_finish: AtomicBool,
    delete_attempts: AtomicUsize,
    held_uploads: Mutex<VecDeque<Pause>>,
    paused_delete: Mutex<Option<Pause>>,
}

#[allow(dead_code)]
impl FaultyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            failing_deletes: AtomicUsize::new(0),
            fail_next_upload_after: AtomicUsize::new(NEVER),
            stall_next_finish: AtomicBool::new(false),
            delete_attempts: AtomicUsize::new(0),
            held_uploads: Mutex::new(VecDeque::new()),
            paused_delete: Mutex::new(None),
        }
    }

    /// Fail the next `n` deletes.
    pub fn fail_next_deletes(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    /// Make the next streaming upload fail after `writes` successful writes.
    pub fn fail_next_upload_after(&self, writes: usize) {
        self.fail_next_upload_after.store(writes, Ordering::SeqCst);
    }

    /// Make the next streaming upload's `finish()` never return.
    pub fn stall_next_finish(&self) {
        self.stall_next_finish.store(true, Ordering::SeqCst);
    }

    /// Hold a future `put_stream` call until resumed. Holds queue up, one
    /// per call, in call order.
    pub fn hold_next_upload(&self) -> Pause {
        let pause = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        self.held_uploads.lock().unwrap().push_back(pause.clone());
        pause
    }

    /// Hold the next delete until resumed.
    pub fn pause_next_delete(&self) -> Pause {
        let pause = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        *self.paused_delete.lock().unwrap() = Some(pause.clone());
        pause
    }

    pub fn delete_attempts(&self) -> usize {
        self.delete_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let held = self.held_uploads.lock().unwrap().pop_front();
        if let Some((entered, resume)) = held {
            entered.notify_one();
            resume.notified().await;
        }

        let upload = self.inner.put_stream(key).await?;
        let budget = self.fail_next_upload_after.swap(NEVER, Ordering::SeqCst);
        let stall_finish = self.stall_next_finish.swap(false, Ordering::SeqCst);
        if budget == NEVER && !stall_finish {
            return Ok(upload);
        }
        Ok(Box::new(FailingUpload {
            inner: upload,
            remaining: budget,
            stall_finish,
        }))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let paused = self.paused_delete.lock().unwrap().take();
        if let Some((entered, resume)) = paused {
            entered.notify_one();
            resume.notified().await;
        }

        self.delete_attempts.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Io(io::Error::other(format!(
                "injected delete failure for {key}"
            ))));
        }
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn bucket_exists(&self) -> StorageResult<bool> {
        self.inner.bucket_exists().await
    }

    async fn create_bucket(&self) -> StorageResult<()> {
        self.inner.create_bucket().await
    }

    fn backend_name(&self) -> &'static str {
        "faulty"
    }
}

/// Upload that fails once its write budget is spent, or never finishes.
struct FailingUpload {
    inner: Box<dyn StreamingUpload>,
    remaining: usize,
    stall_finish: bool,
}

#[async_trait]
impl StreamingUpload for FailingUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        if self.remaining == 0 {
            return Err(StorageError::Io(io::Error::other("injected write failure")));
        }
        self.remaining -= 1;
        self.inner.write(data).await
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        if self.stall_finish {
            std::future::pending::<()>().await;
        }
        self.inner.finish().await
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.inner.abort().await
    }
}

/// Delegating metadata store with injectable transient failures.
pub struct FlakyMetadata {
    inner: Arc<dyn MetadataStore>,
    failing_mark_deleted: AtomicUsize,
    mark_deleted_calls: AtomicUsize,
}

#[allow(dead_code)]
impl FlakyMetadata {
    pub fn new(inner: Arc<dyn MetadataStore>) -> Self {
        Self {
            inner,
            failing_mark_deleted: AtomicUsize::new(0),
            mark_deleted_calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` soft-deletes with a pool timeout.
    pub fn fail_next_mark_deleted(&self, n: usize) {
        self.failing_mark_deleted.store(n, Ordering::SeqCst);
    }

    pub fn mark_deleted_calls(&self) -> usize {
        self.mark_deleted_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataStore for FlakyMetadata {
    async fn migrate(&self) -> MetadataResult<()> {
        self.inner.migrate().await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        self.inner.health_check().await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

#[async_trait]
impl FileRepo for FlakyMetadata {
    async fn create_file(
        &self,
        file: &FileRow,
        first_version: &FileVersionRow,
        idempotency: Option<&IdempotencyRow>,
    ) -> MetadataResult<CommitOutcome> {
        self.inner.create_file(file, first_version, idempotency).await
    }

    async fn get_file(&self, file_id: &str) -> MetadataResult<Option<FileRow>> {
        self.inner.get_file(file_id).await
    }

    async fn reserve_version(&self, file_id: &str) -> MetadataResult<i64> {
        self.inner.reserve_version(file_id).await
    }

    async fn release_version(&self, file_id: &str, version: i64) -> MetadataResult<bool> {
        self.inner.release_version(file_id, version).await
    }

    async fn commit_version(
        &self,
        version: &FileVersionRow,
        idempotency: Option<&IdempotencyRow>,
    ) -> MetadataResult<CommitOutcome> {
        self.inner.commit_version(version, idempotency).await
    }

    async fn get_version(
        &self,
        file_id: &str,
        version: i64,
    ) -> MetadataResult<Option<FileVersionRow>> {
        self.inner.get_version(file_id, version).await
    }

    async fn list_versions(&self, file_id: &str) -> MetadataResult<Vec<FileVersionRow>> {
        self.inner.list_versions(file_id).await
    }

    async fn mark_deleted(&self, file_id: &str) -> MetadataResult<u64> {
        self.mark_deleted_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failing_mark_deleted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MetadataError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.mark_deleted(file_id).await
    }
}

#[async_trait]
impl IdempotencyRepo for FlakyMetadata {
    async fn get_idempotency(&self, key: &str) -> MetadataResult<Option<IdempotencyRow>> {
        self.inner.get_idempotency(key).await
    }

    async fn insert_idempotency_if_absent(
        &self,
        row: &IdempotencyRow,
    ) -> MetadataResult<CommitOutcome> {
        self.inner.insert_idempotency_if_absent(row).await
    }
}
