//! Repository test utilities.

pub mod mocks;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use sqlx::{Pool, Sqlite};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vellum_core::config::RepositoryConfig;
use vellum_metadata::{MetadataStore, SqliteStore};
use vellum_repository::Repository;
use vellum_storage::{ByteStream, FilesystemBackend};

pub use mocks::{FaultyStore, FlakyMetadata};

/// Chunk size used by test repositories, small enough that every body spans
/// several sink writes.
pub const TEST_CHUNK_SIZE: usize = 1024;

/// A repository over SQLite and a filesystem blob root in a temp directory.
#[allow(dead_code)]
pub struct TestRepository {
    pub repo: Arc<Repository>,
    pub metadata: Arc<dyn MetadataStore>,
    pub store: Arc<FaultyStore>,
    pub flaky: Arc<FlakyMetadata>,
    sqlite: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestRepository {
    pub async fn new() -> Self {
        Self::with_config(Self::config()).await
    }

    /// Defaults used by [`TestRepository::new`].
    pub fn config() -> RepositoryConfig {
        RepositoryConfig {
            server_name: "test-node".to_string(),
            stream_chunk_size: TEST_CHUNK_SIZE,
            commit_retry_backoff_ms: 5,
            ..RepositoryConfig::default()
        }
    }

    pub async fn with_config(config: RepositoryConfig) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let sqlite = Arc::new(
            SqliteStore::new(temp_dir.path().join("meta.db"), Duration::from_secs(5))
                .await
                .expect("Failed to open SQLite store"),
        );
        let backend = FilesystemBackend::new(temp_dir.path().join("blobs"))
            .await
            .expect("Failed to create filesystem backend");
        let store = Arc::new(FaultyStore::new(Arc::new(backend)));

        let flaky = Arc::new(FlakyMetadata::new(sqlite.clone()));
        let metadata: Arc<dyn MetadataStore> = flaky.clone();
        let repo = Arc::new(Repository::new(metadata.clone(), store.clone(), &config));

        Self {
            repo,
            metadata,
            store,
            flaky,
            sqlite,
            _temp_dir: temp_dir,
        }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite.pool()
    }

    /// Every blob key currently in the store.
    pub async fn blob_keys(&self) -> Vec<String> {
        use vellum_storage::ObjectStore;
        self.store.list("").await.expect("Failed to list blobs")
    }

    pub async fn count_rows(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.pool())
            .await
            .expect("Failed to count rows")
    }
}

/// Deterministic pseudo-random test data. Same seed, same bytes.
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Split `data` into an upload body of `part`-sized chunks.
#[allow(dead_code)]
pub fn body(data: Bytes, part: usize) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let parts: Vec<io::Result<Bytes>> = (0..data.len())
        .step_by(part.max(1))
        .map(|start| Ok(data.slice(start..(start + part).min(data.len()))))
        .collect();
    futures::stream::iter(parts)
}

#[allow(dead_code)]
pub async fn read_all(mut stream: ByteStream) -> Bytes {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.expect("Failed to read blob chunk"));
    }
    Bytes::from(out)
}
