//! Metadata store test utilities.

use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use time::OffsetDateTime;
use vellum_core::FileId;
use vellum_metadata::{
    FileRow, FileVersionRow, IdempotencyRow, MetadataError, MetadataResult, MetadataStore,
    PostgresStore, SqliteStore,
};

/// Stable prefix for Docker/container startup failures in Postgres test setup.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// A SQLite-backed test store that cleans up on drop.
#[allow(dead_code)]
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    pub(crate) sqlite_store: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

impl TestMetadata {
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let store = SqliteStore::new(temp_dir.path().join("test.db"), Duration::from_secs(5)).await?;
        let arc_store = Arc::new(store);

        Ok(Self {
            store: arc_store.clone(),
            sqlite_store: arc_store,
            _temp_dir: temp_dir,
        })
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    #[allow(dead_code)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite_store.pool()
    }
}

/// PostgreSQL test store backed by a testcontainer.
#[allow(dead_code)]
pub struct PostgresTestMetadata {
    pub store: Arc<dyn MetadataStore>,
    _container: ContainerAsync<Postgres>,
}

impl PostgresTestMetadata {
    pub async fn new() -> MetadataResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                MetadataError::Internal(format!(
                    "{POSTGRES_CONTAINER_START_ERR_PREFIX} Failed to start PostgreSQL container: {e}"
                ))
            })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let store = PostgresStore::from_url(&url, 5, None).await?;

        Ok(Self {
            store: Arc::new(store),
            _container: container,
        })
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }
}

/// Run a test against both SQLite and PostgreSQL backends.
#[allow(dead_code)]
pub async fn run_metadata_test_both<F, Fut>(test_fn: F)
where
    F: Fn(Arc<dyn MetadataStore>) -> Fut + Clone,
    Fut: std::future::Future<Output = ()>,
{
    let sqlite = TestMetadata::new()
        .await
        .expect("Failed to create SQLite test metadata");
    test_fn.clone()(sqlite.store()).await;

    if std::env::var("SKIP_POSTGRES_TESTS").is_err() {
        match PostgresTestMetadata::new().await {
            Ok(postgres) => test_fn(postgres.store()).await,
            Err(err) => eprintln!("Skipping PostgreSQL metadata tests: {err}"),
        }
    }
}

/// A fresh file row at version 1 plus its version row.
#[allow(dead_code)]
pub fn new_file(prefix: &str) -> (FileRow, FileVersionRow) {
    let file_id = FileId::new().to_string();
    let object_key = if prefix.is_empty() {
        format!("{file_id}/v1")
    } else {
        format!("{prefix}/{file_id}/v1")
    };
    let now = OffsetDateTime::now_utc();

    let file = FileRow {
        file_id: file_id.clone(),
        prefix: prefix.to_string(),
        path: object_key.clone(),
        current_version: 1,
        reserved_version: 1,
        created_by: Some("tester".to_string()),
        created_at: now,
        deleted: false,
    };
    let version = FileVersionRow {
        file_id,
        version: 1,
        object_key,
        checksum: "00".repeat(32),
        size_bytes: 0,
        created_at: now,
    };
    (file, version)
}

/// A version row for `file` at `version`.
#[allow(dead_code)]
pub fn version_row(file: &FileRow, version: i64) -> FileVersionRow {
    FileVersionRow {
        file_id: file.file_id.clone(),
        version,
        object_key: format!("{}/{}/v{version}", file.prefix, file.file_id),
        checksum: format!("{version:064x}"),
        size_bytes: version * 10,
        created_at: OffsetDateTime::now_utc(),
    }
}

#[allow(dead_code)]
pub fn idempotency_row(key: &str, result_json: &str) -> IdempotencyRow {
    IdempotencyRow {
        idempotency_key: key.to_string(),
        result_json: result_json.to_string(),
        created_at: OffsetDateTime::now_utc(),
    }
}
