//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult, is_unique_violation};
use crate::models::{CommitOutcome, FileRow, FileVersionRow, IdempotencyRow};
use crate::repos::{FileRepo, IdempotencyRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: FileRepo + IdempotencyRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn new(path: impl AsRef<Path>, busy_timeout: Duration) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);

        // Single connection: transactions in this process never interleave.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::info!(path = %path.display(), "Opened SQLite metadata store");

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Insert an idempotency row unless the key exists. Returns whether it was inserted.
    async fn insert_idempotency(
        conn: &mut SqliteConnection,
        row: &IdempotencyRow,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            "INSERT INTO upload_requests (idempotency_key, result_json, created_at) VALUES (?, ?, ?) ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(&row.idempotency_key)
        .bind(&row.result_json)
        .bind(row.created_at)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_version(
        conn: &mut SqliteConnection,
        version: &FileVersionRow,
    ) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO file_versions (file_id, version, object_key, checksum, size_bytes, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&version.file_id)
        .bind(version.version)
        .bind(&version.object_key)
        .bind(&version.checksum)
        .bind(version.size_bytes)
        .bind(version.created_at)
        .execute(conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                MetadataError::AlreadyExists(format!(
                    "version {} of file {}",
                    version.version, version.file_id
                ))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    /// Read the row that beat us to an idempotency key.
    async fn winning_idempotency(&self, key: &str) -> MetadataResult<CommitOutcome> {
        match self.get_idempotency(key).await? {
            Some(row) => Ok(CommitOutcome::Duplicate(row)),
            None => Err(MetadataError::Internal(format!(
                "idempotency key {key} conflicted but no record was found"
            ))),
        }
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

#[async_trait]
impl FileRepo for SqliteStore {
    async fn create_file(
        &self,
        file: &FileRow,
        first_version: &FileVersionRow,
        idempotency: Option<&IdempotencyRow>,
    ) -> MetadataResult<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        if let Some(row) = idempotency
            && !Self::insert_idempotency(&mut tx, row).await?
        {
            tx.rollback().await?;
            return self.winning_idempotency(&row.idempotency_key).await;
        }

        sqlx::query(
            "INSERT INTO files (file_id, prefix, path, current_version, reserved_version, created_by, created_at, deleted) VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&file.file_id)
        .bind(&file.prefix)
        .bind(&file.path)
        .bind(file.current_version)
        .bind(file.reserved_version)
        .bind(&file.created_by)
        .bind(file.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                MetadataError::AlreadyExists(format!("file {}", file.file_id))
            } else {
                e.into()
            }
        })?;

        Self::insert_version(&mut tx, first_version).await?;

        tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }

    async fn get_file(&self, file_id: &str) -> MetadataResult<Option<FileRow>> {
        let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE file_id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn reserve_version(&self, file_id: &str) -> MetadataResult<i64> {
        // A single UPDATE takes SQLite's write lock for its duration.
        let reserved: Option<i64> = sqlx::query_scalar(
            "UPDATE files SET reserved_version = reserved_version + 1 WHERE file_id = ? AND deleted = 0 RETURNING reserved_version",
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?;

        reserved.ok_or_else(|| MetadataError::NotFound(format!("file {file_id}")))
    }

    async fn release_version(&self, file_id: &str, version: i64) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE files SET reserved_version = reserved_version - 1 WHERE file_id = ? AND reserved_version = ? AND current_version < ?",
        )
        .bind(file_id)
        .bind(version)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit_version(
        &self,
        version: &FileVersionRow,
        idempotency: Option<&IdempotencyRow>,
    ) -> MetadataResult<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        if let Some(row) = idempotency
            && !Self::insert_idempotency(&mut tx, row).await?
        {
            tx.rollback().await?;
            return self.winning_idempotency(&row.idempotency_key).await;
        }

        let deleted: Option<bool> =
            sqlx::query_scalar("SELECT deleted FROM files WHERE file_id = ?")
                .bind(&version.file_id)
                .fetch_optional(&mut *tx)
                .await?;
        if deleted != Some(false) {
            tx.rollback().await?;
            return Err(MetadataError::NotFound(format!("file {}", version.file_id)));
        }

        Self::insert_version(&mut tx, version).await?;

        sqlx::query(
            r#"
            UPDATE files SET
                path = CASE WHEN ? > current_version THEN ? ELSE path END,
                current_version = MAX(current_version, ?),
                reserved_version = MAX(reserved_version, ?)
            WHERE file_id = ?
            "#,
        )
        .bind(version.version)
        .bind(&version.object_key)
        .bind(version.version)
        .bind(version.version)
        .bind(&version.file_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }

    async fn get_version(
        &self,
        file_id: &str,
        version: i64,
    ) -> MetadataResult<Option<FileVersionRow>> {
        let row = sqlx::query_as::<_, FileVersionRow>(
            "SELECT * FROM file_versions WHERE file_id = ? AND version = ?",
        )
        .bind(file_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_versions(&self, file_id: &str) -> MetadataResult<Vec<FileVersionRow>> {
        let rows = sqlx::query_as::<_, FileVersionRow>(
            "SELECT * FROM file_versions WHERE file_id = ? ORDER BY version",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_deleted(&self, file_id: &str) -> MetadataResult<u64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE files SET deleted = 1 WHERE file_id = ? AND deleted = 0")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(MetadataError::NotFound(format!("file {file_id}")));
        }

        let removed = sqlx::query("DELETE FROM file_versions WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(removed)
    }
}

#[async_trait]
impl IdempotencyRepo for SqliteStore {
    async fn get_idempotency(&self, key: &str) -> MetadataResult<Option<IdempotencyRow>> {
        let row = sqlx::query_as::<_, IdempotencyRow>(
            "SELECT * FROM upload_requests WHERE idempotency_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_idempotency_if_absent(
        &self,
        row: &IdempotencyRow,
    ) -> MetadataResult<CommitOutcome> {
        let mut conn = self.pool.acquire().await?;
        if Self::insert_idempotency(&mut conn, row).await? {
            return Ok(CommitOutcome::Committed);
        }
        drop(conn);
        self.winning_idempotency(&row.idempotency_key).await
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    file_id TEXT PRIMARY KEY,
    prefix VARCHAR(1024) NOT NULL DEFAULT '',
    path VARCHAR(1024) NOT NULL,
    current_version INTEGER NOT NULL CHECK (current_version >= 1),
    reserved_version INTEGER NOT NULL,
    created_by VARCHAR(128),
    created_at TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    CHECK (reserved_version >= current_version)
);

CREATE TABLE IF NOT EXISTS file_versions (
    file_id TEXT NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
    version INTEGER NOT NULL CHECK (version >= 1),
    object_key VARCHAR(1024) NOT NULL,
    checksum TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (file_id, version)
);

CREATE TABLE IF NOT EXISTS upload_requests (
    idempotency_key VARCHAR(255) PRIMARY KEY,
    result_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;
