//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult, is_unique_violation};
use crate::models::{CommitOutcome, FileRow, FileVersionRow, IdempotencyRow};
use crate::repos::{FileRepo, IdempotencyRepo};
use crate::store::MetadataStore;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{PgConnection, Pool, Postgres};
use std::str::FromStr;
use vellum_core::config::PgSslMode;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// Lets the password come from its own environment variable instead of
    /// being embedded in a URL.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }
        if let Some(pass) = password {
            opts = opts.password(pass);
        }
        if let Some(mode) = ssl_mode {
            opts = opts.ssl_mode(match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            });
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Insert an idempotency row unless the key exists. Returns whether it was inserted.
    ///
    /// A concurrent uncommitted insert of the same key blocks this statement
    /// until that transaction ends.
    async fn insert_idempotency(
        conn: &mut PgConnection,
        row: &IdempotencyRow,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            "INSERT INTO upload_requests (idempotency_key, result_json, created_at) VALUES ($1, $2, $3) ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(&row.idempotency_key)
        .bind(&row.result_json)
        .bind(row.created_at)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_version(
        conn: &mut PgConnection,
        version: &FileVersionRow,
    ) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO file_versions (file_id, version, object_key, checksum, size_bytes, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
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
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements cannot hold several commands.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

#[async_trait]
impl FileRepo for PostgresStore {
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
            "INSERT INTO files (file_id, prefix, path, current_version, reserved_version, created_by, created_at, deleted) VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE)",
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
        let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE file_id = $1")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn reserve_version(&self, file_id: &str) -> MetadataResult<i64> {
        let mut tx = self.pool.begin().await?;

        let reserved: Option<(i64, bool)> = sqlx::query_as(
            "SELECT reserved_version, deleted FROM files WHERE file_id = $1 FOR UPDATE",
        )
        .bind(file_id)
        .fetch_optional(&mut *tx)
        .await?;

        let next = match reserved {
            Some((reserved, false)) => reserved + 1,
            _ => {
                tx.rollback().await?;
                return Err(MetadataError::NotFound(format!("file {file_id}")));
            }
        };

        sqlx::query("UPDATE files SET reserved_version = $1 WHERE file_id = $2")
            .bind(next)
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(next)
    }

    async fn release_version(&self, file_id: &str, version: i64) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE files SET reserved_version = reserved_version - 1 WHERE file_id = $1 AND reserved_version = $2 AND current_version < $2",
        )
        .bind(file_id)
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
            sqlx::query_scalar("SELECT deleted FROM files WHERE file_id = $1 FOR UPDATE")
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
                path = CASE WHEN $1 > current_version THEN $2 ELSE path END,
                current_version = GREATEST(current_version, $1),
                reserved_version = GREATEST(reserved_version, $1)
            WHERE file_id = $3
            "#,
        )
        .bind(version.version)
        .bind(&version.object_key)
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
            "SELECT * FROM file_versions WHERE file_id = $1 AND version = $2",
        )
        .bind(file_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_versions(&self, file_id: &str) -> MetadataResult<Vec<FileVersionRow>> {
        let rows = sqlx::query_as::<_, FileVersionRow>(
            "SELECT * FROM file_versions WHERE file_id = $1 ORDER BY version",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_deleted(&self, file_id: &str) -> MetadataResult<u64> {
        let mut tx = self.pool.begin().await?;

        let result =
            sqlx::query("UPDATE files SET deleted = TRUE WHERE file_id = $1 AND deleted = FALSE")
                .bind(file_id)
                .execute(&mut *tx)
                .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(MetadataError::NotFound(format!("file {file_id}")));
        }

        let removed = sqlx::query("DELETE FROM file_versions WHERE file_id = $1")
            .bind(file_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(removed)
    }
}

#[async_trait]
impl IdempotencyRepo for PostgresStore {
    async fn get_idempotency(&self, key: &str) -> MetadataResult<Option<IdempotencyRow>> {
        let row = sqlx::query_as::<_, IdempotencyRow>(
            "SELECT * FROM upload_requests WHERE idempotency_key = $1",
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
