//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Repository coordination settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Name reported in upload receipts (the `server` field).
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Maximum bytes handed to the blob sink per write.
    #[serde(default = "default_stream_chunk_size")]
    pub stream_chunk_size: usize,
    /// How many times a metadata commit is retried after a transient failure.
    #[serde(default = "default_max_commit_retries")]
    pub max_commit_retries: u32,
    /// Base delay between commit retries in milliseconds (doubled per attempt).
    #[serde(default = "default_commit_retry_backoff_ms")]
    pub commit_retry_backoff_ms: u64,
    /// Abort a blob write that takes longer than this many seconds (default: no limit).
    #[serde(default)]
    pub blob_write_timeout_secs: Option<u64>,
    /// Create the bucket (or storage root) on startup when it is missing.
    #[serde(default = "default_ensure_bucket")]
    pub ensure_bucket: bool,
}

fn default_server_name() -> String {
    "vellum".to_string()
}

fn default_stream_chunk_size() -> usize {
    crate::DEFAULT_STREAM_CHUNK_SIZE
}

fn default_max_commit_retries() -> u32 {
    3
}

fn default_commit_retry_backoff_ms() -> u64 {
    50
}

fn default_ensure_bucket() -> bool {
    true
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            stream_chunk_size: default_stream_chunk_size(),
            max_commit_retries: default_max_commit_retries(),
            commit_retry_backoff_ms: default_commit_retry_backoff_ms(),
            blob_write_timeout_secs: None,
            ensure_bucket: default_ensure_bucket(),
        }
    }
}

impl RepositoryConfig {
    /// Get the blob write timeout, if one is configured.
    pub fn blob_write_timeout(&self) -> Option<Duration> {
        self.blob_write_timeout_secs.map(Duration::from_secs)
    }

    /// Get the backoff before the given retry attempt (1-based).
    pub fn commit_retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.commit_retry_backoff_ms.saturating_mul(factor))
    }

    /// Validate repository configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.server_name.trim().is_empty() {
            return Err("repository.server_name must not be empty".to_string());
        }
        if self.stream_chunk_size == 0 || self.stream_chunk_size > crate::MAX_STREAM_CHUNK_SIZE {
            return Err(format!(
                "repository.stream_chunk_size {} must be between 1 and {}",
                self.stream_chunk_size,
                crate::MAX_STREAM_CHUNK_SIZE
            ));
        }
        if self.blob_write_timeout_secs == Some(0) {
            return Err("repository.blob_write_timeout_secs cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage. Plays the role of the bucket.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the ambient AWS credential chain if not set.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the ambient AWS credential chain if not set.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        secret_access_key: Option<String>,
        /// Force path-style URLs (e.g., `endpoint/bucket/key` instead of `bucket.endpoint/key`).
        /// Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
        /// Request SSE-S3 (AES256) server-side encryption for every object written.
        #[serde(default)]
        server_side_encryption: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/files"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err("s3 config requires a non-empty bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Filesystem { path } => {
                if path.as_os_str().is_empty() {
                    return Err("filesystem config requires a non-empty path".to_string());
                }
                Ok(())
            }
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (single node deployments and tests).
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Seconds a writer waits on a locked database before failing.
        #[serde(default = "default_sqlite_busy_timeout_secs")]
        busy_timeout_secs: u64,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL (optional if using individual fields).
        /// Takes precedence over individual fields if both are provided.
        url: Option<String>,
        /// Database host (e.g., "localhost" or "db.example.com").
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username.
        username: Option<String>,
        /// Database password.
        /// WARNING: Prefer VELLUM_METADATA__PASSWORD env var over storing in config.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// SSL mode for connections.
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds (prevents hung queries).
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_sqlite_busy_timeout_secs() -> u64 {
    5
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            busy_timeout_secs: default_sqlite_busy_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                max_connections,
                ..
            } => {
                if *max_connections == 0 {
                    return Err("postgres max_connections must be at least 1".to_string());
                }
                match (url.as_ref(), host.as_ref(), database.as_ref()) {
                    (Some(_), _, _) => Ok(()),
                    (None, Some(_), Some(_)) => Ok(()),
                    (None, None, _) => Err(
                        "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                    ),
                    (None, Some(_), None) => Err(
                        "postgres config requires 'database' when using individual fields"
                            .to_string(),
                    ),
                }
            }
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Repository coordination settings.
    #[serde(default)]
    pub repository: RepositoryConfig,
}

impl AppConfig {
    /// Create a test configuration rooted in `dir`.
    ///
    /// **For testing only.** Uses filesystem storage and SQLite metadata.
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            storage: StorageConfig::Filesystem {
                path: dir.join("blobs"),
            },
            metadata: MetadataConfig::Sqlite {
                path: dir.join("metadata.db"),
                busy_timeout_secs: default_sqlite_busy_timeout_secs(),
            },
            repository: RepositoryConfig {
                server_name: "test".to_string(),
                ..RepositoryConfig::default()
            },
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.metadata.validate()?;
        self.repository.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_config_defaults() {
        let config = RepositoryConfig::default();
        assert_eq!(config.stream_chunk_size, 64 * 1024);
        assert_eq!(config.max_commit_retries, 3);
        assert!(config.blob_write_timeout().is_none());
        assert!(config.ensure_bucket);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_repository_config_deserialize_partial() {
        let json = r#"{"server_name": "node-b", "blob_write_timeout_secs": 30}"#;
        let config: RepositoryConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.server_name, "node-b");
        assert_eq!(config.blob_write_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.stream_chunk_size, crate::DEFAULT_STREAM_CHUNK_SIZE);
    }

    #[test]
    fn test_repository_config_rejects_bad_chunk_size() {
        let config = RepositoryConfig {
            stream_chunk_size: 0,
            ..RepositoryConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_commit_retry_backoff_doubles() {
        let config = RepositoryConfig::default();
        assert_eq!(config.commit_retry_backoff(1), Duration::from_millis(50));
        assert_eq!(config.commit_retry_backoff(2), Duration::from_millis(100));
        assert_eq!(config.commit_retry_backoff(3), Duration::from_millis(200));
    }

    #[test]
    fn test_storage_config_s3_validate_partial_credentials() {
        let invalid = StorageConfig::S3 {
            bucket: "files".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access-key".to_string()),
            secret_access_key: None,
            force_path_style: false,
            server_side_encryption: false,
        };
        assert!(invalid.validate().is_err());

        let valid = StorageConfig::S3 {
            bucket: "files".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access-key".to_string()),
            secret_access_key: Some("secret-key".to_string()),
            force_path_style: false,
            server_side_encryption: true,
        };
        assert!(valid.validate().is_ok());
    }

    #[test]
    fn test_storage_config_s3_flags_default_to_false() {
        let json = r#"{"type":"s3","bucket":"files","endpoint":"http://minio:9000"}"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();
        match config {
            StorageConfig::S3 {
                force_path_style,
                server_side_encryption,
                ..
            } => {
                assert!(!force_path_style);
                assert!(!server_side_encryption);
            }
            _ => panic!("expected S3 config"),
        }
    }

    #[test]
    fn test_metadata_config_postgres_requires_target() {
        let config = MetadataConfig::Postgres {
            url: None,
            host: Some("db".to_string()),
            port: None,
            username: None,
            password: None,
            database: None,
            ssl_mode: None,
            max_connections: 10,
            statement_timeout_ms: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_app_config_for_testing_is_valid() {
        let config = AppConfig::for_testing("/tmp/vellum-test");
        assert!(config.validate().is_ok());
        assert_eq!(config.repository.server_name, "test");
    }
}
