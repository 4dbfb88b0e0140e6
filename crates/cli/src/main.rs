//! Command-line front end for Vellum.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use futures::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vellum_core::config::AppConfig;
use vellum_core::{FileId, IdempotencyKey, Version};
use vellum_repository::{AddVersion, CreateFile, Repository, ResolvedVersion};

/// Read buffer used when streaming a local file into the repository.
const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(name = "vellum")]
#[command(version, about = "Versioned file repository", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "VELLUM_CONFIG", default_value = "vellum.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the metadata schema and the bucket or storage root
    Init,
    /// Upload a new file
    Put {
        /// Local file to upload
        file: PathBuf,
        /// Namespace, e.g. "reports/2024"
        #[arg(long)]
        dir: Option<String>,
        /// Token that makes retries of this upload return the first result
        #[arg(long)]
        idempotency_key: Option<String>,
        /// Principal recorded as the creator
        #[arg(long)]
        created_by: Option<String>,
    },
    /// Upload a new version of an existing file
    AddVersion {
        file_id: String,
        /// Local file to upload
        file: PathBuf,
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Download a file (current version unless --version is given)
    Get {
        file_id: String,
        #[arg(long)]
        version: Option<Version>,
        /// Write to this path instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show a version's metadata
    Stat {
        file_id: String,
        #[arg(long)]
        version: Option<Version>,
    },
    /// List all versions of a file
    Versions { file_id: String },
    /// Delete a file and all of its versions
    Delete { file_id: String },
    /// Check connectivity of the metadata and blob stores
    Check,
}

/// `stat` output.
#[derive(Serialize)]
struct VersionInfo<'a> {
    #[serde(flatten)]
    version: &'a ResolvedVersion,
    download_name: String,
    etag: &'a str,
}

impl<'a> From<&'a ResolvedVersion> for VersionInfo<'a> {
    fn from(version: &'a ResolvedVersion) -> Self {
        Self {
            version,
            download_name: version.download_name(),
            etag: version.etag(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout carries only command output.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli.config)?;
    let repo = Repository::from_config(&config)
        .await
        .context("failed to open repository")?;

    match cli.command {
        Commands::Init => {
            let bucket_created = repo.ensure_bucket().await?;
            print_json(&serde_json::json!({ "status": "ok", "bucket_created": bucket_created }))
        }
        Commands::Put {
            file,
            dir,
            idempotency_key,
            created_by,
        } => {
            let request = CreateFile {
                dir: dir.map(|d| split_dir(&d)).unwrap_or_default(),
                idempotency_key: parse_idempotency_key(idempotency_key)?,
                created_by,
            };
            let body = open_body(&file).await?;
            let outcome = repo.create_file(request, body).await?;
            if outcome.replayed {
                tracing::info!(file_id = %outcome.receipt.file_id, "Upload already recorded");
            }
            println!("{}", outcome.payload);
            Ok(())
        }
        Commands::AddVersion {
            file_id,
            file,
            idempotency_key,
        } => {
            let file_id = parse_file_id(&file_id)?;
            let request = AddVersion {
                idempotency_key: parse_idempotency_key(idempotency_key)?,
            };
            let body = open_body(&file).await?;
            let outcome = repo.add_version(&file_id, request, body).await?;
            println!("{}", outcome.payload);
            Ok(())
        }
        Commands::Get {
            file_id,
            version,
            output,
        } => {
            let file_id = parse_file_id(&file_id)?;
            let (resolved, mut stream) = repo.open(&file_id, version).await?;
            match output {
                Some(path) => {
                    let mut out = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("failed to create {}", path.display()))?;
                    while let Some(chunk) = stream.next().await {
                        out.write_all(&chunk?).await?;
                    }
                    out.flush().await?;
                    print_json(&VersionInfo::from(&resolved))
                }
                None => {
                    let mut out = tokio::io::stdout();
                    while let Some(chunk) = stream.next().await {
                        out.write_all(&chunk?).await?;
                    }
                    out.flush().await?;
                    Ok(())
                }
            }
        }
        Commands::Stat { file_id, version } => {
            let resolved = repo.resolve(&parse_file_id(&file_id)?, version).await?;
            print_json(&VersionInfo::from(&resolved))
        }
        Commands::Versions { file_id } => {
            let versions = repo.list_versions(&parse_file_id(&file_id)?).await?;
            print_json(&versions)
        }
        Commands::Delete { file_id } => {
            let report = repo.delete_file(&parse_file_id(&file_id)?).await?;
            print_json(&report)
        }
        Commands::Check => {
            repo.health_check().await?;
            print_json(&serde_json::json!({ "status": "ok" }))
        }
    }
}

/// Load configuration from `path` (optional) overlaid with `VELLUM_*` env vars.
fn load_config(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();

    if path.exists() {
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}, using defaults", path.display());
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("VELLUM_").ignore(&["config"]).split("__"))
        .extract()
        .context("failed to load configuration")?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid configuration")?;
    Ok(config)
}

fn split_dir(dir: &str) -> Vec<String> {
    dir.split('/').map(str::to_string).collect()
}

fn parse_file_id(s: &str) -> Result<FileId> {
    FileId::parse(s).context("invalid file id")
}

fn parse_idempotency_key(key: Option<String>) -> Result<Option<IdempotencyKey>> {
    key.map(IdempotencyKey::parse)
        .transpose()
        .context("invalid idempotency key")
}

async fn open_body(path: &Path) -> Result<ReaderStream<tokio::fs::File>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(ReaderStream::with_capacity(file, READ_BUFFER_SIZE))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
