//! Core domain types and shared configuration for Vellum.
//!
//! This crate defines the data model used across the other crates:
//! - Opaque file identifiers and idempotency keys
//! - Object key construction with traversal-safe segment sanitization
//! - SHA-256 content hashing
//! - Upload receipts replayed to clients
//! - Application configuration

pub mod config;
pub mod error;
pub mod file;
pub mod hash;
pub mod key;
pub mod upload;

pub use error::{Error, Result};
pub use file::{FIRST_VERSION, FileId, Version};
pub use hash::{ContentHash, ContentHasher};
pub use key::{MAX_KEY_LEN, ObjectKey, sanitize_segments};
pub use upload::{IdempotencyKey, UploadReceipt};

/// Default chunk size for streaming blob transfers: 64 KiB
pub const DEFAULT_STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound for the configurable stream chunk size: 8 MiB
pub const MAX_STREAM_CHUNK_SIZE: usize = 8 * 1024 * 1024;
