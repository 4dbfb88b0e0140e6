//! Repository traits for metadata operations.

pub mod files;
pub mod idempotency;

pub use files::FileRepo;
pub use idempotency::IdempotencyRepo;
