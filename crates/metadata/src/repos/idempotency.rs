//! Idempotency key repository.

use crate::error::MetadataResult;
use crate::models::{CommitOutcome, IdempotencyRow};
use async_trait::async_trait;

/// Repository for recorded upload results keyed by idempotency key.
#[async_trait]
pub trait IdempotencyRepo: Send + Sync {
    /// Look up a recorded result.
    async fn get_idempotency(&self, key: &str) -> MetadataResult<Option<IdempotencyRow>>;

    /// Record a result unless the key already has one.
    ///
    /// Returns the winning row as [`CommitOutcome::Duplicate`] when another
    /// writer got there first.
    async fn insert_idempotency_if_absent(
        &self,
        row: &IdempotencyRow,
    ) -> MetadataResult<CommitOutcome>;
}
