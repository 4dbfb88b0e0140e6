//! Idempotency cache over the metadata store.
//!
//! A key maps to the exact JSON receipt of the first upload that carried it.
//! Records never expire here.

use crate::error::{RepositoryError, RepositoryResult};
use std::sync::Arc;
use time::OffsetDateTime;
use vellum_core::{IdempotencyKey, UploadReceipt};
use vellum_metadata::{CommitOutcome, IdempotencyRow, MetadataStore};

/// A recorded upload result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedResult {
    pub receipt: UploadReceipt,
    /// The stored payload, returned byte-for-byte on replay.
    pub payload: String,
}

impl CachedResult {
    pub(crate) fn from_row(row: &IdempotencyRow) -> RepositoryResult<Self> {
        let receipt = UploadReceipt::from_json(&row.result_json).map_err(|e| {
            RepositoryError::MetadataTransaction(format!(
                "stored result for idempotency key {} is unreadable: {e}",
                row.idempotency_key
            ))
        })?;
        Ok(Self {
            receipt,
            payload: row.result_json.clone(),
        })
    }
}

/// Build the row recorded for `key` when an upload commits.
pub(crate) fn pending_row(key: &IdempotencyKey, payload: &str) -> IdempotencyRow {
    IdempotencyRow {
        idempotency_key: key.as_str().to_string(),
        result_json: payload.to_string(),
        created_at: OffsetDateTime::now_utc(),
    }
}

pub struct IdempotencyCache {
    metadata: Arc<dyn MetadataStore>,
}

impl IdempotencyCache {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    /// Find the recorded result for `key`, if any.
    pub async fn lookup(&self, key: &IdempotencyKey) -> RepositoryResult<Option<CachedResult>> {
        self.metadata
            .get_idempotency(key.as_str())
            .await?
            .as_ref()
            .map(CachedResult::from_row)
            .transpose()
    }

    /// Record `receipt` for `key` unless a result is already recorded.
    ///
    /// Returns whether ours was accepted, and the result now on record.
    pub async fn record_if_absent(
        &self,
        key: &IdempotencyKey,
        receipt: &UploadReceipt,
    ) -> RepositoryResult<(bool, CachedResult)> {
        let payload = receipt.to_json()?;
        match self
            .metadata
            .insert_idempotency_if_absent(&pending_row(key, &payload))
            .await?
        {
            CommitOutcome::Committed => Ok((
                true,
                CachedResult {
                    receipt: receipt.clone(),
                    payload,
                },
            )),
            CommitOutcome::Duplicate(row) => Ok((false, CachedResult::from_row(&row)?)),
        }
    }
}
