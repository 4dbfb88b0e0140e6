//! Upload requests and receipts.

use crate::file::Version;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of an idempotency key in bytes.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Client-supplied token used to deduplicate retried uploads.
///
/// Keys are opaque; only length and printability are checked.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Validate and wrap a client-supplied key.
    pub fn parse(s: impl Into<String>) -> crate::Result<Self> {
        let s = s.into();
        if s.trim().is_empty() {
            return Err(crate::Error::InvalidIdempotencyKey(
                "key must not be empty".to_string(),
            ));
        }
        if s.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(crate::Error::InvalidIdempotencyKey(format!(
                "key is {} bytes (max: {MAX_IDEMPOTENCY_KEY_LEN})",
                s.len()
            )));
        }
        if s.chars().any(char::is_control) {
            return Err(crate::Error::InvalidIdempotencyKey(
                "key contains control characters".to_string(),
            ));
        }
        Ok(Self(s))
    }

    /// Borrow the key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdempotencyKey({})", self.0)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a successful create or add-version call.
///
/// The JSON form of a receipt is what gets recorded against an idempotency
/// key and replayed verbatim to retrying clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub file_id: String,
    /// Object key holding the bytes of this version.
    pub path: String,
    pub version: Version,
    /// Lowercase hex SHA-256 of the content.
    pub checksum: String,
    pub size: u64,
    /// Name of the node that accepted the upload.
    pub server: String,
}

impl UploadReceipt {
    /// Serialize to the JSON payload stored for idempotent replay.
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    /// Parse a stored JSON payload.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| crate::Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_validation() {
        assert!(IdempotencyKey::parse("retry-7f3a").is_ok());
        assert!(IdempotencyKey::parse("").is_err());
        assert!(IdempotencyKey::parse("   ").is_err());
        assert!(IdempotencyKey::parse("a\nb").is_err());
        assert!(IdempotencyKey::parse("k".repeat(MAX_IDEMPOTENCY_KEY_LEN)).is_ok());
        assert!(IdempotencyKey::parse("k".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn test_receipt_json_field_names() {
        let receipt = UploadReceipt {
            file_id: "0123".to_string(),
            path: "docs/0123/v1".to_string(),
            version: 1,
            checksum: "ab".repeat(32),
            size: 42,
            server: "node-a".to_string(),
        };
        let json = receipt.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        for field in ["file_id", "path", "version", "checksum", "size", "server"] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
        assert_eq!(UploadReceipt::from_json(&json).unwrap(), receipt);
    }
}
