//! Object key construction.
//!
//! Keys take the form `segment/.../file_id/vN`. Client-chosen segments are
//! sanitized so a key can never climb out of its namespace: every segment is
//! split on `/` and `\`, trimmed, and pieces that are empty, `.` or `..` are
//! dropped rather than rejected.

use crate::file::Version;
use std::fmt;

/// Maximum length of a complete object key in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Sanitize client-supplied path segments into a `/`-joined prefix.
///
/// The result never contains empty, `.` or `..` components and never starts
/// or ends with a separator. Returns an empty string when nothing survives.
///
/// Fails only for pieces carrying control characters or when the joined
/// prefix exceeds [`MAX_KEY_LEN`].
pub fn sanitize_segments<S: AsRef<str>>(segments: &[S]) -> crate::Result<String> {
    let mut clean: Vec<&str> = Vec::new();
    for segment in segments {
        for piece in segment.as_ref().split(['/', '\\']) {
            let piece = piece.trim();
            if piece.is_empty() || piece == "." || piece == ".." {
                continue;
            }
            if piece.chars().any(char::is_control) {
                return Err(crate::Error::InvalidKey(format!(
                    "segment {piece:?} contains control characters"
                )));
            }
            clean.push(piece);
        }
    }

    let joined = clean.join("/");
    if joined.len() > MAX_KEY_LEN {
        return Err(crate::Error::InvalidKey(format!(
            "prefix is {} bytes (max: {MAX_KEY_LEN})",
            joined.len()
        )));
    }
    Ok(joined)
}

/// A sanitized blob store key for one file version.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Build the key for `version` of `file_id` under the given namespace segments.
    pub fn for_version<S: AsRef<str>>(
        segments: &[S],
        file_id: &str,
        version: Version,
    ) -> crate::Result<Self> {
        let prefix = sanitize_segments(segments)?;
        let id = sanitize_segments(&[file_id])?;
        if id.is_empty() {
            return Err(crate::Error::InvalidKey(format!(
                "file id {file_id:?} is empty after sanitization"
            )));
        }

        let key = if prefix.is_empty() {
            format!("{id}/v{version}")
        } else {
            format!("{prefix}/{id}/v{version}")
        };
        if key.len() > MAX_KEY_LEN {
            return Err(crate::Error::InvalidKey(format!(
                "key is {} bytes (max: {MAX_KEY_LEN})",
                key.len()
            )));
        }
        Ok(Self(key))
    }

    /// Borrow the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the key, returning the inner string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<ObjectKey> for String {
    fn from(key: ObjectKey) -> Self {
        key.0
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({})", self.0)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
