//! File identifiers and version numbers.

use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A file version number. Versions start at [`FIRST_VERSION`] and only grow.
pub type Version = u32;

/// The version assigned to the content a file is created with.
pub const FIRST_VERSION: Version = 1;

/// Opaque identifier of a logical file.
///
/// Generated fresh for every create and rendered as 32 lowercase hex
/// characters. Identifiers are never derived from content or file names.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(Uuid);

impl FileId {
    /// Generate a new random file ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string. Both the simple and the hyphenated form are accepted.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::try_parse(s.trim())
            .map(Self)
            .map_err(|e| crate::Error::InvalidFileId(format!("{s:?}: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for FileId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0.simple())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_renders_as_simple_hex() {
        let id = FileId::new();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 32);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(FileId::parse(&rendered).unwrap(), id);
    }

    #[test]
    fn test_file_id_accepts_hyphenated_form() {
        let id = FileId::new();
        let hyphenated = id.as_uuid().hyphenated().to_string();
        assert_eq!(FileId::parse(&hyphenated).unwrap(), id);
    }

    #[test]
    fn test_file_ids_are_unique() {
        assert_ne!(FileId::new(), FileId::new());
    }

    #[test]
    fn test_file_id_rejects_garbage() {
        assert!(matches!(
            FileId::parse("../etc/passwd"),
            Err(crate::Error::InvalidFileId(_))
        ));
    }
}
