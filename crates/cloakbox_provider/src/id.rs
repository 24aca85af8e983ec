//! Opaque object identifiers.

use crate::error::{ProviderError, ProviderResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an object stored on a provider.
///
/// Ids are assigned by the provider when content is posted; callers never
/// choose them, except for the small set of [`ReservedId`]s used for
/// per-remote manifests. An id is a non-empty run of ASCII alphanumerics,
/// `-` and `_`, so it is always a safe single path component on disk and
/// on an FTP server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

/// Well-known object names that exist once per remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservedId {
    /// The remote's encrypted self-describing manifest.
    Config,
    /// The remote's encrypted inventory of synchronized files.
    Index,
}

impl ReservedId {
    /// All reserved ids.
    pub const ALL: [ReservedId; 2] = [ReservedId::Config, ReservedId::Index];

    /// Returns the object name of this reserved id.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ReservedId::Config => "config",
            ReservedId::Index => "index",
        }
    }
}

impl ObjectId {
    /// Maximum accepted id length.
    pub const MAX_LEN: usize = 128;

    /// Generates a fresh random id (UUID v4, simple form).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the id of a reserved object.
    #[must_use]
    pub fn reserved(id: ReservedId) -> Self {
        Self(id.as_str().to_string())
    }

    /// Parses and validates an id.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidId`] if the string is empty, too long,
    /// or contains characters outside `[A-Za-z0-9_-]`.
    pub fn parse(s: &str) -> ProviderResult<Self> {
        if s.is_empty() || s.len() > Self::MAX_LEN {
            return Err(ProviderError::InvalidId(format!(
                "length {} outside 1..={}",
                s.len(),
                Self::MAX_LEN
            )));
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(ProviderError::InvalidId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns true if this id names a reserved object.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        ReservedId::ALL.iter().any(|r| r.as_str() == self.0)
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = ProviderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_valid() {
        let a = ObjectId::generate();
        let b = ObjectId::generate();
        assert_ne!(a, b);
        assert_eq!(ObjectId::parse(a.as_str()).unwrap(), a);
        assert!(!a.is_reserved());
    }

    #[test]
    fn rejects_path_like_ids() {
        assert!(ObjectId::parse("").is_err());
        assert!(ObjectId::parse("../etc/passwd").is_err());
        assert!(ObjectId::parse(".hidden").is_err());
        assert!(ObjectId::parse("a/b").is_err());
        assert!(ObjectId::parse(&"x".repeat(ObjectId::MAX_LEN + 1)).is_err());
    }

    #[test]
    fn reserved_ids() {
        let config = ObjectId::reserved(ReservedId::Config);
        assert!(config.is_reserved());
        assert_eq!(config.as_str(), "config");
        assert!(ObjectId::reserved(ReservedId::Index).is_reserved());
    }
}
