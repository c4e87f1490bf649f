//! Reduction keys — the correlation identity of an aggregation.
//!
//! Every member event spawned from a common ancestor carries the same chain
//! identifier; the reduction key derived from it names the aggregation all
//! those siblings fold into. Keys are opaque to weir: they are hashed before
//! being used in storage paths, so no path-safety constraints apply beyond
//! basic sanity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Identifier correlating all member events belonging to one aggregation.
///
/// Keys must be:
/// - Non-empty after trimming
/// - At most 512 bytes
/// - Free of control characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReductionKey(String);

impl ReductionKey {
    /// Maximum accepted length in bytes.
    pub const MAX_LEN: usize = 512;

    /// Creates a new reduction key after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is blank, too long, or contains control
    /// characters.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(Error::InvalidId {
                message: "reduction key cannot be blank".into(),
            });
        }
        if key.len() > Self::MAX_LEN {
            return Err(Error::InvalidId {
                message: format!(
                    "reduction key exceeds {} bytes ({} bytes)",
                    Self::MAX_LEN,
                    key.len()
                ),
            });
        }
        if key.chars().any(char::is_control) {
            return Err(Error::InvalidId {
                message: "reduction key cannot contain control characters".into(),
            });
        }
        Ok(Self(key))
    }

    /// Creates a reduction key without validation.
    ///
    /// Intended for keys that have already been validated (e.g. read back
    /// from storage).
    #[must_use]
    pub fn new_unchecked(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReductionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReductionKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_chain_identifiers() {
        let key = ReductionKey::new("chain-01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap();
        assert_eq!(key.as_str(), "chain-01ARZ3NDEKTSV4RRFFQ69G5FAV");
    }

    #[test]
    fn rejects_blank() {
        assert!(ReductionKey::new("   ").is_err());
        assert!(ReductionKey::new("").is_err());
    }

    #[test]
    fn rejects_control_characters() {
        assert!(ReductionKey::new("a\tb").is_err());
    }

    #[test]
    fn rejects_oversized() {
        assert!(ReductionKey::new("k".repeat(513)).is_err());
    }

    #[test]
    fn serde_is_transparent() {
        let key = ReductionKey::new("chain-1").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"chain-1\"");
        let back: ReductionKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
