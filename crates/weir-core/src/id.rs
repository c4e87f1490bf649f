//! Strongly-typed identifiers for weir entities.
//!
//! Two kinds of identity exist in the reducer:
//!
//! - [`EventId`]: minted by weir for envelopes it creates. ULIDs —
//!   lexicographically sortable by creation time, globally unique without
//!   coordination.
//! - [`MemberId`]: the identity a *producer* assigned to an aggregation
//!   member (typically a content etag or a stable document id). weir never
//!   generates these; it validates and carries them.
//!
//! # Example
//!
//! ```rust
//! use weir_core::id::{EventId, MemberId};
//!
//! let event = EventId::generate();
//! let member = MemberId::new("9f86d081884c7d65").unwrap();
//! // Different types - mixing them up won't compile.
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for an event envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Ulid);

impl EventId {
    /// Generates a new unique event id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates an event id from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the id.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = self.0.timestamp_ms();
        chrono::DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid event id '{s}': {e}"),
            })
    }
}

/// The producer-assigned identity of an aggregation member.
///
/// Member ids must be:
/// - Non-empty and at most 256 bytes
/// - Free of control characters
///
/// They are otherwise opaque: weir compares them for equality and sorts them
/// lexicographically, nothing more.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    /// Maximum accepted length in bytes.
    pub const MAX_LEN: usize = 256;

    /// Creates a new member id after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty, too long, or contains control
    /// characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidId {
                message: "member id cannot be empty".into(),
            });
        }
        if id.len() > Self::MAX_LEN {
            return Err(Error::InvalidId {
                message: format!(
                    "member id exceeds {} bytes ({} bytes)",
                    Self::MAX_LEN,
                    id.len()
                ),
            });
        }
        if id.chars().any(char::is_control) {
            return Err(Error::InvalidId {
                message: "member id cannot contain control characters".into(),
            });
        }
        Ok(Self(id))
    }

    /// Creates a member id without validation.
    ///
    /// Intended for ids that have already been validated (e.g. read back from
    /// storage).
    #[must_use]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the member id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MemberId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_roundtrip() {
        let id = EventId::generate();
        let s = id.to_string();
        let parsed: EventId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn event_ids_are_unique() {
        assert_ne!(EventId::generate(), EventId::generate());
    }

    #[test]
    fn member_id_accepts_etag_style_values() {
        let id = MemberId::new("d41d8cd98f00b204e9800998ecf8427e").unwrap();
        assert_eq!(id.as_str(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn member_id_rejects_empty() {
        assert!(MemberId::new("").is_err());
    }

    #[test]
    fn member_id_rejects_control_characters() {
        assert!(MemberId::new("abc\ndef").is_err());
    }

    #[test]
    fn member_id_rejects_oversized() {
        assert!(MemberId::new("x".repeat(257)).is_err());
    }

    #[test]
    fn member_ids_sort_lexicographically() {
        let a = MemberId::new("a").unwrap();
        let b = MemberId::new("b").unwrap();
        assert!(a < b);
    }
}
