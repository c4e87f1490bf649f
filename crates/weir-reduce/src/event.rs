//! Member events — the reducer's input.
//!
//! Pipeline stages exchange `CloudEvents`-shaped envelopes. The reducer only
//! reads the attributes it needs for correlation and completion evaluation;
//! the document payload itself stays in external object storage and is
//! carried by reference ([`DocumentRef`]), never inline, which keeps
//! aggregation-state size bounded by the member count alone.
//!
//! ## Identity
//!
//! - `id` identifies the *delivery envelope* and changes on republication.
//! - `data.member_id` identifies the *member* (typically the document etag)
//!   and is the deduplication identity inside an aggregation: redelivery of
//!   the same member is a no-op on the member set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use weir_core::{EventId, MemberId};

/// A reference to a document payload held in external object storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRef {
    /// Location of the payload (e.g. `s3://bucket/key`).
    pub url: String,
    /// MIME type of the payload.
    #[serde(rename = "type")]
    pub mime_type: String,
    /// Payload size in bytes, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Content etag of the payload.
    pub etag: String,
}

impl DocumentRef {
    /// Creates a new document reference.
    #[must_use]
    pub fn new(url: impl Into<String>, mime_type: impl Into<String>, etag: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mime_type: mime_type.into(),
            size: None,
            etag: etag.into(),
        }
    }

    /// Sets the payload size.
    #[must_use]
    pub const fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

/// A typed relationship from this member to another member of the same
/// aggregation (e.g. a text extract pointing at its source document).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    /// Relationship type (e.g. `derived-from`, `part-of`).
    #[serde(rename = "type")]
    pub rel_type: String,
    /// The member this relationship points at.
    pub target: MemberId,
    /// Free-form relationship attributes.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl Relationship {
    /// Creates a new relationship.
    #[must_use]
    pub fn new(rel_type: impl Into<String>, target: MemberId) -> Self {
        Self {
            rel_type: rel_type.into(),
            target,
            attributes: Map::new(),
        }
    }
}

/// The domain payload of a member event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberData {
    /// Producer-assigned member identity (deduplication key).
    pub member_id: MemberId,
    /// Reference to the document payload.
    pub document: DocumentRef,
    /// Relationships to other members of the same aggregation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<Relationship>,
    /// Free-form metadata accumulated by upstream stages.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

/// A `CloudEvents`-shaped member event envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberEvent {
    /// Unique envelope identifier (ULID).
    pub id: EventId,
    /// `CloudEvents` specification version.
    pub specversion: String,
    /// Event type (e.g. `document-created`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Chain identifier shared by all events spawned from a common ancestor.
    /// This is the raw material for the reduction key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    /// Event timestamp.
    pub time: DateTime<Utc>,
    /// Producer-side ordering hint, if any. The reducer never relies on it
    /// for correctness.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// The domain payload.
    pub data: MemberData,
}

impl MemberEvent {
    /// Creates a `document-created` member event with a fresh envelope id.
    #[must_use]
    pub fn document_created(
        chain_id: impl Into<String>,
        member_id: MemberId,
        document: DocumentRef,
    ) -> Self {
        Self {
            id: EventId::generate(),
            specversion: "1.0".into(),
            event_type: "document-created".into(),
            chain_id: Some(chain_id.into()),
            time: Utc::now(),
            sequence: None,
            data: MemberData {
                member_id,
                document,
                relationships: Vec::new(),
                attributes: Map::new(),
            },
        }
    }

    /// Sets the producer sequence hint.
    #[must_use]
    pub const fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Adds a relationship to another member.
    #[must_use]
    pub fn with_relationship(mut self, relationship: Relationship) -> Self {
        self.data.relationships.push(relationship);
        self
    }

    /// Adds a free-form metadata attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.data.attributes.insert(name.into(), value);
        self
    }
}
