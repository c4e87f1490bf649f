//! Aggregation records — the only shared mutable state in the system.
//!
//! One record per (reduction key, generation). Records are persisted as JSON
//! blobs in the state store and mutated exclusively through conditional
//! writes, so every field here obeys a monotonicity discipline:
//!
//! - `status` only advances `Open -> {Closed | Expired}` and never reverts
//! - `members` is append-only and deduplicated by member id
//! - `emitted` only advances `false -> true`
//!
//! The CAS version token is *not* a field of the record: it is the storage
//! object's version, carried alongside the parsed record as [`Versioned`].
//! The store never trusts a caller-supplied record — only the token.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use weir_core::{MemberId, ReductionKey};

use crate::config::ReducerConfig;
use crate::error::{Error, Result};
use crate::event::{DocumentRef, MemberEvent, Relationship};
use crate::strategy::StrategyConfig;

/// Current version of the record schema.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

/// Aggregation lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationStatus {
    /// Accepting members.
    Open,
    /// Completion condition met; composite emitted (or owed).
    Closed,
    /// Retired without meeting its completion condition.
    Expired,
}

impl AggregationStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Expired)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Open => matches!(target, Self::Closed | Self::Expired),
            Self::Closed | Self::Expired => false,
        }
    }
}

impl std::fmt::Display for AggregationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Why an aggregation reached its terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    /// The completion strategy evaluated to complete.
    StrategySatisfied,
    /// A time window elapsed; the member set may be partial by design.
    WindowElapsed,
    /// The hard maximum lifetime was exceeded, overriding the strategy.
    HardExpiry,
}

/// A member registered in an aggregation.
///
/// Captures everything the composite builder needs so closure never has to
/// re-read the original envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRef {
    /// Producer-assigned member identity (deduplication key).
    pub member_id: MemberId,
    /// Envelope id of the delivery that first registered this member.
    pub event_id: String,
    /// Reference to the document payload.
    pub document: DocumentRef,
    /// Producer-side ordering hint, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Relationships to other members of the same aggregation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<Relationship>,
    /// Free-form metadata from the producer.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// When this member was registered.
    pub registered_at: DateTime<Utc>,
}

impl MemberRef {
    /// Builds a member reference from an incoming event.
    #[must_use]
    pub fn from_event(event: &MemberEvent, now: DateTime<Utc>) -> Self {
        Self {
            member_id: event.data.member_id.clone(),
            event_id: event.id.to_string(),
            document: event.data.document.clone(),
            sequence: event.sequence,
            relationships: event.data.relationships.clone(),
            attributes: event.data.attributes.clone(),
            registered_at: now,
        }
    }
}

/// Effect of a registration attempt on the member set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterDelta {
    /// The member was new and has been appended.
    Appended,
    /// The member was already present; its attributes gained new keys.
    Merged,
    /// The member was already present with nothing new to merge.
    Unchanged,
}

/// Per-aggregation state, keyed by (reduction key, generation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationRecord {
    /// The reduction key correlating this aggregation's members.
    pub key: ReductionKey,
    /// Generation counter; 0 for the first aggregation under a key, bumped
    /// when the late-member policy routes to a fresh aggregation.
    pub generation: u32,
    /// Lifecycle status.
    pub status: AggregationStatus,
    /// When the record was created (first member arrival).
    pub created_at: DateTime<Utc>,
    /// Completion strategy, fixed at creation.
    pub strategy: StrategyConfig,
    /// Unconditional expiry deadline, if a maximum lifetime is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hard_deadline: Option<DateTime<Utc>>,
    /// Registered members, append-only, deduplicated by member id.
    #[serde(default)]
    pub members: Vec<MemberRef>,
    /// Whether the composite (or abandoned signal) was confirmed emitted.
    #[serde(default)]
    pub emitted: bool,
    /// When the record reached its terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    /// Why the record reached its terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
    /// Record schema version.
    pub schema_version: u32,
}

impl AggregationRecord {
    /// Creates a fresh open record for the given key and generation.
    #[must_use]
    pub fn open(
        key: ReductionKey,
        generation: u32,
        config: &ReducerConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            generation,
            status: AggregationStatus::Open,
            created_at: now,
            strategy: config.strategy.clone(),
            hard_deadline: config.hard_deadline(now),
            members: Vec::new(),
            emitted: false,
            closed_at: None,
            close_reason: None,
            schema_version: RECORD_SCHEMA_VERSION,
        }
    }

    /// Returns the number of registered members.
    #[must_use]
    pub fn member_count(&self) -> u64 {
        self.members.len() as u64
    }

    /// Returns true if a member with the given id is registered.
    #[must_use]
    pub fn contains_member(&self, member_id: &MemberId) -> bool {
        self.members.iter().any(|m| &m.member_id == member_id)
    }

    /// Registers a member: appends it if absent, otherwise shallow-merges any
    /// attribute keys the stored copy is missing. The member set itself is
    /// idempotent under duplicate delivery.
    pub fn register(&mut self, member: MemberRef) -> RegisterDelta {
        if let Some(existing) = self
            .members
            .iter_mut()
            .find(|m| m.member_id == member.member_id)
        {
            let mut merged = false;
            for (k, v) in member.attributes {
                if !existing.attributes.contains_key(&k) {
                    existing.attributes.insert(k, v);
                    merged = true;
                }
            }
            if merged {
                RegisterDelta::Merged
            } else {
                RegisterDelta::Unchanged
            }
        } else {
            self.members.push(member);
            RegisterDelta::Appended
        }
    }

    /// Returns the deduplicated member ids in canonical (sorted) order.
    #[must_use]
    pub fn sorted_member_ids(&self) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> = self.members.iter().map(|m| m.member_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Returns the window deadline for time-window aggregations.
    #[must_use]
    pub fn window_deadline(&self) -> Option<DateTime<Utc>> {
        match self.strategy {
            StrategyConfig::TimeWindow { window_secs } => Some(
                self.created_at + Duration::seconds(i64::try_from(window_secs).unwrap_or(i64::MAX)),
            ),
            StrategyConfig::CountThreshold { .. } | StrategyConfig::Conditional { .. } => None,
        }
    }

    /// Returns true if this is a time-window aggregation whose window has
    /// elapsed.
    #[must_use]
    pub fn window_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.window_deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Returns true if the hard lifetime deadline has passed.
    #[must_use]
    pub fn past_hard_deadline(&self, now: DateTime<Utc>) -> bool {
        self.hard_deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Returns a copy transitioned to the target terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the record is already
    /// terminal.
    pub fn transitioned(
        &self,
        target: AggregationStatus,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        let mut next = self.clone();
        next.status = target;
        next.closed_at = Some(now);
        next.close_reason = Some(reason);
        Ok(next)
    }
}

/// A record paired with the storage version token it was read at.
///
/// The token is the fencing token for every subsequent conditional write.
#[derive(Debug, Clone)]
pub struct Versioned {
    /// The parsed record.
    pub record: AggregationRecord,
    /// Opaque storage version token.
    pub version: String,
}
