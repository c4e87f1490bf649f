//! Composite events — the reducer's single output per aggregation.
//!
//! A composite is a directed graph over the final member set: nodes are
//! members, edges are the typed relationships members declared between each
//! other. It is a pure value — edges reference node *ids*, never node
//! handles, so there is no cyclic-ownership concern — built exactly once at
//! closure and never mutated afterwards.
//!
//! ## Determinism
//!
//! Construction iterates the member set in sorted-member-id order and sorts
//! edges by `(from, to, type)`; combined with canonical JSON serialization,
//! two builds from the same final member set are byte-identical no matter
//! what order the members arrived in. Idempotent re-emission after a crash
//! between close and publish depends on this.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use weir_core::canonical_json::to_canonical_bytes;
use weir_core::{MemberId, ReductionKey};

use crate::error::{Error, Result};
use crate::event::DocumentRef;
use crate::record::{AggregationRecord, CloseReason};

/// Current version of the composite schema.
pub const COMPOSITE_SCHEMA_VERSION: u32 = 1;

/// A node in the composite graph — one aggregation member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeNode {
    /// The member id (stable identity, sorted iteration key).
    pub id: MemberId,
    /// Node type, taken from the member's document MIME type.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Reference to the member's payload.
    pub document: DocumentRef,
    /// Free-form attributes carried over from the member.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

/// A typed edge between two members of the composite graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeEdge {
    /// Source node id.
    pub from: MemberId,
    /// Target node id.
    pub to: MemberId,
    /// Edge type (e.g. `derived-from`, `part-of`).
    #[serde(rename = "type")]
    pub edge_type: String,
    /// Free-form edge attributes.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

/// The aggregated output event for one retired aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeEvent {
    /// The reduction key this composite aggregates.
    pub key: ReductionKey,
    /// Generation of the aggregation under the key.
    pub generation: u32,
    /// When the aggregation reached its terminal status.
    pub closed_at: DateTime<Utc>,
    /// Why the aggregation was retired; downstream consumers use this to
    /// distinguish complete sets from window/expiry partials.
    pub close_reason: CloseReason,
    /// Graph nodes, sorted by member id.
    pub nodes: Vec<CompositeNode>,
    /// Graph edges, sorted by (from, to, type).
    pub edges: Vec<CompositeEdge>,
    /// Composite schema version.
    pub schema_version: u32,
}

impl CompositeEvent {
    /// Returns the deduplication token for the output channel.
    ///
    /// One token per (key, generation): at most one composite may ever become
    /// visible downstream for it.
    #[must_use]
    pub fn dedup_token(&self) -> String {
        dedup_token(&self.key, self.generation)
    }

    /// Serializes the composite into canonical bytes.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the composite cannot be represented
    /// as JSON.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        to_canonical_bytes(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Checks the graph invariant: every edge endpoint is a present node.
    ///
    /// # Errors
    ///
    /// Returns an internal error naming the first dangling endpoint.
    pub fn validate(&self) -> Result<()> {
        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !self.nodes.iter().any(|n| &n.id == endpoint) {
                    return Err(Error::serialization(format!(
                        "edge {} -> {} references absent node {endpoint}",
                        edge.from, edge.to
                    )));
                }
            }
        }
        Ok(())
    }

    /// Returns the node ids in their (sorted) graph order.
    #[must_use]
    pub fn node_ids(&self) -> Vec<&MemberId> {
        self.nodes.iter().map(|n| &n.id).collect()
    }
}

/// Computes the deduplication token for a (key, generation) pair.
#[must_use]
pub fn dedup_token(key: &ReductionKey, generation: u32) -> String {
    format!("{key}#g{generation:04}")
}

/// Builds composite events from retired aggregation records.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompositeBuilder;

impl CompositeBuilder {
    /// Builds the composite for a terminal record.
    ///
    /// Relationships whose target is absent from the final member set are
    /// dropped with a warning — the graph invariant (edge endpoints exist)
    /// holds by construction.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is still open or lacks a close
    /// timestamp.
    pub fn build(record: &AggregationRecord) -> Result<CompositeEvent> {
        if !record.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: record.status.to_string(),
                to: "composite".into(),
            });
        }
        let closed_at = record.closed_at.ok_or_else(|| {
            Error::serialization("terminal record is missing its close timestamp")
        })?;
        let close_reason = record
            .close_reason
            .ok_or_else(|| Error::serialization("terminal record is missing its close reason"))?;

        // Canonical iteration order: sorted member ids, first delivery wins
        // on duplicates.
        let ids = record.sorted_member_ids();
        let mut nodes = Vec::with_capacity(ids.len());
        for id in &ids {
            let member = record
                .members
                .iter()
                .find(|m| &m.member_id == id)
                .ok_or_else(|| Error::serialization(format!("member {id} vanished from record")))?;
            nodes.push(CompositeNode {
                id: member.member_id.clone(),
                node_type: member.document.mime_type.clone(),
                document: member.document.clone(),
                attributes: member.attributes.clone(),
            });
        }

        let mut edges = Vec::new();
        for id in &ids {
            let member = record
                .members
                .iter()
                .find(|m| &m.member_id == id)
                .ok_or_else(|| Error::serialization(format!("member {id} vanished from record")))?;
            for rel in &member.relationships {
                if !ids.contains(&rel.target) {
                    tracing::warn!(
                        key = %record.key,
                        from = %member.member_id,
                        target = %rel.target,
                        rel_type = %rel.rel_type,
                        "dropping relationship to a member absent from the final set"
                    );
                    continue;
                }
                edges.push(CompositeEdge {
                    from: member.member_id.clone(),
                    to: rel.target.clone(),
                    edge_type: rel.rel_type.clone(),
                    attributes: rel.attributes.clone(),
                });
            }
        }
        edges.sort_by(|a, b| {
            (&a.from, &a.to, &a.edge_type).cmp(&(&b.from, &b.to, &b.edge_type))
        });

        Ok(CompositeEvent {
            key: record.key.clone(),
            generation: record.generation,
            closed_at,
            close_reason,
            nodes,
            edges,
            schema_version: COMPOSITE_SCHEMA_VERSION,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReducerConfig;
    use crate::event::{DocumentRef, Relationship};
    use crate::record::{AggregationStatus, MemberRef};
    use crate::strategy::StrategyConfig;

    fn member(id: &str, relationships: Vec<Relationship>) -> MemberRef {
        MemberRef {
            member_id: MemberId::new_unchecked(id),
            event_id: "e".into(),
            document: DocumentRef::new(format!("s3://b/{id}"), "text/plain", id),
            sequence: None,
            relationships,
            attributes: Map::new(),
            registered_at: Utc::now(),
        }
    }

    fn closed_record(member_order: &[&str]) -> AggregationRecord {
        let config = ReducerConfig::new(StrategyConfig::CountThreshold {
            target: member_order.len() as u64,
        });
        let mut record =
            AggregationRecord::open(ReductionKey::new_unchecked("chain-1"), 0, &config, Utc::now());
        for id in member_order {
            let rels = if *id == "b" {
                vec![Relationship::new(
                    "derived-from",
                    MemberId::new_unchecked("a"),
                )]
            } else {
                Vec::new()
            };
            record.register(member(id, rels));
        }
        record
            .transitioned(
                AggregationStatus::Closed,
                CloseReason::StrategySatisfied,
                Utc::now(),
            )
            .unwrap()
    }

    #[test]
    fn nodes_are_sorted_by_member_id() {
        let composite = CompositeBuilder::build(&closed_record(&["c", "a", "b"])).unwrap();
        let ids: Vec<String> = composite.node_ids().iter().map(ToString::to_string).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn arrival_order_does_not_change_bytes() {
        let mut first = closed_record(&["c", "a", "b"]);
        let mut second = closed_record(&["b", "c", "a"]);
        // Normalize the non-deterministic timestamps; everything else must
        // already agree.
        let ts = Utc::now();
        first.closed_at = Some(ts);
        second.closed_at = Some(ts);
        for m in first.members.iter_mut().chain(second.members.iter_mut()) {
            m.registered_at = ts;
        }

        let a = CompositeBuilder::build(&first).unwrap();
        let b = CompositeBuilder::build(&second).unwrap();
        assert_eq!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
    }

    #[test]
    fn edges_from_relationships() {
        let composite = CompositeBuilder::build(&closed_record(&["a", "b"])).unwrap();
        assert_eq!(composite.edges.len(), 1);
        assert_eq!(composite.edges[0].from.as_str(), "b");
        assert_eq!(composite.edges[0].to.as_str(), "a");
        assert_eq!(composite.edges[0].edge_type, "derived-from");
        composite.validate().unwrap();
    }

    #[test]
    fn dangling_relationships_are_dropped() {
        let config = ReducerConfig::new(StrategyConfig::CountThreshold { target: 1 });
        let mut record =
            AggregationRecord::open(ReductionKey::new_unchecked("chain-1"), 0, &config, Utc::now());
        record.register(member(
            "a",
            vec![Relationship::new(
                "derived-from",
                MemberId::new_unchecked("not-a-member"),
            )],
        ));
        let record = record
            .transitioned(
                AggregationStatus::Closed,
                CloseReason::StrategySatisfied,
                Utc::now(),
            )
            .unwrap();

        let composite = CompositeBuilder::build(&record).unwrap();
        assert!(composite.edges.is_empty());
        composite.validate().unwrap();
    }

    #[test]
    fn open_record_cannot_build() {
        let config = ReducerConfig::new(StrategyConfig::CountThreshold { target: 1 });
        let record =
            AggregationRecord::open(ReductionKey::new_unchecked("chain-1"), 0, &config, Utc::now());
        assert!(CompositeBuilder::build(&record).is_err());
    }

    #[test]
    fn empty_terminal_record_builds_empty_graph() {
        let config = ReducerConfig::new(StrategyConfig::TimeWindow { window_secs: 1 });
        let record =
            AggregationRecord::open(ReductionKey::new_unchecked("chain-1"), 0, &config, Utc::now())
                .transitioned(
                    AggregationStatus::Expired,
                    CloseReason::WindowElapsed,
                    Utc::now(),
                )
                .unwrap();
        let composite = CompositeBuilder::build(&record).unwrap();
        assert!(composite.nodes.is_empty());
        assert!(composite.edges.is_empty());
        assert_eq!(composite.close_reason, CloseReason::WindowElapsed);
    }

    #[test]
    fn dedup_token_is_stable_per_key_and_generation() {
        let composite = CompositeBuilder::build(&closed_record(&["a", "b"])).unwrap();
        assert_eq!(composite.dedup_token(), "chain-1#g0000");
        assert_eq!(
            dedup_token(&ReductionKey::new_unchecked("chain-1"), 3),
            "chain-1#g0003"
        );
    }
}
