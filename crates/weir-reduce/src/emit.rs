//! Emission — publishing composites to the output channel, exactly once as
//! observed downstream.
//!
//! Emitters are idempotent by contract: emitting twice for the same
//! deduplication token (key + generation) must be indistinguishable
//! downstream from emitting once. The engine and sweeper rely on this to
//! recover from a crash between the close transition and the emit
//! acknowledgement — they simply emit again.
//!
//! [`StorageEmitter`] realizes the contract with a `DoesNotExist` conditional
//! write: the object's existence *is* the deduplication check.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use weir_core::canonical_json::to_canonical_bytes;
use weir_core::{ReductionKey, ScopedStorage, WritePrecondition, WriteResult};

use crate::composite::{CompositeEvent, dedup_token};
use crate::error::{Error, Result};
use crate::record::CloseReason;

/// Result of publishing to the output channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitResult {
    /// The event became visible downstream for the first time.
    Published {
        /// Channel-specific message id.
        message_id: String,
    },
    /// The deduplication token was already consumed; nothing new became
    /// visible. This is the expected outcome of a post-crash re-emit.
    Deduplicated {
        /// The existing message id.
        message_id: String,
    },
}

impl EmitResult {
    /// Returns true if this call made the event visible.
    #[must_use]
    pub const fn is_published(&self) -> bool {
        matches!(self, Self::Published { .. })
    }

    /// Returns the message id.
    #[must_use]
    pub fn message_id(&self) -> &str {
        match self {
            Self::Published { message_id } | Self::Deduplicated { message_id } => message_id,
        }
    }
}

/// The distinct signal published when an aggregation is retired without ever
/// registering a member (or is abandoned past its hard lifetime).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbandonedAggregation {
    /// The reduction key of the abandoned aggregation.
    pub key: ReductionKey,
    /// Generation of the aggregation under the key.
    pub generation: u32,
    /// When the aggregation was expired.
    pub expired_at: DateTime<Utc>,
    /// Why the aggregation was abandoned.
    pub reason: CloseReason,
    /// Signal schema version.
    pub schema_version: u32,
}

impl AbandonedAggregation {
    /// Returns the deduplication token — same namespace as composites, so a
    /// (key, generation) pair surfaces downstream at most once in total.
    #[must_use]
    pub fn dedup_token(&self) -> String {
        dedup_token(&self.key, self.generation)
    }
}

/// Output channel abstraction.
///
/// Implementations must be idempotent per deduplication token: the second
/// emit for a token returns [`EmitResult::Deduplicated`] and has no further
/// downstream effect.
#[async_trait]
pub trait Emitter: Send + Sync {
    /// Publishes a composite event.
    ///
    /// # Errors
    ///
    /// Returns an emission error if the channel rejects the event; safe to
    /// retry with the same token.
    async fn emit(&self, composite: &CompositeEvent) -> Result<EmitResult>;

    /// Publishes an aggregation-abandoned signal.
    ///
    /// # Errors
    ///
    /// Returns an emission error if the channel rejects the signal; safe to
    /// retry with the same token.
    async fn emit_abandoned(&self, signal: &AbandonedAggregation) -> Result<EmitResult>;

    /// Returns the channel's name or identifier.
    fn channel_name(&self) -> &str;
}

#[async_trait]
impl<T: Emitter + ?Sized> Emitter for Arc<T> {
    async fn emit(&self, composite: &CompositeEvent) -> Result<EmitResult> {
        (**self).emit(composite).await
    }

    async fn emit_abandoned(&self, signal: &AbandonedAggregation) -> Result<EmitResult> {
        (**self).emit_abandoned(signal).await
    }

    fn channel_name(&self) -> &str {
        (**self).channel_name()
    }
}

fn token_path(prefix: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let hash = hasher.finalize();
    // First 20 bytes = 40 hex chars = 160 bits; plenty against collision.
    format!("{prefix}/{}.json", hex::encode(&hash[..20]))
}

/// Emitter that publishes into the state store itself.
///
/// Composites land at `composites/{sha256(token)[..40]}.json`, abandoned
/// signals at `abandoned/{sha256(token)[..40]}.json`, both written with
/// `DoesNotExist` so the storage precondition enforces the deduplication
/// contract. Downstream consumers tail these prefixes.
#[derive(Debug, Clone)]
pub struct StorageEmitter {
    storage: ScopedStorage,
    name: String,
}

impl StorageEmitter {
    /// Creates an emitter over the given scoped storage.
    #[must_use]
    pub fn new(storage: ScopedStorage) -> Self {
        let name = format!("storage:{}", storage.pipeline_id());
        Self { storage, name }
    }

    /// Returns the storage path a composite with this token lands at.
    #[must_use]
    pub fn composite_path(token: &str) -> String {
        token_path("composites", token)
    }

    /// Returns the storage path an abandoned signal with this token lands at.
    #[must_use]
    pub fn abandoned_path(token: &str) -> String {
        token_path("abandoned", token)
    }

    async fn publish_once(&self, path: &str, payload: Bytes) -> Result<EmitResult> {
        let result = self
            .storage
            .put_raw(path, payload, WritePrecondition::DoesNotExist)
            .await?;

        match result {
            WriteResult::Success { version } => Ok(EmitResult::Published {
                message_id: version,
            }),
            WriteResult::PreconditionFailed { current_version } => Ok(EmitResult::Deduplicated {
                message_id: current_version,
            }),
        }
    }
}

#[async_trait]
impl Emitter for StorageEmitter {
    #[tracing::instrument(skip(self, composite), fields(token = %composite.dedup_token()))]
    async fn emit(&self, composite: &CompositeEvent) -> Result<EmitResult> {
        let payload = composite.canonical_bytes()?;
        let path = Self::composite_path(&composite.dedup_token());
        let result = self.publish_once(&path, Bytes::from(payload)).await?;
        if result.is_published() {
            tracing::info!(
                key = %composite.key,
                generation = composite.generation,
                nodes = composite.nodes.len(),
                edges = composite.edges.len(),
                "composite published"
            );
        } else {
            tracing::debug!(key = %composite.key, "composite already published; deduplicated");
        }
        Ok(result)
    }

    #[tracing::instrument(skip(self, signal), fields(token = %signal.dedup_token()))]
    async fn emit_abandoned(&self, signal: &AbandonedAggregation) -> Result<EmitResult> {
        let payload = to_canonical_bytes(signal).map_err(|e| Error::serialization(e.to_string()))?;
        let path = Self::abandoned_path(&signal.dedup_token());
        let result = self.publish_once(&path, Bytes::from(payload)).await?;
        if result.is_published() {
            tracing::warn!(
                key = %signal.key,
                generation = signal.generation,
                reason = ?signal.reason,
                "aggregation abandoned"
            );
        }
        Ok(result)
    }

    fn channel_name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Default)]
struct InMemoryChannel {
    composites: HashMap<String, (String, CompositeEvent)>,
    abandoned: HashMap<String, (String, AbandonedAggregation)>,
    sequence: u64,
}

/// In-memory emitter for testing.
///
/// Deduplicates by token exactly like a production channel and records every
/// published event for assertions.
#[derive(Debug, Default)]
pub struct InMemoryEmitter {
    channel: RwLock<InMemoryChannel>,
}

impl InMemoryEmitter {
    /// Creates a new empty emitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all published composites in token order.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn composites(&self) -> Vec<CompositeEvent> {
        let channel = self.channel.read().expect("emitter lock poisoned");
        let mut entries: Vec<(&String, &(String, CompositeEvent))> =
            channel.composites.iter().collect();
        entries.sort_by_key(|(token, _)| (*token).clone());
        entries.into_iter().map(|(_, (_, c))| c.clone()).collect()
    }

    /// Returns all published abandoned signals in token order.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn abandoned(&self) -> Vec<AbandonedAggregation> {
        let channel = self.channel.read().expect("emitter lock poisoned");
        let mut entries: Vec<(&String, &(String, AbandonedAggregation))> =
            channel.abandoned.iter().collect();
        entries.sort_by_key(|(token, _)| (*token).clone());
        entries.into_iter().map(|(_, (_, s))| s.clone()).collect()
    }

    /// Returns the total number of distinct published events.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn published_count(&self) -> usize {
        let channel = self.channel.read().expect("emitter lock poisoned");
        channel.composites.len() + channel.abandoned.len()
    }
}

#[async_trait]
impl Emitter for InMemoryEmitter {
    async fn emit(&self, composite: &CompositeEvent) -> Result<EmitResult> {
        let mut channel = self.channel.write().map_err(|_| Error::Core(
            weir_core::Error::Internal {
                message: "emitter lock poisoned".into(),
            },
        ))?;

        let token = composite.dedup_token();
        if let Some((message_id, _)) = channel.composites.get(&token) {
            return Ok(EmitResult::Deduplicated {
                message_id: message_id.clone(),
            });
        }

        channel.sequence += 1;
        let message_id = format!("mem-{:08}", channel.sequence);
        channel
            .composites
            .insert(token, (message_id.clone(), composite.clone()));
        Ok(EmitResult::Published { message_id })
    }

    async fn emit_abandoned(&self, signal: &AbandonedAggregation) -> Result<EmitResult> {
        let mut channel = self.channel.write().map_err(|_| Error::Core(
            weir_core::Error::Internal {
                message: "emitter lock poisoned".into(),
            },
        ))?;

        let token = signal.dedup_token();
        if let Some((message_id, _)) = channel.abandoned.get(&token) {
            return Ok(EmitResult::Deduplicated {
                message_id: message_id.clone(),
            });
        }

        channel.sequence += 1;
        let message_id = format!("mem-{:08}", channel.sequence);
        channel
            .abandoned
            .insert(token, (message_id.clone(), signal.clone()));
        Ok(EmitResult::Published { message_id })
    }

    fn channel_name(&self) -> &str {
        "memory"
    }
}
