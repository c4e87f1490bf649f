//! The aggregation state store — CAS-mutated shared state.
//!
//! All reducer correctness reduces to this module's discipline: every
//! read-then-write of an aggregation record is guarded by the storage
//! backend's conditional-write primitive, using the version token the state
//! was read at. There is no in-process lock anywhere; workers share nothing
//! but this store.
//!
//! ## Storage layout
//!
//! Records live at:
//!
//! ```text
//! aggregations/{sha256(key)[0..40]}/{generation:04}.json
//! ```
//!
//! The hash keeps arbitrary chain identifiers out of storage paths while
//! preserving a flat, listable namespace. The original key is stored inside
//! the record and verified on every read — a hash collision surfaces as an
//! error rather than silently folding two chains together.
//!
//! ## Contention posture
//!
//! `register_member` retries its CAS a bounded number of times, then gives up
//! with a transient storage error: the surrounding at-least-once transport
//! already provides redelivery, and registration is idempotent under it.
//! `try_close` / `try_expire` never retry — losing that race means another
//! worker owns the transition, which is the desired outcome.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use weir_core::{ReductionKey, ScopedStorage, WritePrecondition, WriteResult};

use crate::config::ReducerConfig;
use crate::error::{Error, Result};
use crate::record::{
    AggregationRecord, AggregationStatus, CloseReason, MemberRef, RegisterDelta, Versioned,
};

/// Default bound on register CAS retries before deferring to redelivery.
pub const DEFAULT_REGISTER_RETRY_LIMIT: u32 = 5;

/// Result of a member registration.
#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    /// The record and the version token it is current at.
    pub versioned: Versioned,
    /// True if the member was newly appended; false for duplicates and for
    /// terminal records (which are returned unmodified).
    pub appended: bool,
}

/// Result of a conditional terminal transition.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// This caller won the race and owns the follow-up (emission).
    Won(Versioned),
    /// Another caller transitioned first. Expected control flow, not an
    /// error; the winner owns emission.
    Lost,
}

impl TransitionOutcome {
    /// Returns true if this caller won the transition.
    #[must_use]
    pub const fn is_won(&self) -> bool {
        matches!(self, Self::Won(_))
    }

    /// Returns the winning record, if any.
    #[must_use]
    pub fn won(&self) -> Option<&Versioned> {
        match self {
            Self::Won(versioned) => Some(versioned),
            Self::Lost => None,
        }
    }
}

/// Computes the storage directory for a reduction key.
#[must_use]
pub fn key_prefix(key: &ReductionKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_str().as_bytes());
    let hash = hasher.finalize();
    // First 20 bytes = 40 hex chars = 160 bits of entropy.
    format!("aggregations/{}", hex::encode(&hash[..20]))
}

/// Computes the storage path for a (key, generation) record.
#[must_use]
pub fn record_path(key: &ReductionKey, generation: u32) -> String {
    format!("{}/{generation:04}.json", key_prefix(key))
}

/// Client for the shared aggregation state store.
#[derive(Debug, Clone)]
pub struct AggregationStore {
    storage: ScopedStorage,
    retry_limit: u32,
}

impl AggregationStore {
    /// Creates a store over the given scoped storage.
    #[must_use]
    pub fn new(storage: ScopedStorage) -> Self {
        Self {
            storage,
            retry_limit: DEFAULT_REGISTER_RETRY_LIMIT,
        }
    }

    /// Overrides the register CAS retry bound.
    #[must_use]
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Returns the pipeline this store is scoped to.
    #[must_use]
    pub fn pipeline_id(&self) -> &str {
        self.storage.pipeline_id()
    }

    /// Reads a record with the version token it is current at.
    ///
    /// The version is read *before* the body: if the object changes in
    /// between, the token is stale and any CAS built on it loses — which is
    /// safe, while the opposite order could attach a fresh token to a stale
    /// body.
    ///
    /// # Errors
    ///
    /// Returns storage errors, parse errors, and a collision error if the
    /// stored key does not match `key`.
    pub async fn get(&self, key: &ReductionKey, generation: u32) -> Result<Option<Versioned>> {
        let path = record_path(key, generation);

        let Some(meta) = self.storage.head_raw(&path).await? else {
            return Ok(None);
        };

        let body = match self.storage.get_raw(&path).await {
            Ok(body) => body,
            // Deleted between head and get; treat as absent.
            Err(weir_core::Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: AggregationRecord = serde_json::from_slice(&body)
            .map_err(|e| Error::serialization(format!("corrupt record at {path}: {e}")))?;

        if &record.key != key {
            return Err(Error::storage(format!(
                "hash collision at {path}: stored key {} != requested key {key}",
                record.key
            )));
        }

        Ok(Some(Versioned {
            record,
            version: meta.version,
        }))
    }

    /// Returns the highest generation that exists for a key (0 if none).
    ///
    /// # Errors
    ///
    /// Returns storage errors from the underlying list.
    pub async fn latest_generation(&self, key: &ReductionKey) -> Result<u32> {
        let prefix = format!("{}/", key_prefix(key));
        let entries = self.storage.list_raw(&prefix).await?;

        Ok(entries
            .iter()
            .filter_map(|meta| {
                meta.path
                    .rsplit('/')
                    .next()
                    .and_then(|name| name.strip_suffix(".json"))
                    .and_then(|stem| stem.parse::<u32>().ok())
            })
            .max()
            .unwrap_or(0))
    }

    /// Atomically registers a member, creating the record lazily on first
    /// arrival.
    ///
    /// Idempotent under redelivery: a duplicate member id is a no-op on the
    /// member set (new attribute keys are still merged in) and returns the
    /// current state. A record already in a terminal status is returned
    /// unmodified with `appended = false`; routing of such late members is
    /// the engine's decision.
    ///
    /// # Errors
    ///
    /// Returns a transient storage error once the CAS retry bound is
    /// exhausted; the transport's redelivery is the recovery path.
    pub async fn register_member(
        &self,
        key: &ReductionKey,
        generation: u32,
        member: MemberRef,
        config: &ReducerConfig,
        now: DateTime<Utc>,
    ) -> Result<RegisterOutcome> {
        for _ in 0..self.retry_limit {
            match self.get(key, generation).await? {
                None => {
                    let mut record = AggregationRecord::open(key.clone(), generation, config, now);
                    record.register(member.clone());

                    let result = self
                        .put_record(&record, WritePrecondition::DoesNotExist)
                        .await?;
                    match result {
                        WriteResult::Success { version } => {
                            return Ok(RegisterOutcome {
                                versioned: Versioned { record, version },
                                appended: true,
                            });
                        }
                        // Another worker created the record first; re-read.
                        WriteResult::PreconditionFailed { .. } => {}
                    }
                }
                Some(versioned) => {
                    if versioned.record.status.is_terminal() {
                        return Ok(RegisterOutcome {
                            versioned,
                            appended: false,
                        });
                    }

                    let mut record = versioned.record;
                    let delta = record.register(member.clone());
                    if delta == RegisterDelta::Unchanged {
                        return Ok(RegisterOutcome {
                            versioned: Versioned {
                                record,
                                version: versioned.version,
                            },
                            appended: false,
                        });
                    }

                    let result = self
                        .put_record(
                            &record,
                            WritePrecondition::MatchesVersion(versioned.version),
                        )
                        .await?;
                    match result {
                        WriteResult::Success { version } => {
                            return Ok(RegisterOutcome {
                                versioned: Versioned { record, version },
                                appended: delta == RegisterDelta::Appended,
                            });
                        }
                        // Concurrent writer got in first; re-read and retry.
                        WriteResult::PreconditionFailed { .. } => {}
                    }
                }
            }
        }

        Err(Error::storage(format!(
            "register contention on key {key} exceeded {} attempts; deferring to redelivery",
            self.retry_limit
        )))
    }

    /// Attempts the conditional `Open -> Closed` transition.
    ///
    /// Exactly one caller among concurrent racers holding the same
    /// `expected_version` wins; everyone else gets [`TransitionOutcome::Lost`].
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not exist or storage fails. A lost
    /// race is not an error.
    pub async fn try_close(
        &self,
        key: &ReductionKey,
        generation: u32,
        expected_version: &str,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        self.try_transition(key, generation, expected_version, AggregationStatus::Closed, reason, now)
            .await
    }

    /// Attempts the conditional `Open -> Expired` transition.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not exist or storage fails. A lost
    /// race is not an error.
    pub async fn try_expire(
        &self,
        key: &ReductionKey,
        generation: u32,
        expected_version: &str,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        self.try_transition(key, generation, expected_version, AggregationStatus::Expired, reason, now)
            .await
    }

    async fn try_transition(
        &self,
        key: &ReductionKey,
        generation: u32,
        expected_version: &str,
        target: AggregationStatus,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let Some(versioned) = self.get(key, generation).await? else {
            return Err(Error::storage(format!(
                "cannot transition missing record for key {key} generation {generation}"
            )));
        };

        if versioned.record.status.is_terminal() {
            return Ok(TransitionOutcome::Lost);
        }

        let transitioned = versioned.record.transitioned(target, reason, now)?;
        let result = self
            .put_record(
                &transitioned,
                WritePrecondition::MatchesVersion(expected_version.to_string()),
            )
            .await?;

        match result {
            WriteResult::Success { version } => Ok(TransitionOutcome::Won(Versioned {
                record: transitioned,
                version,
            })),
            WriteResult::PreconditionFailed { .. } => Ok(TransitionOutcome::Lost),
        }
    }

    /// Conditionally advances the `emitted` flag after a successful emit.
    ///
    /// Best-effort: emission is already idempotent under its deduplication
    /// token, so losing this CAS (or finding the flag already set) is fine.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn mark_emitted(
        &self,
        key: &ReductionKey,
        generation: u32,
        expected_version: &str,
    ) -> Result<TransitionOutcome> {
        let Some(versioned) = self.get(key, generation).await? else {
            return Ok(TransitionOutcome::Lost);
        };

        if versioned.record.emitted {
            return Ok(TransitionOutcome::Lost);
        }

        let mut record = versioned.record;
        record.emitted = true;
        let result = self
            .put_record(
                &record,
                WritePrecondition::MatchesVersion(expected_version.to_string()),
            )
            .await?;

        match result {
            WriteResult::Success { version } => {
                Ok(TransitionOutcome::Won(Versioned { record, version }))
            }
            WriteResult::PreconditionFailed { .. } => Ok(TransitionOutcome::Lost),
        }
    }

    /// Scans for OPEN records that are due: past their time window or past
    /// their hard lifetime deadline.
    ///
    /// Corrupt records are skipped with a warning rather than failing the
    /// scan — one poisoned blob must not wedge the sweeper.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the underlying list.
    pub async fn scan_open(&self, now: DateTime<Utc>) -> Result<Vec<Versioned>> {
        let entries = self.storage.list_raw("aggregations/").await?;
        let mut due = Vec::new();

        for meta in entries {
            let body = match self.storage.get_raw(&meta.path).await {
                Ok(body) => body,
                Err(weir_core::Error::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            let record: AggregationRecord = match serde_json::from_slice(&body) {
                Ok(record) => record,
                Err(error) => {
                    tracing::warn!(path = %meta.path, %error, "skipping corrupt aggregation record");
                    continue;
                }
            };

            if record.status != AggregationStatus::Open {
                continue;
            }

            if record.window_elapsed(now) || record.past_hard_deadline(now) {
                due.push(Versioned {
                    record,
                    version: meta.version,
                });
            }
        }

        Ok(due)
    }

    async fn put_record(
        &self,
        record: &AggregationRecord,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let path = record_path(&record.key, record.generation);
        let body = serde_json::to_vec(record)
            .map_err(|e| Error::serialization(format!("failed to serialize record: {e}")))?;
        Ok(self
            .storage
            .put_raw(&path, Bytes::from(body), precondition)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DocumentRef;
    use crate::strategy::StrategyConfig;
    use std::sync::Arc;
    use weir_core::{MemberId, MemoryBackend};

    fn store() -> AggregationStore {
        let storage = ScopedStorage::new(Arc::new(MemoryBackend::new()), "ingest").unwrap();
        AggregationStore::new(storage)
    }

    fn config() -> ReducerConfig {
        ReducerConfig::new(StrategyConfig::CountThreshold { target: 3 })
    }

    fn member(id: &str) -> MemberRef {
        MemberRef {
            member_id: MemberId::new_unchecked(id),
            event_id: "e".into(),
            document: DocumentRef::new(format!("s3://b/{id}"), "text/plain", id),
            sequence: None,
            relationships: Vec::new(),
            attributes: serde_json::Map::new(),
            registered_at: Utc::now(),
        }
    }

    fn key() -> ReductionKey {
        ReductionKey::new_unchecked("chain-1")
    }

    #[tokio::test]
    async fn first_registration_creates_the_record() {
        let store = store();
        let outcome = store
            .register_member(&key(), 0, member("a"), &config(), Utc::now())
            .await
            .unwrap();

        assert!(outcome.appended);
        assert_eq!(outcome.versioned.record.member_count(), 1);
        assert_eq!(outcome.versioned.record.status, AggregationStatus::Open);
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_no_op() {
        let store = store();
        store
            .register_member(&key(), 0, member("a"), &config(), Utc::now())
            .await
            .unwrap();
        let outcome = store
            .register_member(&key(), 0, member("a"), &config(), Utc::now())
            .await
            .unwrap();

        assert!(!outcome.appended);
        assert_eq!(outcome.versioned.record.member_count(), 1);
    }

    #[tokio::test]
    async fn registration_into_terminal_record_returns_it_unmodified() {
        let store = store();
        let reg = store
            .register_member(&key(), 0, member("a"), &config(), Utc::now())
            .await
            .unwrap();
        let closed = store
            .try_close(
                &key(),
                0,
                &reg.versioned.version,
                CloseReason::StrategySatisfied,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(closed.is_won());

        let outcome = store
            .register_member(&key(), 0, member("b"), &config(), Utc::now())
            .await
            .unwrap();
        assert!(!outcome.appended);
        assert_eq!(outcome.versioned.record.status, AggregationStatus::Closed);
        assert_eq!(outcome.versioned.record.member_count(), 1);
    }

    #[tokio::test]
    async fn try_close_has_a_single_winner_per_version() {
        let store = store();
        let reg = store
            .register_member(&key(), 0, member("a"), &config(), Utc::now())
            .await
            .unwrap();
        let version = reg.versioned.version;

        let first = store
            .try_close(&key(), 0, &version, CloseReason::StrategySatisfied, Utc::now())
            .await
            .unwrap();
        let second = store
            .try_close(&key(), 0, &version, CloseReason::StrategySatisfied, Utc::now())
            .await
            .unwrap();

        assert!(first.is_won());
        assert!(!second.is_won());
    }

    #[tokio::test]
    async fn stale_version_loses_the_close_race() {
        let store = store();
        let reg_a = store
            .register_member(&key(), 0, member("a"), &config(), Utc::now())
            .await
            .unwrap();
        // A second registration bumps the version; the old token is stale.
        store
            .register_member(&key(), 0, member("b"), &config(), Utc::now())
            .await
            .unwrap();

        let outcome = store
            .try_close(
                &key(),
                0,
                &reg_a.versioned.version,
                CloseReason::StrategySatisfied,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(!outcome.is_won());

        // The record is still open; the current version can close it.
        let current = store.get(&key(), 0).await.unwrap().unwrap();
        assert_eq!(current.record.status, AggregationStatus::Open);
        let outcome = store
            .try_close(
                &key(),
                0,
                &current.version,
                CloseReason::StrategySatisfied,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(outcome.is_won());
    }

    #[tokio::test]
    async fn try_expire_on_terminal_record_loses() {
        let store = store();
        let reg = store
            .register_member(&key(), 0, member("a"), &config(), Utc::now())
            .await
            .unwrap();
        store
            .try_close(
                &key(),
                0,
                &reg.versioned.version,
                CloseReason::StrategySatisfied,
                Utc::now(),
            )
            .await
            .unwrap();

        let current = store.get(&key(), 0).await.unwrap().unwrap();
        let outcome = store
            .try_expire(&key(), 0, &current.version, CloseReason::HardExpiry, Utc::now())
            .await
            .unwrap();
        assert!(!outcome.is_won());
    }

    #[tokio::test]
    async fn mark_emitted_only_advances_once() {
        let store = store();
        let reg = store
            .register_member(&key(), 0, member("a"), &config(), Utc::now())
            .await
            .unwrap();
        let closed = store
            .try_close(
                &key(),
                0,
                &reg.versioned.version,
                CloseReason::StrategySatisfied,
                Utc::now(),
            )
            .await
            .unwrap();
        let closed = closed.won().unwrap();

        let first = store.mark_emitted(&key(), 0, &closed.version).await.unwrap();
        assert!(first.is_won());

        let current = store.get(&key(), 0).await.unwrap().unwrap();
        assert!(current.record.emitted);
        let second = store.mark_emitted(&key(), 0, &current.version).await.unwrap();
        assert!(!second.is_won());
    }

    #[tokio::test]
    async fn scan_open_returns_only_due_records() {
        let store = store();
        let window_config = ReducerConfig::new(StrategyConfig::TimeWindow { window_secs: 60 });
        let now = Utc::now();

        store
            .register_member(&ReductionKey::new_unchecked("due"), 0, member("a"), &window_config, now)
            .await
            .unwrap();
        store
            .register_member(
                &ReductionKey::new_unchecked("not-due"),
                0,
                member("b"),
                &window_config,
                now + chrono::Duration::seconds(120),
            )
            .await
            .unwrap();

        let due = store
            .scan_open(now + chrono::Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].record.key.as_str(), "due");
    }

    #[tokio::test]
    async fn scan_open_skips_terminal_records() {
        let store = store();
        let window_config = ReducerConfig::new(StrategyConfig::TimeWindow { window_secs: 60 });
        let now = Utc::now();

        let reg = store
            .register_member(&key(), 0, member("a"), &window_config, now)
            .await
            .unwrap();
        store
            .try_close(
                &key(),
                0,
                &reg.versioned.version,
                CloseReason::WindowElapsed,
                now,
            )
            .await
            .unwrap();

        let due = store
            .scan_open(now + chrono::Duration::seconds(3600))
            .await
            .unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn latest_generation_tracks_the_highest_record() {
        let store = store();
        assert_eq!(store.latest_generation(&key()).await.unwrap(), 0);

        store
            .register_member(&key(), 0, member("a"), &config(), Utc::now())
            .await
            .unwrap();
        assert_eq!(store.latest_generation(&key()).await.unwrap(), 0);

        store
            .register_member(&key(), 3, member("b"), &config(), Utc::now())
            .await
            .unwrap();
        assert_eq!(store.latest_generation(&key()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn record_paths_are_hashed_and_generation_suffixed() {
        let path = record_path(&key(), 2);
        assert!(path.starts_with("aggregations/"));
        assert!(path.ends_with("/0002.json"));
        assert!(!path.contains("chain-1"));
    }
}
