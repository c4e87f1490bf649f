//! The aggregation engine — the reducer's central correctness authority.
//!
//! One invocation per member arrival, on any worker, in any order, any
//! number of times. The engine's contract is that no interleaving of those
//! invocations can emit two composites for one aggregation or lose a member
//! registered before closure. The mechanism is uniform: every decision that
//! matters is settled by a conditional write in [`crate::store`], using the
//! version token the deciding state was read at.
//!
//! ```text
//! resolve key -> register member -> evaluate strategy -> try_close (CAS)
//!                                                          |- won  -> build + emit
//!                                                          `- lost -> exit silently
//! ```
//!
//! Losing the close race is expected control flow: the winner is, or will
//! be, responsible for emission. Workers that crash after winning are
//! covered by emission idempotency — the sweeper (or a redelivery) emits
//! again with the same deduplication token.

use chrono::{DateTime, Utc};

use weir_core::ReductionKey;

use crate::composite::CompositeBuilder;
use crate::config::{ExpiryPolicy, LatePolicy, ReducerConfig};
use crate::correlation::CorrelationResolver;
use crate::emit::{AbandonedAggregation, EmitResult, Emitter};
use crate::error::{Error, Result};
use crate::event::MemberEvent;
use crate::metrics::ReduceMetrics;
use crate::record::{AggregationStatus, CloseReason, MemberRef, Versioned};
use crate::store::{AggregationStore, TransitionOutcome};
use crate::strategy::StrategyEvaluator;

/// Bound on probing successive generations under the new-aggregation late
/// policy before giving up.
const GENERATION_PROBE_LIMIT: u32 = 16;

/// Outcome of handling one member arrival.
#[derive(Debug, Clone)]
pub enum ReduceOutcome {
    /// The member was appended; the aggregation stays open.
    Registered {
        /// The aggregation's reduction key.
        key: ReductionKey,
        /// The aggregation's generation.
        generation: u32,
        /// Member count after registration.
        member_count: u64,
    },
    /// Redelivery of an already-registered member; no state change.
    Duplicate {
        /// The aggregation's reduction key.
        key: ReductionKey,
        /// The aggregation's generation.
        generation: u32,
        /// Member count (unchanged).
        member_count: u64,
    },
    /// This invocation won the close transition and emitted the composite.
    Closed {
        /// The aggregation's reduction key.
        key: ReductionKey,
        /// The aggregation's generation.
        generation: u32,
        /// The emission result.
        emit: EmitResult,
    },
    /// This invocation won the expire transition and emitted the (possibly
    /// partial) composite or abandoned signal.
    Expired {
        /// The aggregation's reduction key.
        key: ReductionKey,
        /// The aggregation's generation.
        generation: u32,
        /// The emission result.
        emit: EmitResult,
    },
    /// A concurrent invocation retired the aggregation first. The winner
    /// owns emission; nothing to do.
    RaceLost {
        /// The aggregation's reduction key.
        key: ReductionKey,
        /// The aggregation's generation.
        generation: u32,
    },
    /// The member arrived after closure and the late policy rejected it.
    LateRejected {
        /// The aggregation's reduction key.
        key: ReductionKey,
        /// The terminal generation the member was rejected from.
        generation: u32,
    },
}

/// A batch item whose processing failed transiently.
///
/// Reported back to the transport so only this item is redelivered.
#[derive(Debug, Clone)]
pub struct BatchItemFailure {
    /// Envelope id of the failing item.
    pub event_id: String,
    /// The failure, stringified for the transport's report.
    pub error: String,
}

/// A batch item rejected permanently (redelivery cannot succeed).
#[derive(Debug, Clone)]
pub struct BatchItemRejection {
    /// Envelope id of the rejected item.
    pub event_id: String,
    /// Why the item was rejected.
    pub reason: String,
}

/// Result of processing a member-arrival batch.
///
/// Mirrors partial-batch-response transports: `failures` are redelivered,
/// `rejections` are dropped with an error log, everything else succeeded.
#[derive(Debug, Default)]
pub struct BatchSummary {
    /// Per-item outcomes for the successful items.
    pub outcomes: Vec<ReduceOutcome>,
    /// Items to report for redelivery.
    pub failures: Vec<BatchItemFailure>,
    /// Items dropped as non-retryable.
    pub rejections: Vec<BatchItemRejection>,
}

impl BatchSummary {
    /// Returns true if every item succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.rejections.is_empty()
    }
}

/// Orchestrates registration, completion evaluation, closure, and emission.
pub struct AggregationEngine<E: Emitter> {
    store: AggregationStore,
    evaluator: StrategyEvaluator,
    emitter: E,
    config: ReducerConfig,
    metrics: ReduceMetrics,
}

impl<E: Emitter> AggregationEngine<E> {
    /// Creates an engine.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the strategy is degenerate or names
    /// an unregistered predicate.
    pub fn new(
        store: AggregationStore,
        evaluator: StrategyEvaluator,
        emitter: E,
        config: ReducerConfig,
    ) -> Result<Self> {
        evaluator.validate(&config.strategy)?;
        Ok(Self {
            store,
            evaluator,
            emitter,
            config,
            metrics: ReduceMetrics::new(),
        })
    }

    /// Returns the engine's configuration.
    #[must_use]
    pub fn config(&self) -> &ReducerConfig {
        &self.config
    }

    /// Handles one member arrival.
    ///
    /// Idempotent under redelivery and safe under arbitrary concurrency; see
    /// the module docs for the discipline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCorrelation`] for events without a chain id
    /// (non-retryable) and transient storage/emission errors for the
    /// transport to redeliver.
    #[tracing::instrument(
        skip(self, event),
        fields(event_id = %event.id, pipeline = %self.store.pipeline_id())
    )]
    pub async fn handle(&self, event: &MemberEvent) -> Result<ReduceOutcome> {
        let key = CorrelationResolver::resolve(event)?;
        let now = Utc::now();
        let member = MemberRef::from_event(event, now);

        let mut generation = self.store.latest_generation(&key).await?;
        let mut registered = self
            .store
            .register_member(&key, generation, member.clone(), &self.config, now)
            .await?;

        if registered.versioned.record.status.is_terminal() {
            // A redelivery of a member that made it into the retired set is
            // not late — it is the recovery path for a worker that crashed
            // between winning the transition and finishing emission.
            if registered.versioned.record.contains_member(&member.member_id) {
                return self.recover_emission(registered.versioned).await;
            }

            match self.config.late_policy {
                LatePolicy::Reject => {
                    tracing::warn!(
                        key = %key,
                        generation,
                        member_id = %member.member_id,
                        status = %registered.versioned.record.status,
                        "member arrived after aggregation was retired; rejecting"
                    );
                    self.metrics.record_late("reject");
                    return Ok(ReduceOutcome::LateRejected { key, generation });
                }
                LatePolicy::NewAggregation => {
                    self.metrics.record_late("new_aggregation");
                    let mut probes = 0;
                    loop {
                        probes += 1;
                        if probes > GENERATION_PROBE_LIMIT {
                            return Err(Error::GenerationsExhausted { key });
                        }
                        generation += 1;
                        registered = self
                            .store
                            .register_member(&key, generation, member.clone(), &self.config, now)
                            .await?;
                        if !registered.versioned.record.status.is_terminal() {
                            tracing::info!(
                                key = %key,
                                generation,
                                member_id = %member.member_id,
                                "late member routed to fresh aggregation generation"
                            );
                            break;
                        }
                    }
                }
            }
        }

        let appended = registered.appended;
        if appended {
            self.metrics.record_registered();
        } else {
            self.metrics.record_duplicate();
        }

        let versioned = registered.versioned;

        // Hard safety expiry is an unconditional override of every strategy.
        if versioned.record.past_hard_deadline(now) {
            return self
                .attempt_retirement(versioned, AggregationStatus::Expired, CloseReason::HardExpiry, now)
                .await;
        }

        if self.evaluator.evaluate(&versioned.record).await.is_complete() {
            return self
                .attempt_retirement(
                    versioned,
                    AggregationStatus::Closed,
                    CloseReason::StrategySatisfied,
                    now,
                )
                .await;
        }

        // Opportunistic time-window closure on arrival; the sweeper covers
        // windows that elapse with no further arrivals.
        if StrategyEvaluator::time_eligible(&versioned.record, now) {
            return self
                .attempt_retirement(
                    versioned,
                    AggregationStatus::Closed,
                    CloseReason::WindowElapsed,
                    now,
                )
                .await;
        }

        let member_count = versioned.record.member_count();
        Ok(if appended {
            ReduceOutcome::Registered {
                key,
                generation,
                member_count,
            }
        } else {
            ReduceOutcome::Duplicate {
                key,
                generation,
                member_count,
            }
        })
    }

    /// Handles a batch of arrivals with per-item failure reporting.
    ///
    /// A failing item never blocks the rest of the batch: transient errors
    /// land in `failures` (for redelivery), non-retryable ones in
    /// `rejections` (dropped, with an error log).
    pub async fn handle_batch(&self, events: &[MemberEvent]) -> BatchSummary {
        self.metrics.observe_batch_size(events.len());
        let mut summary = BatchSummary::default();

        for event in events {
            match self.handle(event).await {
                Ok(outcome) => summary.outcomes.push(outcome),
                Err(error) if error.is_non_retryable() => {
                    tracing::error!(event_id = %event.id, %error, "dropping non-retryable event");
                    summary.rejections.push(BatchItemRejection {
                        event_id: event.id.to_string(),
                        reason: error.to_string(),
                    });
                }
                Err(error) => {
                    tracing::warn!(event_id = %event.id, %error, "batch item failed; reporting for redelivery");
                    summary.failures.push(BatchItemFailure {
                        event_id: event.id.to_string(),
                        error: error.to_string(),
                    });
                }
            }
        }

        summary
    }

    /// Finishes emission for a terminal record a redelivered member landed
    /// on. Idempotent: if the composite is already out, this is a plain
    /// duplicate.
    async fn recover_emission(&self, versioned: Versioned) -> Result<ReduceOutcome> {
        let key = versioned.record.key.clone();
        let generation = versioned.record.generation;
        let member_count = versioned.record.member_count();
        let status = versioned.record.status;

        if versioned.record.emitted {
            self.metrics.record_duplicate();
            return Ok(ReduceOutcome::Duplicate {
                key,
                generation,
                member_count,
            });
        }

        tracing::info!(
            key = %key,
            generation,
            "terminal record with unconfirmed emission; re-emitting idempotently"
        );
        let emit = publish_retirement(
            &self.store,
            &self.emitter,
            self.config.expiry,
            &self.metrics,
            &versioned,
        )
        .await?;

        Ok(match status {
            AggregationStatus::Expired => ReduceOutcome::Expired {
                key,
                generation,
                emit,
            },
            _ => ReduceOutcome::Closed {
                key,
                generation,
                emit,
            },
        })
    }

    async fn attempt_retirement(
        &self,
        versioned: Versioned,
        target: AggregationStatus,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<ReduceOutcome> {
        let key = versioned.record.key.clone();
        let generation = versioned.record.generation;

        let outcome = match target {
            AggregationStatus::Closed => {
                self.store
                    .try_close(&key, generation, &versioned.version, reason, now)
                    .await?
            }
            AggregationStatus::Expired => {
                self.store
                    .try_expire(&key, generation, &versioned.version, reason, now)
                    .await?
            }
            AggregationStatus::Open => {
                return Err(Error::InvalidTransition {
                    from: versioned.record.status.to_string(),
                    to: AggregationStatus::Open.to_string(),
                });
            }
        };

        match outcome {
            TransitionOutcome::Won(retired) => {
                self.metrics.record_retired(target, reason);
                let emit = publish_retirement(
                    &self.store,
                    &self.emitter,
                    self.config.expiry,
                    &self.metrics,
                    &retired,
                )
                .await?;
                Ok(match target {
                    AggregationStatus::Expired => ReduceOutcome::Expired {
                        key,
                        generation,
                        emit,
                    },
                    _ => ReduceOutcome::Closed {
                        key,
                        generation,
                        emit,
                    },
                })
            }
            TransitionOutcome::Lost => {
                // Expected under concurrency; the winner owns emission.
                tracing::debug!(key = %key, generation, "lost retirement race");
                self.metrics.record_race_lost();
                Ok(ReduceOutcome::RaceLost { key, generation })
            }
        }
    }
}

/// Builds and publishes the output for a freshly retired record, then
/// best-effort advances its `emitted` flag.
///
/// Shared by the engine and the sweeper so both sides of the close race
/// publish identically. A zero-member record publishes the distinct
/// abandoned signal unless the policy asks for empty composites.
pub(crate) async fn publish_retirement<E: Emitter>(
    store: &AggregationStore,
    emitter: &E,
    policy: ExpiryPolicy,
    metrics: &ReduceMetrics,
    retired: &Versioned,
) -> Result<EmitResult> {
    let record = &retired.record;

    let emit = if record.members.is_empty() && !policy.emit_empty_composite {
        let signal = AbandonedAggregation {
            key: record.key.clone(),
            generation: record.generation,
            expired_at: record
                .closed_at
                .ok_or_else(|| Error::serialization("terminal record is missing its close timestamp"))?,
            reason: record
                .close_reason
                .ok_or_else(|| Error::serialization("terminal record is missing its close reason"))?,
            schema_version: 1,
        };
        let emit = emitter.emit_abandoned(&signal).await?;
        if emit.is_published() {
            metrics.record_abandoned();
        }
        emit
    } else {
        let composite = CompositeBuilder::build(record)?;
        emitter.emit(&composite).await?
    };

    metrics.record_emission(emit.is_published());

    // Best-effort: emission is idempotent, so a lost (or failed) flag update
    // costs at most one redundant deduplicated emit later.
    if let Err(error) = store
        .mark_emitted(&record.key, record.generation, &retired.version)
        .await
    {
        tracing::warn!(key = %record.key, %error, "failed to advance emitted flag");
    }

    Ok(emit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DocumentRef;
    use crate::strategy::StrategyConfig;
    use std::sync::Arc;
    use weir_core::{MemberId, MemoryBackend, ScopedStorage};

    fn engine(
        config: ReducerConfig,
    ) -> (AggregationEngine<Arc<crate::emit::InMemoryEmitter>>, Arc<crate::emit::InMemoryEmitter>) {
        let storage = ScopedStorage::new(Arc::new(MemoryBackend::new()), "ingest").unwrap();
        let emitter = Arc::new(crate::emit::InMemoryEmitter::new());
        let engine = AggregationEngine::new(
            AggregationStore::new(storage),
            StrategyEvaluator::new(),
            Arc::clone(&emitter),
            config,
        )
        .unwrap();
        (engine, emitter)
    }

    fn event(chain: &str, member: &str) -> MemberEvent {
        MemberEvent::document_created(
            chain,
            MemberId::new_unchecked(member),
            DocumentRef::new(format!("s3://b/{member}"), "text/plain", member),
        )
    }

    #[tokio::test]
    async fn members_accumulate_until_threshold() {
        let (engine, emitter) =
            engine(ReducerConfig::new(StrategyConfig::CountThreshold { target: 3 }));

        assert!(matches!(
            engine.handle(&event("chain-1", "a")).await.unwrap(),
            ReduceOutcome::Registered { member_count: 1, .. }
        ));
        assert!(matches!(
            engine.handle(&event("chain-1", "b")).await.unwrap(),
            ReduceOutcome::Registered { member_count: 2, .. }
        ));
        assert_eq!(emitter.published_count(), 0);

        let outcome = engine.handle(&event("chain-1", "c")).await.unwrap();
        let ReduceOutcome::Closed { emit, .. } = outcome else {
            panic!("expected close at target, got {outcome:?}");
        };
        assert!(emit.is_published());
        assert_eq!(emitter.published_count(), 1);

        let composite = &emitter.composites()[0];
        let ids: Vec<String> = composite.node_ids().iter().map(ToString::to_string).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn duplicate_delivery_does_not_close_early() {
        let (engine, emitter) =
            engine(ReducerConfig::new(StrategyConfig::CountThreshold { target: 2 }));

        engine.handle(&event("chain-1", "a")).await.unwrap();
        let outcome = engine.handle(&event("chain-1", "a")).await.unwrap();
        assert!(matches!(
            outcome,
            ReduceOutcome::Duplicate { member_count: 1, .. }
        ));
        assert_eq!(emitter.published_count(), 0);
    }

    #[tokio::test]
    async fn late_member_is_rejected_by_default() {
        let (engine, emitter) =
            engine(ReducerConfig::new(StrategyConfig::CountThreshold { target: 1 }));

        engine.handle(&event("chain-1", "a")).await.unwrap();
        let outcome = engine.handle(&event("chain-1", "late")).await.unwrap();
        assert!(matches!(outcome, ReduceOutcome::LateRejected { .. }));
        assert_eq!(emitter.published_count(), 1);

        // The closed record never gained the late member.
        let composite = &emitter.composites()[0];
        assert_eq!(composite.nodes.len(), 1);
    }

    #[tokio::test]
    async fn late_member_starts_a_fresh_generation_when_configured() {
        let (engine, emitter) = engine(
            ReducerConfig::new(StrategyConfig::CountThreshold { target: 1 })
                .with_late_policy(LatePolicy::NewAggregation),
        );

        engine.handle(&event("chain-1", "a")).await.unwrap();
        let outcome = engine.handle(&event("chain-1", "b")).await.unwrap();

        // Target 1 means the fresh generation closes immediately too.
        let ReduceOutcome::Closed { generation, .. } = outcome else {
            panic!("expected fresh-generation close, got {outcome:?}");
        };
        assert_eq!(generation, 1);
        assert_eq!(emitter.published_count(), 2);
    }

    #[tokio::test]
    async fn missing_correlation_is_non_retryable() {
        let (engine, _) = engine(ReducerConfig::new(StrategyConfig::CountThreshold { target: 1 }));
        let mut bad = event("chain-1", "a");
        bad.chain_id = None;

        let err = engine.handle(&bad).await.unwrap_err();
        assert!(err.is_non_retryable());
    }

    #[tokio::test]
    async fn hard_expiry_overrides_the_strategy() {
        let (engine, emitter) = engine(
            ReducerConfig::new(StrategyConfig::CountThreshold { target: 100 })
                .with_max_lifetime_secs(0),
        );

        let outcome = engine.handle(&event("chain-1", "a")).await.unwrap();
        let ReduceOutcome::Expired { emit, .. } = outcome else {
            panic!("expected hard expiry, got {outcome:?}");
        };
        assert!(emit.is_published());
        // One member existed, so a (partial) composite is emitted, not an
        // abandoned signal.
        assert_eq!(emitter.composites().len(), 1);
        assert!(emitter.abandoned().is_empty());
    }

    #[tokio::test]
    async fn conditional_strategy_closes_when_predicate_passes() {
        let storage = ScopedStorage::new(Arc::new(MemoryBackend::new()), "ingest").unwrap();
        let emitter = Arc::new(crate::emit::InMemoryEmitter::new());
        let evaluator = StrategyEvaluator::new().with_predicate(
            "has-pdf",
            Arc::new(|record: &crate::record::AggregationRecord| {
                Ok(record
                    .members
                    .iter()
                    .any(|m| m.document.mime_type == "application/pdf"))
            }),
        );
        let engine = AggregationEngine::new(
            AggregationStore::new(storage),
            evaluator,
            Arc::clone(&emitter),
            ReducerConfig::new(StrategyConfig::Conditional {
                predicate: "has-pdf".into(),
            }),
        )
        .unwrap();

        engine.handle(&event("chain-1", "a")).await.unwrap();
        assert_eq!(emitter.published_count(), 0);

        let pdf = MemberEvent::document_created(
            "chain-1",
            MemberId::new_unchecked("b"),
            DocumentRef::new("s3://b/b.pdf", "application/pdf", "b"),
        );
        let outcome = engine.handle(&pdf).await.unwrap();
        assert!(matches!(outcome, ReduceOutcome::Closed { .. }));
    }

    #[tokio::test]
    async fn unknown_predicate_fails_construction() {
        let storage = ScopedStorage::new(Arc::new(MemoryBackend::new()), "ingest").unwrap();
        let result = AggregationEngine::new(
            AggregationStore::new(storage),
            StrategyEvaluator::new(),
            crate::emit::InMemoryEmitter::new(),
            ReducerConfig::new(StrategyConfig::Conditional {
                predicate: "ghost".into(),
            }),
        );
        assert!(matches!(result, Err(Error::UnknownPredicate { .. })));
    }

    #[tokio::test]
    async fn batch_reports_failures_per_item() {
        let (engine, _) = engine(ReducerConfig::new(StrategyConfig::CountThreshold { target: 10 }));

        let mut no_chain = event("chain-1", "b");
        no_chain.chain_id = None;
        let events = vec![event("chain-1", "a"), no_chain, event("chain-1", "c")];

        let summary = engine.handle_batch(&events).await;
        assert_eq!(summary.outcomes.len(), 2);
        assert_eq!(summary.rejections.len(), 1);
        assert!(summary.failures.is_empty());
        assert!(!summary.is_clean());
    }
}
