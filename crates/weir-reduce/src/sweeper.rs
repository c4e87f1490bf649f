//! The expiry sweeper — reclaiming aggregations that never complete.
//!
//! Arrival-triggered closure only runs when members arrive; an aggregation
//! whose producers died, or whose time window elapsed in silence, would
//! otherwise sit open forever. The sweeper scans for due records and retires
//! them through the exact same CAS transitions as the engine, so the two
//! sides of any race compose safely: only one direction ever wins.
//!
//! A sweep never aborts on a single bad candidate — per-candidate errors are
//! collected into the summary and the pass continues. Lost races are counted,
//! never logged as errors: an arrival beating the sweeper to a closure is the
//! system working.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ExpiryPolicy;
use crate::emit::Emitter;
use crate::engine::publish_retirement;
use crate::error::Result;
use crate::metrics::ReduceMetrics;
use crate::record::{AggregationStatus, CloseReason, Versioned};
use crate::store::{AggregationStore, TransitionOutcome};

/// A per-candidate sweep failure.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepError {
    /// Reduction key of the failing candidate.
    pub key: String,
    /// Generation of the failing candidate.
    pub generation: u32,
    /// The failure, stringified.
    pub message: String,
}

/// Summary of one sweep pass.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    /// Due OPEN records found.
    pub scanned: usize,
    /// Aggregations closed with members (window elapse).
    pub closed: usize,
    /// Aggregations expired (hard lifetime, or empty window).
    pub expired: usize,
    /// Abandoned signals published for empty aggregations.
    pub abandoned: usize,
    /// Transitions lost to concurrent arrival-triggered closers.
    pub races_lost: usize,
    /// Per-candidate failures.
    pub errors: Vec<SweepError>,
}

impl SweepSummary {
    /// Returns true if no candidate failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Scans for due aggregations and retires them.
pub struct ExpirySweeper<E: Emitter> {
    store: AggregationStore,
    emitter: E,
    policy: ExpiryPolicy,
    metrics: ReduceMetrics,
}

impl<E: Emitter> ExpirySweeper<E> {
    /// Creates a sweeper.
    #[must_use]
    pub fn new(store: AggregationStore, emitter: E, policy: ExpiryPolicy) -> Self {
        Self {
            store,
            emitter,
            policy,
            metrics: ReduceMetrics::new(),
        }
    }

    /// Runs one sweep pass over all due OPEN aggregations.
    ///
    /// # Errors
    ///
    /// Returns an error only if the initial scan fails; per-candidate
    /// failures land in the summary instead.
    #[tracing::instrument(skip(self), fields(pipeline = %self.store.pipeline_id()))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepSummary> {
        let candidates = self.store.scan_open(now).await?;
        self.metrics.set_sweep_candidates(candidates.len());

        let mut summary = SweepSummary {
            scanned: candidates.len(),
            ..SweepSummary::default()
        };

        for candidate in candidates {
            let key = candidate.record.key.clone();
            let generation = candidate.record.generation;

            match self.retire(candidate, now).await {
                Ok(Some((status, was_abandoned))) => {
                    match status {
                        AggregationStatus::Closed => summary.closed += 1,
                        AggregationStatus::Expired => summary.expired += 1,
                        AggregationStatus::Open => {}
                    }
                    if was_abandoned {
                        summary.abandoned += 1;
                    }
                }
                Ok(None) => summary.races_lost += 1,
                Err(error) => {
                    tracing::warn!(key = %key, generation, %error, "sweep candidate failed");
                    summary.errors.push(SweepError {
                        key: key.to_string(),
                        generation,
                        message: error.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            closed = summary.closed,
            expired = summary.expired,
            abandoned = summary.abandoned,
            races_lost = summary.races_lost,
            errors = summary.errors.len(),
            "sweep pass complete"
        );

        Ok(summary)
    }

    /// Retires one due candidate.
    ///
    /// Returns `Ok(Some((status, abandoned)))` on a won transition,
    /// `Ok(None)` on a lost race.
    async fn retire(
        &self,
        candidate: Versioned,
        now: DateTime<Utc>,
    ) -> Result<Option<(AggregationStatus, bool)>> {
        let record = &candidate.record;
        let key = record.key.clone();
        let generation = record.generation;
        let empty = record.members.is_empty();

        // Hard lifetime beats everything; an elapsed window closes with the
        // members it has, unless there are none to close over.
        let (target, reason) = if record.past_hard_deadline(now) {
            (AggregationStatus::Expired, CloseReason::HardExpiry)
        } else if empty {
            (AggregationStatus::Expired, CloseReason::WindowElapsed)
        } else {
            (AggregationStatus::Closed, CloseReason::WindowElapsed)
        };

        let outcome = match target {
            AggregationStatus::Expired => {
                self.store
                    .try_expire(&key, generation, &candidate.version, reason, now)
                    .await?
            }
            _ => {
                self.store
                    .try_close(&key, generation, &candidate.version, reason, now)
                    .await?
            }
        };

        match outcome {
            TransitionOutcome::Won(retired) => {
                self.metrics.record_retired(target, reason);
                publish_retirement(
                    &self.store,
                    &self.emitter,
                    self.policy,
                    &self.metrics,
                    &retired,
                )
                .await?;
                let abandoned = empty && !self.policy.emit_empty_composite;
                Ok(Some((target, abandoned)))
            }
            TransitionOutcome::Lost => {
                tracing::debug!(key = %key, generation, "sweeper lost retirement race");
                self.metrics.record_race_lost();
                Ok(None)
            }
        }
    }
}
