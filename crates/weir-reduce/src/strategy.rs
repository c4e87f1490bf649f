//! Completion strategies — pluggable policies deciding when an aggregation
//! is done.
//!
//! Strategies are a tagged variant, not trait objects: adding one means
//! adding a variant here, and the engine dispatches through the single
//! [`StrategyEvaluator::evaluate`] capability without modification. The
//! conditional variant is the extension point for user code — it names a
//! [`Predicate`] registered with the evaluator at construction time.
//!
//! ## Failure posture
//!
//! A predicate error is never treated as completion: it is logged and the
//! aggregation stays pending, to be re-evaluated on the next arrival or by
//! the sweeper. Closing on a transient error would violate at-most-once
//! emission in the worst way — by emitting early.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::record::AggregationRecord;

/// Completion strategy selection and parameters, fixed at aggregation
/// creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StrategyConfig {
    /// Complete once the member count reaches a fixed target.
    CountThreshold {
        /// The member count at which the aggregation closes.
        target: u64,
    },
    /// Close when a wall-clock window elapses, with whatever members have
    /// arrived. Partial sets are valid by design.
    TimeWindow {
        /// Window length in seconds, measured from record creation.
        window_secs: u64,
    },
    /// Complete when a user-supplied predicate over the member set holds.
    Conditional {
        /// Name of a predicate registered with the evaluator.
        predicate: String,
    },
}

/// Result of a completion evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The aggregation is ready to close.
    Complete,
    /// Keep waiting.
    Pending,
}

impl Completion {
    /// Returns true if the aggregation is ready to close.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// User-supplied completion predicate for the conditional strategy.
///
/// Predicates receive the full aggregation record; implementations that need
/// document payloads fetch them from their own object-store handle using the
/// members' [`crate::event::DocumentRef`]s.
#[async_trait]
pub trait Predicate: Send + Sync {
    /// Evaluates the predicate over the current member set.
    ///
    /// # Errors
    ///
    /// Any error is treated as "pending" by the evaluator, never as
    /// completion.
    async fn evaluate(&self, record: &AggregationRecord) -> Result<bool>;
}

#[async_trait]
impl<F> Predicate for F
where
    F: Fn(&AggregationRecord) -> Result<bool> + Send + Sync,
{
    async fn evaluate(&self, record: &AggregationRecord) -> Result<bool> {
        self(record)
    }
}

/// Evaluates completion strategies against aggregation records.
#[derive(Clone, Default)]
pub struct StrategyEvaluator {
    predicates: HashMap<String, Arc<dyn Predicate>>,
}

impl StrategyEvaluator {
    /// Creates an evaluator with an empty predicate registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named predicate for the conditional strategy.
    #[must_use]
    pub fn with_predicate(mut self, name: impl Into<String>, predicate: Arc<dyn Predicate>) -> Self {
        self.predicates.insert(name.into(), predicate);
        self
    }

    /// Checks that a strategy configuration is satisfiable by this evaluator.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero count target, a zero-length window, or a
    /// conditional strategy naming an unregistered predicate.
    pub fn validate(&self, strategy: &StrategyConfig) -> Result<()> {
        match strategy {
            StrategyConfig::CountThreshold { target } => {
                if *target == 0 {
                    return Err(Error::configuration("count threshold target must be >= 1"));
                }
            }
            StrategyConfig::TimeWindow { window_secs } => {
                if *window_secs == 0 {
                    return Err(Error::configuration("time window must be >= 1 second"));
                }
            }
            StrategyConfig::Conditional { predicate } => {
                if !self.predicates.contains_key(predicate) {
                    return Err(Error::UnknownPredicate {
                        name: predicate.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Evaluates the record's strategy.
    ///
    /// Time-window aggregations are never completed by evaluation — their
    /// closure eligibility is wall-clock driven and checked via
    /// [`Self::time_eligible`] on arrival and by the sweeper.
    pub async fn evaluate(&self, record: &AggregationRecord) -> Completion {
        match &record.strategy {
            StrategyConfig::CountThreshold { target } => {
                if record.member_count() >= *target {
                    Completion::Complete
                } else {
                    Completion::Pending
                }
            }
            StrategyConfig::TimeWindow { .. } => Completion::Pending,
            StrategyConfig::Conditional { predicate } => {
                let Some(registered) = self.predicates.get(predicate) else {
                    tracing::warn!(
                        key = %record.key,
                        predicate = %predicate,
                        "conditional strategy names an unregistered predicate; treating as pending"
                    );
                    return Completion::Pending;
                };

                match registered.evaluate(record).await {
                    Ok(true) => Completion::Complete,
                    Ok(false) => Completion::Pending,
                    Err(error) => {
                        tracing::warn!(
                            key = %record.key,
                            predicate = %predicate,
                            %error,
                            "predicate evaluation failed; treating as pending"
                        );
                        Completion::Pending
                    }
                }
            }
        }
    }

    /// Returns true if the record is a time-window aggregation whose window
    /// has elapsed, making it eligible for closure with its current
    /// (possibly partial) member set.
    #[must_use]
    pub fn time_eligible(record: &AggregationRecord, now: DateTime<Utc>) -> bool {
        record.window_elapsed(now)
    }
}

impl std::fmt::Debug for StrategyEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.predicates.keys().collect();
        names.sort();
        f.debug_struct("StrategyEvaluator")
            .field("predicates", &names)
            .finish()
    }
}
