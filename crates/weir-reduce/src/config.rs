//! Reducer configuration.
//!
//! Configuration is supplied per deployment (one reducer serves one pipeline
//! position): the completion strategy and its parameters, an optional hard
//! maximum aggregation lifetime that overrides every strategy, and the policy
//! for members arriving after their aggregation has already been retired.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::strategy::StrategyConfig;

/// What to do with a member that arrives after its aggregation reached a
/// terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LatePolicy {
    /// Drop the member with a warning. The closed record is never touched.
    #[default]
    Reject,
    /// Route the member to a fresh generation of the same reduction key.
    /// All late members converge on the same fresh aggregation.
    NewAggregation,
}

/// How expiry handles aggregations that never registered a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryPolicy {
    /// When true, an expired zero-member aggregation emits an empty composite
    /// event; when false (the default) it emits a distinct
    /// aggregation-abandoned signal instead.
    #[serde(default)]
    pub emit_empty_composite: bool,
}

/// Per-deployment reducer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReducerConfig {
    /// Completion strategy, fixed for every aggregation this reducer creates.
    pub strategy: StrategyConfig,
    /// Hard maximum aggregation lifetime in seconds, independent of strategy.
    /// Past this deadline the aggregation is expired unconditionally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lifetime_secs: Option<u64>,
    /// Late-member routing policy.
    #[serde(default)]
    pub late_policy: LatePolicy,
    /// Expiry behavior for empty aggregations.
    #[serde(default)]
    pub expiry: ExpiryPolicy,
}

impl ReducerConfig {
    /// Creates a configuration with the given strategy and defaults.
    #[must_use]
    pub fn new(strategy: StrategyConfig) -> Self {
        Self {
            strategy,
            max_lifetime_secs: None,
            late_policy: LatePolicy::default(),
            expiry: ExpiryPolicy::default(),
        }
    }

    /// Sets the hard maximum aggregation lifetime.
    #[must_use]
    pub const fn with_max_lifetime_secs(mut self, secs: u64) -> Self {
        self.max_lifetime_secs = Some(secs);
        self
    }

    /// Sets the late-member policy.
    #[must_use]
    pub const fn with_late_policy(mut self, policy: LatePolicy) -> Self {
        self.late_policy = policy;
        self
    }

    /// Sets the expiry policy.
    #[must_use]
    pub const fn with_expiry(mut self, expiry: ExpiryPolicy) -> Self {
        self.expiry = expiry;
        self
    }

    /// Computes the hard deadline for an aggregation created at `created_at`.
    #[must_use]
    pub fn hard_deadline(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.max_lifetime_secs
            .map(|secs| created_at + Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX)))
    }
}
