//! Observability metrics for the reducer.
//!
//! Prometheus-compatible metrics exported through the `metrics` crate
//! facade, designed to support:
//!
//! - **Alerting**: abandoned aggregations and register contention are the
//!   two signals that page someone
//! - **Dashboards**: member throughput, close latency, race rates
//! - **Debugging**: correlating lost races with concurrent worker counts
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `weir_members_registered_total` | Counter | - | Members newly appended |
//! | `weir_members_duplicate_total` | Counter | - | Redeliveries deduplicated |
//! | `weir_members_late_total` | Counter | `policy` | Members arriving after closure |
//! | `weir_aggregations_retired_total` | Counter | `status`, `reason` | Terminal transitions won |
//! | `weir_close_races_lost_total` | Counter | - | CAS transitions lost (expected) |
//! | `weir_emissions_total` | Counter | `outcome` | Emit calls by published/deduplicated |
//! | `weir_aggregations_abandoned_total` | Counter | - | Abandoned signals published |
//! | `weir_sweep_candidates` | Gauge | - | Due records seen by the last sweep |
//! | `weir_batch_size` | Histogram | - | Member-arrival batch sizes |
//!
//! ## Integration
//!
//! Metrics flow to whatever recorder the binary installs; without one they
//! are no-ops. To export to Prometheus:
//!
//! ```rust,ignore
//! use metrics_exporter_prometheus::PrometheusBuilder;
//!
//! PrometheusBuilder::new()
//!     .with_http_listener(([0, 0, 0, 0], 9090))
//!     .install()
//!     .expect("failed to install Prometheus recorder");
//! ```

use metrics::{counter, gauge, histogram};

use crate::record::{AggregationStatus, CloseReason};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: members newly appended to an aggregation.
    pub const MEMBERS_REGISTERED_TOTAL: &str = "weir_members_registered_total";
    /// Counter: duplicate deliveries deduplicated on the member set.
    pub const MEMBERS_DUPLICATE_TOTAL: &str = "weir_members_duplicate_total";
    /// Counter: members that arrived after their aggregation was retired.
    pub const MEMBERS_LATE_TOTAL: &str = "weir_members_late_total";
    /// Counter: terminal transitions won, labeled by status and reason.
    pub const AGGREGATIONS_RETIRED_TOTAL: &str = "weir_aggregations_retired_total";
    /// Counter: CAS transitions lost to a concurrent winner.
    pub const CLOSE_RACES_LOST_TOTAL: &str = "weir_close_races_lost_total";
    /// Counter: emissions, labeled by published/deduplicated outcome.
    pub const EMISSIONS_TOTAL: &str = "weir_emissions_total";
    /// Counter: abandoned-aggregation signals published.
    pub const AGGREGATIONS_ABANDONED_TOTAL: &str = "weir_aggregations_abandoned_total";
    /// Gauge: due records seen by the most recent sweep.
    pub const SWEEP_CANDIDATES: &str = "weir_sweep_candidates";
    /// Histogram: member-arrival batch sizes.
    pub const BATCH_SIZE: &str = "weir_batch_size";
}

/// Handle for recording reducer metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReduceMetrics;

impl ReduceMetrics {
    /// Creates a new metrics handle.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a newly appended member.
    pub fn record_registered(&self) {
        counter!(names::MEMBERS_REGISTERED_TOTAL).increment(1);
    }

    /// Records a deduplicated redelivery.
    pub fn record_duplicate(&self) {
        counter!(names::MEMBERS_DUPLICATE_TOTAL).increment(1);
    }

    /// Records a late member, labeled by the policy that handled it.
    pub fn record_late(&self, policy: &'static str) {
        counter!(names::MEMBERS_LATE_TOTAL, "policy" => policy).increment(1);
    }

    /// Records a won terminal transition.
    pub fn record_retired(&self, status: AggregationStatus, reason: CloseReason) {
        let status = match status {
            AggregationStatus::Open => "open",
            AggregationStatus::Closed => "closed",
            AggregationStatus::Expired => "expired",
        };
        let reason = match reason {
            CloseReason::StrategySatisfied => "strategy_satisfied",
            CloseReason::WindowElapsed => "window_elapsed",
            CloseReason::HardExpiry => "hard_expiry",
        };
        counter!(names::AGGREGATIONS_RETIRED_TOTAL, "status" => status, "reason" => reason)
            .increment(1);
    }

    /// Records a lost CAS race (expected control flow).
    pub fn record_race_lost(&self) {
        counter!(names::CLOSE_RACES_LOST_TOTAL).increment(1);
    }

    /// Records an emission outcome.
    pub fn record_emission(&self, published: bool) {
        let outcome = if published { "published" } else { "deduplicated" };
        counter!(names::EMISSIONS_TOTAL, "outcome" => outcome).increment(1);
    }

    /// Records a published abandoned-aggregation signal.
    pub fn record_abandoned(&self) {
        counter!(names::AGGREGATIONS_ABANDONED_TOTAL).increment(1);
    }

    /// Records the candidate count of a sweep pass.
    pub fn set_sweep_candidates(&self, count: usize) {
        gauge!(names::SWEEP_CANDIDATES).set(count as f64);
    }

    /// Records the size of an arrival batch.
    pub fn observe_batch_size(&self, size: usize) {
        histogram!(names::BATCH_SIZE).record(size as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_prefixed() {
        // One namespace for the whole reducer keeps dashboards greppable.
        for name in [
            names::MEMBERS_REGISTERED_TOTAL,
            names::MEMBERS_DUPLICATE_TOTAL,
            names::MEMBERS_LATE_TOTAL,
            names::AGGREGATIONS_RETIRED_TOTAL,
            names::CLOSE_RACES_LOST_TOTAL,
            names::EMISSIONS_TOTAL,
            names::AGGREGATIONS_ABANDONED_TOTAL,
            names::SWEEP_CANDIDATES,
            names::BATCH_SIZE,
        ] {
            assert!(name.starts_with("weir_"), "unprefixed metric: {name}");
        }
    }

    #[test]
    fn recording_without_a_recorder_is_a_no_op() {
        let metrics = ReduceMetrics::new();
        metrics.record_registered();
        metrics.record_duplicate();
        metrics.record_late("reject");
        metrics.record_retired(AggregationStatus::Closed, CloseReason::StrategySatisfied);
        metrics.record_race_lost();
        metrics.record_emission(true);
        metrics.record_abandoned();
        metrics.set_sweep_candidates(3);
        metrics.observe_batch_size(10);
    }
}
