//! # weir-reduce
//!
//! Fan-in event reducer for document pipelines.
//!
//! Upstream stages fan one input out into many member events; this crate
//! folds them back. It collects members sharing a chain identifier into an
//! aggregation, evaluates a pluggable completion strategy on every arrival,
//! and — once the strategy is satisfied, a time window elapses, or a hard
//! lifetime expires — emits exactly one composite event describing the set
//! as a node/edge graph, then retires the aggregation for good.
//!
//! ## Guarantees
//!
//! - **At-most-once emission** per aggregation, under any number of
//!   concurrent, redelivered, out-of-order arrivals
//! - **No lost members**: everything registered before closure appears in
//!   the composite
//! - **Deterministic output**: the composite depends only on the final
//!   member set, never on arrival order
//!
//! Workers are stateless and horizontally scaled; the sole synchronization
//! mechanism is the state store's conditional write. See [`engine`] for the
//! discipline.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weir_core::{MemberId, MemoryBackend, ScopedStorage};
//! use weir_reduce::config::ReducerConfig;
//! use weir_reduce::emit::InMemoryEmitter;
//! use weir_reduce::engine::AggregationEngine;
//! use weir_reduce::event::{DocumentRef, MemberEvent};
//! use weir_reduce::store::AggregationStore;
//! use weir_reduce::strategy::{StrategyConfig, StrategyEvaluator};
//!
//! # async fn run() -> weir_reduce::error::Result<()> {
//! let storage = ScopedStorage::new(Arc::new(MemoryBackend::new()), "ingest")?;
//! let engine = AggregationEngine::new(
//!     AggregationStore::new(storage),
//!     StrategyEvaluator::new(),
//!     InMemoryEmitter::new(),
//!     ReducerConfig::new(StrategyConfig::CountThreshold { target: 3 }),
//! )?;
//!
//! let event = MemberEvent::document_created(
//!     "chain-7f3a",
//!     MemberId::new("etag-a")?,
//!     DocumentRef::new("s3://bucket/a.txt", "text/plain", "etag-a"),
//! );
//! let outcome = engine.handle(&event).await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod composite;
pub mod config;
pub mod correlation;
pub mod emit;
pub mod engine;
pub mod error;
pub mod event;
pub mod metrics;
pub mod record;
pub mod store;
pub mod strategy;
pub mod sweeper;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::composite::{CompositeBuilder, CompositeEdge, CompositeEvent, CompositeNode};
    pub use crate::config::{ExpiryPolicy, LatePolicy, ReducerConfig};
    pub use crate::correlation::CorrelationResolver;
    pub use crate::emit::{AbandonedAggregation, EmitResult, Emitter, InMemoryEmitter, StorageEmitter};
    pub use crate::engine::{AggregationEngine, BatchSummary, ReduceOutcome};
    pub use crate::error::{Error, Result};
    pub use crate::event::{DocumentRef, MemberEvent, Relationship};
    pub use crate::metrics::ReduceMetrics;
    pub use crate::record::{AggregationRecord, AggregationStatus, CloseReason, MemberRef, Versioned};
    pub use crate::store::{AggregationStore, RegisterOutcome, TransitionOutcome};
    pub use crate::strategy::{Completion, Predicate, StrategyConfig, StrategyEvaluator};
    pub use crate::sweeper::{ExpirySweeper, SweepSummary};
}
