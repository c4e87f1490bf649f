//! End-to-end flows through the engine and sweeper for each strategy.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use weir_core::{MemberId, MemoryBackend, ReductionKey, ScopedStorage};
use weir_reduce::config::{ExpiryPolicy, ReducerConfig};
use weir_reduce::emit::InMemoryEmitter;
use weir_reduce::engine::{AggregationEngine, ReduceOutcome};
use weir_reduce::event::{DocumentRef, MemberEvent, Relationship};
use weir_reduce::record::{AggregationRecord, CloseReason, MemberRef};
use weir_reduce::store::AggregationStore;
use weir_reduce::strategy::{Predicate, StrategyConfig, StrategyEvaluator};
use weir_reduce::sweeper::ExpirySweeper;

fn fixture(
    config: ReducerConfig,
    evaluator: StrategyEvaluator,
) -> (
    AggregationStore,
    Arc<InMemoryEmitter>,
    AggregationEngine<Arc<InMemoryEmitter>>,
) {
    let storage = ScopedStorage::new(Arc::new(MemoryBackend::new()), "ingest").unwrap();
    let store = AggregationStore::new(storage);
    let emitter = Arc::new(InMemoryEmitter::new());
    let engine =
        AggregationEngine::new(store.clone(), evaluator, Arc::clone(&emitter), config).unwrap();
    (store, emitter, engine)
}

fn event(chain: &str, member: &str) -> MemberEvent {
    MemberEvent::document_created(
        chain,
        MemberId::new_unchecked(member),
        DocumentRef::new(format!("s3://b/{member}"), "text/plain", member),
    )
}

/// Count-threshold flow with relationships: the composite carries the graph
/// structure the members declared.
#[tokio::test]
async fn count_flow_builds_the_declared_graph() {
    let (_, emitter, engine) = fixture(
        ReducerConfig::new(StrategyConfig::CountThreshold { target: 3 }),
        StrategyEvaluator::new(),
    );

    let source = event("chain-g", "source.pdf");
    let text = MemberEvent::document_created(
        "chain-g",
        MemberId::new_unchecked("extract.txt"),
        DocumentRef::new("s3://b/extract.txt", "text/plain", "extract.txt"),
    )
    .with_relationship(Relationship::new(
        "derived-from",
        MemberId::new_unchecked("source.pdf"),
    ));
    let summary = MemberEvent::document_created(
        "chain-g",
        MemberId::new_unchecked("summary.txt"),
        DocumentRef::new("s3://b/summary.txt", "text/plain", "summary.txt"),
    )
    .with_relationship(Relationship::new(
        "derived-from",
        MemberId::new_unchecked("extract.txt"),
    ));

    engine.handle(&source).await.unwrap();
    engine.handle(&text).await.unwrap();
    let outcome = engine.handle(&summary).await.unwrap();
    assert!(matches!(outcome, ReduceOutcome::Closed { .. }));

    let composite = &emitter.composites()[0];
    assert_eq!(composite.nodes.len(), 3);
    assert_eq!(composite.edges.len(), 2);
    composite.validate().unwrap();

    // Edges are sorted by (from, to, type).
    assert_eq!(composite.edges[0].from.as_str(), "extract.txt");
    assert_eq!(composite.edges[0].to.as_str(), "source.pdf");
    assert_eq!(composite.edges[1].from.as_str(), "summary.txt");
}

/// Time-window flow: members pool while the window is open; the first
/// arrival past the deadline closes opportunistically with a partial set.
#[tokio::test]
async fn window_closes_opportunistically_on_late_arrival() {
    let (store, emitter, engine) = fixture(
        ReducerConfig::new(StrategyConfig::TimeWindow { window_secs: 60 }),
        StrategyEvaluator::new(),
    );

    // Seed the aggregation as if its first member arrived 2 minutes ago.
    let key = ReductionKey::new_unchecked("chain-w");
    let config = ReducerConfig::new(StrategyConfig::TimeWindow { window_secs: 60 });
    store
        .register_member(
            &key,
            0,
            MemberRef {
                member_id: MemberId::new_unchecked("early"),
                event_id: "e".into(),
                document: DocumentRef::new("s3://b/early", "text/plain", "early"),
                sequence: None,
                relationships: Vec::new(),
                attributes: serde_json::Map::new(),
                registered_at: Utc::now() - Duration::seconds(120),
            },
            &config,
            Utc::now() - Duration::seconds(120),
        )
        .await
        .unwrap();

    // The next arrival lands after the window deadline: it registers and
    // then closes the aggregation with both members.
    let outcome = engine.handle(&event("chain-w", "late-but-in")).await.unwrap();
    let ReduceOutcome::Closed { emit, .. } = outcome else {
        panic!("expected opportunistic window close, got {outcome:?}");
    };
    assert!(emit.is_published());

    let composite = &emitter.composites()[0];
    assert_eq!(composite.nodes.len(), 2);
    assert_eq!(composite.close_reason, CloseReason::WindowElapsed);
}

/// Time-window flow via the sweeper: a silent window is closed with its
/// partial member set; a member arriving afterwards is rejected.
#[tokio::test]
async fn window_sweep_then_late_rejection() {
    let (store, emitter, engine) = fixture(
        ReducerConfig::new(StrategyConfig::TimeWindow { window_secs: 60 }),
        StrategyEvaluator::new(),
    );
    let sweeper = ExpirySweeper::new(
        store.clone(),
        Arc::clone(&emitter),
        ExpiryPolicy::default(),
    );

    let key = ReductionKey::new_unchecked("chain-s");
    let config = ReducerConfig::new(StrategyConfig::TimeWindow { window_secs: 60 });
    let past = Utc::now() - Duration::seconds(120);
    store
        .register_member(
            &key,
            0,
            MemberRef {
                member_id: MemberId::new_unchecked("only"),
                event_id: "e".into(),
                document: DocumentRef::new("s3://b/only", "text/plain", "only"),
                sequence: None,
                relationships: Vec::new(),
                attributes: serde_json::Map::new(),
                registered_at: past,
            },
            &config,
            past,
        )
        .await
        .unwrap();

    let summary = sweeper.sweep(Utc::now()).await.unwrap();
    assert_eq!(summary.closed, 1);
    assert_eq!(emitter.composites().len(), 1);

    let outcome = engine.handle(&event("chain-s", "too-late")).await.unwrap();
    assert!(matches!(outcome, ReduceOutcome::LateRejected { .. }));
    assert_eq!(emitter.composites()[0].nodes.len(), 1);
}

/// A predicate that fails leaves the aggregation open; a later arrival that
/// makes it succeed closes it.
#[tokio::test]
async fn conditional_recovers_from_predicate_failure() {
    struct FlakyThenCount {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Predicate for FlakyThenCount {
        async fn evaluate(
            &self,
            record: &AggregationRecord,
        ) -> weir_reduce::error::Result<bool> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(weir_reduce::error::Error::storage(
                    "payload fetch timed out",
                ));
            }
            Ok(record.member_count() >= 2)
        }
    }

    let evaluator = StrategyEvaluator::new().with_predicate(
        "flaky",
        Arc::new(FlakyThenCount {
            calls: AtomicU32::new(0),
        }),
    );
    let (_, emitter, engine) = fixture(
        ReducerConfig::new(StrategyConfig::Conditional {
            predicate: "flaky".into(),
        }),
        evaluator,
    );

    // First arrival: the predicate throws; the aggregation must stay open.
    let outcome = engine.handle(&event("chain-c", "a")).await.unwrap();
    assert!(matches!(outcome, ReduceOutcome::Registered { .. }));
    assert_eq!(emitter.published_count(), 0);

    // Second arrival: the predicate evaluates cleanly and closes.
    let outcome = engine.handle(&event("chain-c", "b")).await.unwrap();
    assert!(matches!(outcome, ReduceOutcome::Closed { .. }));
    assert_eq!(emitter.published_count(), 1);
}

/// The hard lifetime reaps a stalled count-threshold aggregation through the
/// sweeper, surfacing a partial composite rather than silence.
#[tokio::test]
async fn stalled_aggregation_surfaces_via_hard_expiry() {
    let (store, emitter, _) = fixture(
        ReducerConfig::new(StrategyConfig::CountThreshold { target: 5 }),
        StrategyEvaluator::new(),
    );
    let sweeper = ExpirySweeper::new(
        store.clone(),
        Arc::clone(&emitter),
        ExpiryPolicy::default(),
    );

    let config = ReducerConfig::new(StrategyConfig::CountThreshold { target: 5 })
        .with_max_lifetime_secs(3600);
    let past = Utc::now() - Duration::seconds(7200);
    store
        .register_member(
            &ReductionKey::new_unchecked("chain-h"),
            0,
            MemberRef {
                member_id: MemberId::new_unchecked("stuck"),
                event_id: "e".into(),
                document: DocumentRef::new("s3://b/stuck", "text/plain", "stuck"),
                sequence: None,
                relationships: Vec::new(),
                attributes: serde_json::Map::new(),
                registered_at: past,
            },
            &config,
            past,
        )
        .await
        .unwrap();

    let summary = sweeper.sweep(Utc::now()).await.unwrap();
    assert_eq!(summary.expired, 1);
    assert_eq!(summary.abandoned, 0);

    let composite = &emitter.composites()[0];
    assert_eq!(composite.close_reason, CloseReason::HardExpiry);
    assert_eq!(composite.nodes.len(), 1);
}

/// Batch processing: one bad item is reported, the rest of the batch lands.
#[tokio::test]
async fn batch_partial_failure_reporting() {
    let (_, emitter, engine) = fixture(
        ReducerConfig::new(StrategyConfig::CountThreshold { target: 3 }),
        StrategyEvaluator::new(),
    );

    let mut no_chain = event("chain-b", "poison");
    no_chain.chain_id = None;

    let batch = vec![
        event("chain-b", "a"),
        no_chain,
        event("chain-b", "b"),
        event("chain-b", "c"),
    ];

    let summary = engine.handle_batch(&batch).await;
    assert_eq!(summary.outcomes.len(), 3);
    assert_eq!(summary.rejections.len(), 1);
    assert!(summary.failures.is_empty());

    // The three good members closed the aggregation despite the poison item.
    assert_eq!(emitter.published_count(), 1);
    assert_eq!(emitter.composites()[0].nodes.len(), 3);
}
