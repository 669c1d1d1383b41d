//! Redis store contract tests.
//!
//! Run with a server available:
//! `REDIS_URL=redis://localhost:6379 cargo test --test storage_redis -- --ignored`

#![cfg(feature = "redis-store")]

mod common;

use std::sync::Arc;

use chrono::Utc;

use common::{Account, AccountCreditedEvent};
use eventum::storage::RedisEventStreamRepository;
use eventum::{
    ident, static_resolver, EventStreamRepository, Snapshot, StoreError, TypeRegistry,
    VersionedEvent,
};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn registry() -> Arc<TypeRegistry> {
    let registry = Arc::new(TypeRegistry::new());
    registry.register_aggregate::<Account>();
    registry
}

fn credited_event(source_id: &str, version: i64, correlation_id: &str) -> VersionedEvent {
    VersionedEvent {
        id: ident::new_id(),
        correlation_id: correlation_id.to_string(),
        source_id: source_id.to_string(),
        version,
        event_type: "AccountCreditedEvent".to_string(),
        created: Utc::now(),
        event: Arc::new(AccountCreditedEvent {
            amount: version as f64,
        }),
    }
}

async fn store() -> RedisEventStreamRepository {
    RedisEventStreamRepository::connect(static_resolver(redis_url()), registry(), "eventstore")
        .await
        .expect("connect should succeed")
}

#[tokio::test]
#[ignore = "Requires Redis"]
async fn save_get_round_trip() {
    let store = store().await;
    let source_id = ident::new_id();

    store
        .save(
            &source_id,
            &[
                credited_event(&source_id, 1, "corr-redis"),
                credited_event(&source_id, 2, "corr-redis"),
            ],
        )
        .await
        .expect("save should succeed");

    let events = store.get(&source_id, 1).await.expect("get should succeed");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].version, 1);
    assert_eq!(
        events[1].event_as::<AccountCreditedEvent>().map(|e| e.amount),
        Some(2.0)
    );
}

#[tokio::test]
#[ignore = "Requires Redis"]
async fn conditional_write_conflicts_on_existing_version() {
    let store = store().await;
    let source_id = ident::new_id();

    store
        .save(&source_id, &[credited_event(&source_id, 1, "corr-redis")])
        .await
        .expect("first save should succeed");

    let err = store
        .save(&source_id, &[credited_event(&source_id, 1, "corr-redis")])
        .await
        .expect_err("existing key must conflict");
    assert!(matches!(err, StoreError::Conflict { version: 1, .. }));
}

#[tokio::test]
#[ignore = "Requires Redis"]
async fn conflicting_batch_leaves_no_partial_writes() {
    let store = store().await;
    let source_id = ident::new_id();

    store
        .save(&source_id, &[credited_event(&source_id, 1, "corr-redis")])
        .await
        .expect("first save should succeed");

    let err = store
        .save(
            &source_id,
            &[
                credited_event(&source_id, 1, "corr-redis"),
                credited_event(&source_id, 2, "corr-redis"),
            ],
        )
        .await
        .expect_err("overlapping batch must conflict");
    assert!(matches!(err, StoreError::Conflict { .. }));

    // The rejected batch persisted nothing: no event keys, no advanced
    // latest-version pointer, no integration entries.
    let events = store.get(&source_id, 1).await.expect("get should succeed");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].version, 1);
}

#[tokio::test]
#[ignore = "Requires Redis"]
async fn correlation_hash_collects_related_events() {
    let store = store().await;
    let correlation_id = format!("corr-{}", ident::new_id());

    for _ in 0..3 {
        let source_id = ident::new_id();
        store
            .save(&source_id, &[credited_event(&source_id, 1, &correlation_id)])
            .await
            .expect("save should succeed");
    }

    let correlated = store
        .integration_events_by_correlation_id(&correlation_id)
        .await
        .expect("correlation query should succeed");
    assert_eq!(correlated.len(), 3);
    assert!(correlated.windows(2).all(|w| w[0].created <= w[1].created));
}

#[tokio::test]
#[ignore = "Requires Redis"]
async fn unknown_source_reads_empty() {
    let store = store().await;
    let events = store
        .get(&ident::new_id(), 1)
        .await
        .expect("get should succeed");
    assert!(events.is_empty());
}

#[tokio::test]
#[ignore = "Requires Redis"]
async fn snapshot_round_trip() {
    let store = store().await;
    let source_id = ident::new_id();

    store
        .save_snapshot(Snapshot {
            source_id: source_id.clone(),
            aggregate_type: "Account".to_string(),
            version: 5,
            created: Utc::now(),
            body: serde_json::json!({"balance": 5.0}),
        })
        .await
        .expect("snapshot save should succeed");

    let snapshot = store
        .get_snapshot(&source_id)
        .await
        .expect("snapshot query should succeed")
        .expect("snapshot should exist");
    assert_eq!(snapshot.version, 5);
    assert_eq!(snapshot.body["balance"], 5.0);
}
