//! PostgreSQL store contract tests.
//!
//! Run with a database available:
//! `POSTGRES_URL=postgres://postgres@localhost/eventum_test \
//!  cargo test --test storage_postgres -- --ignored`

#![cfg(feature = "postgres")]

mod common;

use std::sync::Arc;

use chrono::Utc;

use common::{Account, AccountCreatedEvent};
use eventum::storage::PostgresEventStreamRepository;
use eventum::{
    ident, static_resolver, EventStreamRepository, Snapshot, StoreError, TypeRegistry,
    VersionedEvent,
};

fn postgres_url() -> String {
    std::env::var("POSTGRES_URL")
        .unwrap_or_else(|_| "postgres://postgres@localhost/eventum_test".to_string())
}

fn registry() -> Arc<TypeRegistry> {
    let registry = Arc::new(TypeRegistry::new());
    registry.register_aggregate::<Account>();
    registry
}

fn created_event(source_id: &str, version: i64, correlation_id: &str) -> VersionedEvent {
    VersionedEvent {
        id: ident::new_id(),
        correlation_id: correlation_id.to_string(),
        source_id: source_id.to_string(),
        version,
        event_type: "AccountCreatedEvent".to_string(),
        created: Utc::now(),
        event: Arc::new(AccountCreatedEvent {
            first_name: "John".to_string(),
            last_name: "Snow".to_string(),
            email_address: "john@example.com".to_string(),
            initial_balance: version as f64,
        }),
    }
}

async fn store() -> PostgresEventStreamRepository {
    let store = PostgresEventStreamRepository::connect(static_resolver(postgres_url()), registry())
        .await
        .expect("connect should succeed");
    store.init().await.expect("init should succeed");
    store
}

#[tokio::test]
#[ignore = "Requires PostgreSQL"]
async fn save_get_round_trip() {
    let store = store().await;
    let source_id = ident::new_id();

    store
        .save(
            &source_id,
            &[
                created_event(&source_id, 1, "corr-pg"),
                created_event(&source_id, 2, "corr-pg"),
            ],
        )
        .await
        .expect("save should succeed");

    let events = store.get(&source_id, 1).await.expect("get should succeed");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].version, 1);
    assert_eq!(events[1].version, 2);
    assert!(events[0].event_as::<AccountCreatedEvent>().is_some());

    let tail = store.get(&source_id, 2).await.expect("get should succeed");
    assert_eq!(tail.len(), 1);
}

#[tokio::test]
#[ignore = "Requires PostgreSQL"]
async fn duplicate_version_conflicts() {
    let store = store().await;
    let source_id = ident::new_id();

    store
        .save(&source_id, &[created_event(&source_id, 1, "corr-pg")])
        .await
        .expect("first save should succeed");

    let err = store
        .save(&source_id, &[created_event(&source_id, 1, "corr-pg")])
        .await
        .expect_err("duplicate version must conflict");
    assert!(matches!(err, StoreError::Conflict { version: 1, .. }));
}

#[tokio::test]
#[ignore = "Requires PostgreSQL"]
async fn correlation_index_and_integration_log() {
    let store = store().await;
    let correlation_id = format!("corr-{}", ident::new_id());

    for _ in 0..3 {
        let source_id = ident::new_id();
        store
            .save(&source_id, &[created_event(&source_id, 1, &correlation_id)])
            .await
            .expect("save should succeed");
    }

    let correlated = store
        .integration_events_by_correlation_id(&correlation_id)
        .await
        .expect("correlation query should succeed");
    assert_eq!(correlated.len(), 3);
    assert!(correlated.windows(2).all(|w| w[0].created <= w[1].created));

    let all = store
        .all_integration_events()
        .await
        .expect("integration query should succeed");
    assert!(all.len() >= 3);
}

#[tokio::test]
#[ignore = "Requires PostgreSQL"]
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

    store
        .save_snapshot(Snapshot {
            source_id: source_id.clone(),
            aggregate_type: "Account".to_string(),
            version: 10,
            created: Utc::now(),
            body: serde_json::json!({"balance": 10.0}),
        })
        .await
        .expect("snapshot replace should succeed");

    let snapshot = store
        .get_snapshot(&source_id)
        .await
        .expect("snapshot query should succeed")
        .expect("snapshot should exist");
    assert_eq!(snapshot.version, 10);
    assert_eq!(snapshot.body["balance"], 10.0);
}
