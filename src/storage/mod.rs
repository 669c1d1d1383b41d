//! Event-stream persistence.
//!
//! This module contains:
//! - `EventStreamRepository` trait: append-only per-aggregate event log,
//!   correlation-indexed integration log, and best-effort snapshot store
//! - `Snapshot`: serialized aggregate state at a known version
//! - Implementations: in-memory, PostgreSQL, Redis (portable KV layout)

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{StorageConfig, StorageType};
use crate::message::VersionedEvent;
use crate::registry::{RegistryError, TypeRegistry};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis-store")]
pub mod redis;

pub use memory::InMemoryEventStreamRepository;
#[cfg(feature = "postgres")]
pub use postgres::PostgresEventStreamRepository;
#[cfg(feature = "redis-store")]
pub use redis::RedisEventStreamRepository;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A concurrent save already claimed one of the versions being written.
    /// Callers retry with freshly loaded state.
    #[error("version conflict for source {source_id} at version {version}")]
    Conflict { source_id: String, version: i64 },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("storage backend: {0}")]
    Backend(String),
}

/// Serialized copy of an aggregate at a known version, used to accelerate
/// reconstruction. Loading begins at `version` instead of 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "sourceID")]
    pub source_id: String,
    #[serde(rename = "aggregateType")]
    pub aggregate_type: String,
    pub version: i64,
    #[serde(rename = "time")]
    pub created: DateTime<Utc>,
    pub body: serde_json::Value,
}

/// Persistence contract for events associated with aggregates by id.
///
/// Guarantees required of every implementation:
/// - `save` appends atomically with respect to a single aggregate stream;
///   concurrent saves with overlapping versions resolve to at most one
///   winner, the loser failing with [`StoreError::Conflict`].
/// - every saved event also enters the integration log (globally ordered by
///   creation time) and the correlation index under its correlation id.
/// - `get` returns events in ascending version order.
/// - snapshots are best-effort and must not lose previously stored
///   snapshots on failure.
#[async_trait]
pub trait EventStreamRepository: Send + Sync {
    /// Appends `events` to the stream of `source_id`, plus the integration
    /// log and correlation index.
    async fn save(&self, source_id: &str, events: &[VersionedEvent]) -> Result<()>;

    /// Returns events with `version >= from_version`, ascending.
    async fn get(&self, source_id: &str, from_version: i64) -> Result<Vec<VersionedEvent>>;

    /// Writes a single event to the integration log and correlation index
    /// without touching any aggregate stream.
    async fn save_integration_event(&self, event: &VersionedEvent) -> Result<()>;

    /// All events sharing a correlation id, ordered by creation time.
    async fn integration_events_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<VersionedEvent>>;

    /// The full global integration log in creation order.
    async fn all_integration_events(&self) -> Result<Vec<VersionedEvent>>;

    /// Stores (or replaces) the snapshot for `snapshot.source_id`.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    /// The latest stored snapshot for `source_id`, if any.
    async fn get_snapshot(&self, source_id: &str) -> Result<Option<Snapshot>>;
}

/// Initialize storage based on configuration.
///
/// Returns the `EventStreamRepository` implementation selected by the
/// storage type discriminator.
pub async fn init_storage(
    config: &StorageConfig,
    registry: Arc<TypeRegistry>,
) -> Result<Arc<dyn EventStreamRepository>> {
    match config.storage_type {
        StorageType::Memory => {
            info!(storage = "memory", "storage initialized");
            let _ = registry;
            Ok(Arc::new(InMemoryEventStreamRepository::new()))
        }
        StorageType::Postgres => {
            #[cfg(feature = "postgres")]
            {
                info!(storage = "postgres", uri = %config.postgres.uri, "storage initialized");
                let store =
                    PostgresEventStreamRepository::connect(config.postgres.resolver(), registry)
                        .await?;
                store.init().await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "postgres"))]
            {
                Err(StoreError::Backend(
                    "postgres storage requires the 'postgres' feature".to_string(),
                ))
            }
        }
        StorageType::Redis => {
            #[cfg(feature = "redis-store")]
            {
                info!(storage = "redis", uri = %config.redis.uri, "storage initialized");
                let store = RedisEventStreamRepository::connect(
                    config.redis.resolver(),
                    registry,
                    &config.redis.prefix,
                )
                .await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "redis-store"))]
            {
                Err(StoreError::Backend(
                    "redis storage requires the 'redis-store' feature".to_string(),
                ))
            }
        }
    }
}
