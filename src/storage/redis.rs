//! Redis event-stream repository using the portable key-value layout.
//!
//! Key scheme:
//! - `{prefix}:{sourceID}:{version}` → event envelope (whole batch claimed
//!   atomically with MSETNX, so a version conflict writes nothing)
//! - `{prefix}:{sourceID}` → latest version pointer
//! - `eventstore:integration` → atomically incremented counter
//! - `eventstore:integration:{counter}` → integration log entry
//! - `eventstore:correlation:{correlationID}` → hash of event id → envelope
//! - `{prefix}:snapshot:{sourceID}` → snapshot

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{EventStreamRepository, Result, Snapshot, StoreError};
use crate::message::{EventEnvelope, VersionedEvent};
use crate::registry::TypeRegistry;
use crate::ConnectionStringResolver;

const INTEGRATION_COUNTER_KEY: &str = "eventstore:integration";
const CORRELATION_KEY_PREFIX: &str = "eventstore:correlation";

/// Event-stream repository backed by Redis.
pub struct RedisEventStreamRepository {
    manager: ConnectionManager,
    registry: Arc<TypeRegistry>,
    prefix: String,
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl RedisEventStreamRepository {
    /// Connects using the resolved connection string. The connection manager
    /// transparently re-establishes dropped connections.
    pub async fn connect(
        resolver: ConnectionStringResolver,
        registry: Arc<TypeRegistry>,
        prefix: &str,
    ) -> Result<Self> {
        let uri = resolver()
            .map_err(|err| StoreError::Backend(format!("resolving connection string: {err}")))?;
        let client = redis::Client::open(uri.as_str())?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            registry,
            prefix: prefix.to_string(),
        })
    }

    fn event_key(&self, source_id: &str, version: i64) -> String {
        format!("{}:{}:{}", self.prefix, source_id, version)
    }

    fn latest_key(&self, source_id: &str) -> String {
        format!("{}:{}", self.prefix, source_id)
    }

    fn snapshot_key(&self, source_id: &str) -> String {
        format!("{}:snapshot:{}", self.prefix, source_id)
    }

    fn encode(&self, event: &VersionedEvent) -> Result<String> {
        let envelope = self.registry.encode_event(event)?;
        serde_json::to_string(&envelope)
            .map_err(|err| StoreError::Backend(format!("encoding envelope: {err}")))
    }

    fn decode(&self, raw: &str) -> Result<VersionedEvent> {
        let envelope: EventEnvelope = serde_json::from_str(raw)
            .map_err(|err| StoreError::Backend(format!("parsing envelope: {err}")))?;
        Ok(self.registry.decode_event(envelope)?)
    }

    async fn append_integration(
        &self,
        connection: &mut ConnectionManager,
        event: &VersionedEvent,
        raw: &str,
    ) -> Result<()> {
        let counter: i64 = connection.incr(INTEGRATION_COUNTER_KEY, 1).await?;
        let _: () = connection
            .set(format!("{INTEGRATION_COUNTER_KEY}:{counter}"), raw)
            .await?;
        let _: () = connection
            .hset(
                format!("{CORRELATION_KEY_PREFIX}:{}", event.correlation_id),
                &event.id,
                raw,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventStreamRepository for RedisEventStreamRepository {
    async fn save(&self, source_id: &str, events: &[VersionedEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut connection = self.manager.clone();
        let mut raws = Vec::with_capacity(events.len());
        for event in events {
            raws.push(self.encode(event)?);
        }
        let entries: Vec<(String, &str)> = events
            .iter()
            .zip(&raws)
            .map(|(event, raw)| (self.event_key(source_id, event.version), raw.as_str()))
            .collect();

        // MSETNX claims every version slot of the batch or none of them,
        // so a rejected save leaves nothing behind.
        let claimed: bool = connection.mset_nx(&entries).await?;
        if !claimed {
            for event in events {
                let taken: bool = connection
                    .exists(self.event_key(source_id, event.version))
                    .await?;
                if taken {
                    return Err(StoreError::Conflict {
                        source_id: source_id.to_string(),
                        version: event.version,
                    });
                }
            }
            return Err(StoreError::Conflict {
                source_id: source_id.to_string(),
                version: events[0].version,
            });
        }

        if let Some(last) = events.last() {
            let _: () = connection
                .set(self.latest_key(source_id), last.version)
                .await?;
        }
        for (event, raw) in events.iter().zip(&raws) {
            self.append_integration(&mut connection, event, raw).await?;
        }
        Ok(())
    }

    async fn get(&self, source_id: &str, from_version: i64) -> Result<Vec<VersionedEvent>> {
        let mut connection = self.manager.clone();
        let latest: Option<i64> = connection.get(self.latest_key(source_id)).await?;
        let Some(latest) = latest else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        for version in from_version.max(1)..=latest {
            let raw: Option<String> = connection.get(self.event_key(source_id, version)).await?;
            let raw = raw.ok_or_else(|| {
                StoreError::Backend(format!("missing event {source_id}:{version}"))
            })?;
            events.push(self.decode(&raw)?);
        }
        Ok(events)
    }

    async fn save_integration_event(&self, event: &VersionedEvent) -> Result<()> {
        let mut connection = self.manager.clone();
        let raw = self.encode(event)?;
        self.append_integration(&mut connection, event, &raw).await
    }

    async fn integration_events_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<VersionedEvent>> {
        let mut connection = self.manager.clone();
        let entries: Vec<String> = connection
            .hvals(format!("{CORRELATION_KEY_PREFIX}:{correlation_id}"))
            .await?;
        let mut events = entries
            .iter()
            .map(|raw| self.decode(raw))
            .collect::<Result<Vec<_>>>()?;
        events.sort_by_key(|event| event.created);
        Ok(events)
    }

    async fn all_integration_events(&self) -> Result<Vec<VersionedEvent>> {
        let mut connection = self.manager.clone();
        let counter: Option<i64> = connection.get(INTEGRATION_COUNTER_KEY).await?;
        let Some(counter) = counter else {
            return Ok(Vec::new());
        };

        let mut events = Vec::with_capacity(counter as usize);
        for entry in 1..=counter {
            let raw: Option<String> = connection
                .get(format!("{INTEGRATION_COUNTER_KEY}:{entry}"))
                .await?;
            let raw = raw
                .ok_or_else(|| StoreError::Backend(format!("missing integration entry {entry}")))?;
            events.push(self.decode(&raw)?);
        }
        events.sort_by_key(|event| event.created);
        Ok(events)
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let mut connection = self.manager.clone();
        let raw = serde_json::to_string(&snapshot)
            .map_err(|err| StoreError::Backend(format!("encoding snapshot: {err}")))?;
        let _: () = connection
            .set(self.snapshot_key(&snapshot.source_id), raw)
            .await?;
        Ok(())
    }

    async fn get_snapshot(&self, source_id: &str) -> Result<Option<Snapshot>> {
        let mut connection = self.manager.clone();
        let raw: Option<String> = connection.get(self.snapshot_key(source_id)).await?;
        match raw {
            Some(raw) => {
                let snapshot = serde_json::from_str(&raw)
                    .map_err(|err| StoreError::Backend(format!("parsing snapshot: {err}")))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }
}
