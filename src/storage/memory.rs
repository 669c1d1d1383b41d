//! In-memory event-stream repository.
//!
//! Keeps decoded events, the integration log, the correlation index, and
//! snapshots behind a single lock (the store is shared across dispatcher
//! tasks). Useful for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{EventStreamRepository, Result, Snapshot, StoreError};
use crate::message::VersionedEvent;

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Vec<VersionedEvent>>,
    integration: Vec<VersionedEvent>,
    correlation: HashMap<String, Vec<VersionedEvent>>,
    snapshots: HashMap<String, Snapshot>,
}

/// Event-stream repository backed by process memory.
#[derive(Default)]
pub struct InMemoryEventStreamRepository {
    inner: RwLock<Inner>,
}

impl InMemoryEventStreamRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn append_integration(&mut self, event: &VersionedEvent) {
        self.integration.push(event.clone());
        self.correlation
            .entry(event.correlation_id.clone())
            .or_default()
            .push(event.clone());
    }
}

#[async_trait]
impl EventStreamRepository for InMemoryEventStreamRepository {
    async fn save(&self, source_id: &str, events: &[VersionedEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let stream = inner.streams.entry(source_id.to_string()).or_default();

        // Optimistic concurrency: the batch must continue the stream.
        let expected = stream.last().map(|event| event.version + 1).unwrap_or(1);
        let first = events[0].version;
        if first != expected {
            return Err(StoreError::Conflict {
                source_id: source_id.to_string(),
                version: first,
            });
        }

        stream.extend_from_slice(events);
        for event in events {
            inner.append_integration(event);
        }
        Ok(())
    }

    async fn get(&self, source_id: &str, from_version: i64) -> Result<Vec<VersionedEvent>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .streams
            .get(source_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|event| event.version >= from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save_integration_event(&self, event: &VersionedEvent) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.append_integration(event);
        Ok(())
    }

    async fn integration_events_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<VersionedEvent>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut events = inner
            .correlation
            .get(correlation_id)
            .cloned()
            .unwrap_or_default();
        events.sort_by_key(|event| event.created);
        Ok(events)
    }

    async fn all_integration_events(&self) -> Result<Vec<VersionedEvent>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut events = inner.integration.clone();
        events.sort_by_key(|event| event.created);
        Ok(events)
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.snapshots.insert(snapshot.source_id.clone(), snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, source_id: &str) -> Result<Option<Snapshot>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.snapshots.get(source_id).cloned())
    }
}
