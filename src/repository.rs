//! Event-sourcing repository: the write engine.
//!
//! `save` turns an aggregate's pending events into versioned, correlated,
//! timestamped records, persists them through the stream repository, takes
//! snapshots per policy, and publishes the batch once it is durable.
//! `get` replays persisted events above the aggregate's current version.

use std::any::TypeId;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::aggregate::AggregateRoot;
use crate::bus::{BusError, VersionedEventPublisher};
use crate::ident;
use crate::message::VersionedEvent;
use crate::registry::{short_type_name, RegistryError, TypeRegistry};
use crate::storage::{EventStreamRepository, Snapshot, StoreError};

/// Snapshots are taken whenever the latest version is a multiple of this,
/// unless overridden per repository.
pub const DEFAULT_SNAPSHOT_INTERVAL: i64 = 5;

/// Errors surfaced by the write engine.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// No events (and no snapshot) exist for the requested aggregate.
    #[error("aggregate {0} not found")]
    NotFound(String),

    /// A persisted event has no registered handler on the aggregate being
    /// loaded. This is a programming error: the load cannot proceed.
    #[error("cannot find handler for event type {0}")]
    MissingHandler(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("publishing events: {0}")]
    Publish(#[from] BusError),

    #[error("serializing snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Repository for event-sourced aggregates.
pub struct EventSourcingRepository {
    registry: Arc<TypeRegistry>,
    store: Arc<dyn EventStreamRepository>,
    publisher: Option<Arc<dyn VersionedEventPublisher>>,
    snapshot_interval: i64,
}

impl EventSourcingRepository {
    /// A repository that persists but does not publish.
    pub fn new(store: Arc<dyn EventStreamRepository>, registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            store,
            publisher: None,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }

    /// A repository that publishes each saved batch once it is durable.
    pub fn with_publisher(
        store: Arc<dyn EventStreamRepository>,
        registry: Arc<TypeRegistry>,
        publisher: Arc<dyn VersionedEventPublisher>,
    ) -> Self {
        Self {
            registry,
            store,
            publisher: Some(publisher),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }

    /// Overrides the snapshot interval. Values below 1 disable
    /// interval-driven snapshots; the aggregate hint still applies.
    pub fn snapshot_interval(mut self, interval: i64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// The registry this repository resolves names through.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// The underlying stream repository, e.g. for integration-log queries.
    pub fn event_stream_repository(&self) -> &Arc<dyn EventStreamRepository> {
        &self.store
    }

    /// Persists the aggregate's pending events and publishes them.
    ///
    /// Versions are assigned contiguously above the aggregate's current
    /// version; every event gets a fresh id, the registered name of its
    /// shape, the (possibly generated) correlation id, and a UTC timestamp.
    /// With no pending events and no snapshot hint this is a no-op that
    /// returns an empty batch. Snapshot failures are logged, never
    /// propagated; publish failures propagate after the events are already
    /// durable (at-least-once publication).
    pub async fn save<A: AggregateRoot>(
        &self,
        aggregate: &mut A,
        correlation_id: Option<&str>,
    ) -> Result<Vec<VersionedEvent>, RepositoryError> {
        let correlation_id = match correlation_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => ident::new_id(),
        };

        let source_id = aggregate.id().to_string();
        let base = aggregate.version();
        let mut events = Vec::with_capacity(aggregate.events().len());
        for (index, payload) in aggregate.events().iter().enumerate() {
            let event_type = self
                .registry
                .name_of((**payload).type_id())
                .ok_or_else(|| {
                    RegistryError::UnregisteredShape(format!("{:?}", (**payload).type_id()))
                })?;
            events.push(VersionedEvent {
                id: ident::new_id(),
                correlation_id: correlation_id.clone(),
                source_id: source_id.clone(),
                version: base + 1 + index as i64,
                event_type,
                created: Utc::now(),
                event: Arc::clone(payload),
            });
        }

        if let Some(last) = events.last() {
            aggregate.set_version(last.version);
        }
        let latest = aggregate.version();

        if !events.is_empty() {
            self.store.save(&source_id, &events).await?;
            aggregate.event_source_mut().clear_pending();
            debug!(
                source_id,
                count = events.len(),
                latest,
                "events persisted"
            );
        }

        let interval_hit =
            self.snapshot_interval >= 1 && !events.is_empty() && latest % self.snapshot_interval == 0;
        if aggregate.wants_to_save_snapshot() || interval_hit {
            if let Err(err) = self.save_snapshot(aggregate).await {
                warn!(source_id, error = %err, "snapshot save failed");
            }
            aggregate.event_source_mut().clear_snapshot_hint();
        }

        if events.is_empty() {
            return Ok(events);
        }

        if let Some(publisher) = &self.publisher {
            publisher.publish_events(events.clone()).await?;
        }

        Ok(events)
    }

    /// Applies persisted events with `version > aggregate.version()` to the
    /// aggregate, in ascending version order.
    ///
    /// A fresh aggregate (version 0) with no history is `NotFound`; an
    /// aggregate already at the latest version is a no-op. Every applied
    /// event's type must reverse-resolve in the registry and have a handler
    /// on the aggregate, or the load fails.
    pub async fn get<A: AggregateRoot>(
        &self,
        id: &str,
        aggregate: &mut A,
    ) -> Result<(), RepositoryError> {
        let events = self.store.get(id, aggregate.version() + 1).await?;
        if events.is_empty() {
            if aggregate.version() == 0 {
                return Err(RepositoryError::NotFound(id.to_string()));
            }
            return Ok(());
        }

        let handlers = self.registry.get_handlers::<A>();
        for event in &events {
            if self.registry.get_type_by_name(&event.event_type).is_none() {
                return Err(RegistryError::UnknownType(event.event_type.clone()).into());
            }
            if !handlers.apply(aggregate, event.event.as_ref()) {
                return Err(RepositoryError::MissingHandler(event.event_type.clone()));
            }
        }
        if let Some(last) = events.last() {
            aggregate.set_version(last.version);
        }
        Ok(())
    }

    /// Loads the persisted snapshot for `id`, if any. Callers follow with
    /// [`get`](Self::get) to apply events above the snapshot's version.
    pub async fn get_snapshot<A: AggregateRoot>(
        &self,
        id: &str,
    ) -> Result<Option<A>, RepositoryError> {
        let Some(snapshot) = self.store.get_snapshot(id).await? else {
            return Ok(None);
        };
        let mut aggregate: A = serde_json::from_value(snapshot.body)?;
        aggregate
            .event_source_mut()
            .rebind::<A>(&snapshot.source_id, snapshot.version);
        debug!(
            source_id = id,
            version = snapshot.version,
            "aggregate restored from snapshot"
        );
        Ok(Some(aggregate))
    }

    /// Reconstructs an aggregate from its history: snapshot first when one
    /// exists, then replay of the remaining events.
    pub async fn new_from_history<A: AggregateRoot + Default>(
        &self,
        id: &str,
    ) -> Result<A, RepositoryError> {
        let mut aggregate = match self.get_snapshot::<A>(id).await? {
            Some(aggregate) => aggregate,
            None => {
                let mut aggregate = A::default();
                aggregate.event_source_mut().rebind::<A>(id, 0);
                aggregate
            }
        };
        self.get(id, &mut aggregate).await?;
        Ok(aggregate)
    }

    async fn save_snapshot<A: AggregateRoot>(&self, aggregate: &A) -> Result<(), RepositoryError> {
        let body = serde_json::to_value(aggregate)?;
        let aggregate_type = self
            .registry
            .name_of(TypeId::of::<A>())
            .unwrap_or_else(|| short_type_name::<A>().to_string());
        self.store
            .save_snapshot(Snapshot {
                source_id: aggregate.id().to_string(),
                aggregate_type,
                version: aggregate.version(),
                created: Utc::now(),
                body,
            })
            .await?;
        Ok(())
    }
}
