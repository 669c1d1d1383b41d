//! Eventum — CQRS/event-sourcing toolkit.
//!
//! Building blocks for command/query-segregated, event-sourced services:
//! a write-side repository that reconstructs aggregates from their event
//! history and appends new events atomically, a type/handler registry,
//! command and event dispatch managers, in-memory and AMQP transports, and
//! a pluggable event-stream persistence contract.

use std::sync::Arc;

pub mod aggregate;
pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error_event;
pub mod ident;
pub mod message;
pub mod metrics;
pub mod registry;
pub mod repository;
pub mod storage;

// Re-export common types for library usage
pub use aggregate::{AggregateRoot, EventSource, EventSourced};
pub use config::Config;
pub use error_event::{deliver_cqrs_error, CqrsErrorEvent, CQRS_ERROR_EVENT_TYPE};
pub use message::{Command, CommandEnvelope, EventEnvelope, Payload, VersionedEvent};
pub use registry::{HandleEvents, HandlerTable, RegistryError, TypeRegistry};
pub use repository::{EventSourcingRepository, RepositoryError, DEFAULT_SNAPSHOT_INTERVAL};
pub use storage::{EventStreamRepository, InMemoryEventStreamRepository, Snapshot, StoreError};

/// Zero-argument connection-string resolver. Buses and stores call it on
/// every dial so rotating credentials are picked up without restarts.
pub type ConnectionStringResolver =
    Arc<dyn Fn() -> Result<String, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// A resolver that always returns the same connection string.
pub fn static_resolver(url: impl Into<String>) -> ConnectionStringResolver {
    let url = url.into();
    Arc::new(move || Ok(url.clone()))
}
