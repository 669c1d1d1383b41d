//! Event-source base embedded by aggregates.
//!
//! An aggregate owns an [`EventSource`]: its identity, the version it was
//! loaded at, the events applied but not yet persisted, and a snapshot hint
//! consulted at save time. Domain methods mutate state exclusively through
//! [`EventSourced::update`], which routes the event through the aggregate's
//! handler table before appending it to the pending list.

use std::any::Any;
use std::sync::Arc;

use crate::ident;
use crate::message::Payload;
use crate::registry::{short_type_name, HandleEvents, HandlerTable};

/// Reusable per-aggregate state: identity, current version, pending events,
/// handler table, and the suggest-snapshot flag.
#[derive(Clone)]
pub struct EventSource {
    id: String,
    version: i64,
    events: Vec<Payload>,
    handlers: Arc<HandlerTable>,
    wants_snapshot: bool,
}

impl EventSource {
    /// A base for a brand-new aggregate of type `A`, with a generated id.
    pub fn new<A: HandleEvents>() -> Self {
        Self::with_id::<A>(ident::new_id())
    }

    /// A base for aggregate type `A` under a caller-chosen id.
    pub fn with_id<A: HandleEvents>(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            events: Vec::new(),
            handlers: Arc::new(A::handler_table()),
            wants_snapshot: false,
        }
    }

    /// Re-arms a default-constructed base after snapshot deserialization:
    /// restores identity and version and rebuilds the handler table.
    pub(crate) fn rebind<A: HandleEvents>(&mut self, id: &str, version: i64) {
        self.id = id.to_string();
        self.version = version;
        self.events.clear();
        self.handlers = Arc::new(A::handler_table());
        self.wants_snapshot = false;
    }

    pub(crate) fn handlers(&self) -> &Arc<HandlerTable> {
        &self.handlers
    }

    pub(crate) fn push_pending(&mut self, event: Payload) {
        self.events.push(event);
    }

    pub(crate) fn clear_pending(&mut self) {
        self.events.clear();
    }

    pub(crate) fn clear_snapshot_hint(&mut self) {
        self.wants_snapshot = false;
    }
}

// Snapshot bodies skip the base entirely; `Default` produces a detached base
// that the repository rebinds after deserialization.
impl Default for EventSource {
    fn default() -> Self {
        Self {
            id: String::new(),
            version: 0,
            events: Vec::new(),
            handlers: Arc::new(HandlerTable::detached()),
            wants_snapshot: false,
        }
    }
}

impl std::fmt::Debug for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSource")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("pending", &self.events.len())
            .field("wants_snapshot", &self.wants_snapshot)
            .finish()
    }
}

/// Behavior shared by every event-sourced aggregate.
///
/// Implementors expose their embedded [`EventSource`]; everything else is
/// provided. `update` is the single mutation path: it applies the event to
/// in-memory state through the handler table, then records it as pending.
pub trait EventSourced: Any + Send {
    fn event_source(&self) -> &EventSource;
    fn event_source_mut(&mut self) -> &mut EventSource;

    /// The aggregate's identity.
    fn id(&self) -> &str {
        &self.event_source().id
    }

    fn set_id(&mut self, id: &str) {
        self.event_source_mut().id = id.to_string();
    }

    /// The version the aggregate was loaded at, advanced by saves.
    /// Zero for a newly created aggregate.
    fn version(&self) -> i64 {
        self.event_source().version
    }

    fn set_version(&mut self, version: i64) {
        self.event_source_mut().version = version;
    }

    /// Events applied since construction or the last successful save.
    fn events(&self) -> &[Payload] {
        &self.event_source().events
    }

    /// Asks the repository to persist a snapshot at the next save,
    /// regardless of the snapshot interval.
    fn suggest_save_snapshot(&mut self) {
        self.event_source_mut().wants_snapshot = true;
    }

    fn wants_to_save_snapshot(&self) -> bool {
        self.event_source().wants_snapshot
    }

    /// Applies `event` to the aggregate's state and appends it to the
    /// pending list.
    ///
    /// # Panics
    ///
    /// Panics when no handler is registered for the event's shape. A missing
    /// handler is a programming error, not a runtime condition.
    fn update<E: Any + Send + Sync>(&mut self, event: E)
    where
        Self: Sized,
    {
        let handlers = Arc::clone(self.event_source().handlers());
        if !handlers.apply(self as &mut dyn Any, &event) {
            panic!(
                "no handler found for event type {} on aggregate {}",
                short_type_name::<E>(),
                handlers.aggregate_name()
            );
        }
        self.event_source_mut().push_pending(Arc::new(event));
    }

    /// Routes an event to the aggregate's handler without recording it.
    ///
    /// # Panics
    ///
    /// Panics when no handler is registered for the event's shape.
    fn call_event_handler(&mut self, event: &dyn Any)
    where
        Self: Sized,
    {
        let handlers = Arc::clone(self.event_source().handlers());
        if !handlers.apply(self as &mut dyn Any, event) {
            panic!(
                "no handler found for event on aggregate {}",
                handlers.aggregate_name()
            );
        }
    }
}

/// Marker for aggregates usable with the event-sourcing repository:
/// event-sourced, handler-declaring, and serde-serializable for snapshots.
pub trait AggregateRoot:
    EventSourced + HandleEvents + serde::Serialize + serde::de::DeserializeOwned
{
}

impl<T> AggregateRoot for T where
    T: EventSourced + HandleEvents + serde::Serialize + serde::de::DeserializeOwned
{
}
