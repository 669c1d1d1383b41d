//! Type and handler registry.
//!
//! Stored messages carry only a textual type name, so decoding needs a
//! process-wide mapping from stable names back to concrete shapes. The
//! registry also caches, per aggregate type, the table of event-apply
//! functions used to fold events into aggregate state.
//!
//! The registry is populated at startup and read concurrently afterwards by
//! dispatcher workers and storage codecs. It is always injected — one
//! instance per application (or per tenant), never a process global.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::error_event::{CqrsErrorEvent, CQRS_ERROR_EVENT_TYPE};
use crate::message::{Command, CommandEnvelope, EventEnvelope, Payload, VersionedEvent};

/// Unqualified name of a type, used as its default registration name.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Errors raised by registry lookups and envelope codecs.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot find event type {0}")]
    UnknownType(String),

    #[error("shape {0} was never registered")]
    UnregisteredShape(String),

    #[error("payload type mismatch for {name}")]
    TypeMismatch { name: String },

    #[error("decoding {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("encoding {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

type DecodeFn = Arc<dyn Fn(&serde_json::Value) -> Result<Payload, RegistryError> + Send + Sync>;
type EncodeFn =
    Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<serde_json::Value, RegistryError> + Send + Sync>;
type ApplyFn = Arc<dyn Fn(&mut dyn Any, &dyn Any) + Send + Sync>;

fn codec_for<T>(name: &str) -> (DecodeFn, EncodeFn)
where
    T: Any + Send + Sync + Serialize + DeserializeOwned,
{
    let decode = {
        let name = name.to_string();
        Arc::new(move |value: &serde_json::Value| {
            let concrete: T = serde_json::from_value(value.clone()).map_err(|source| {
                RegistryError::Decode {
                    name: name.clone(),
                    source,
                }
            })?;
            Ok(Arc::new(concrete) as Payload)
        }) as DecodeFn
    };
    let encode = {
        let name = name.to_string();
        Arc::new(move |any: &(dyn Any + Send + Sync)| {
            let concrete = any
                .downcast_ref::<T>()
                .ok_or_else(|| RegistryError::TypeMismatch { name: name.clone() })?;
            serde_json::to_value(concrete).map_err(|source| RegistryError::Encode {
                name: name.clone(),
                source,
            })
        }) as EncodeFn
    };
    (decode, encode)
}

#[derive(Clone)]
struct TypeEntry {
    type_id: TypeId,
    decode: DecodeFn,
    encode: EncodeFn,
}

#[derive(Clone)]
pub(crate) struct EventCodec {
    pub(crate) name: String,
    pub(crate) type_id: TypeId,
    decode: DecodeFn,
    encode: EncodeFn,
}

/// A mapping from event shape to the function that applies it to an
/// aggregate.
///
/// Built once per aggregate type via [`HandleEvents::handler_table`] and
/// cached by the registry. The table is immutable once built; registering
/// two handlers for one event shape is a programming error and panics at
/// build time, independent of registration order.
pub struct HandlerTable {
    aggregate: &'static str,
    entries: HashMap<TypeId, ApplyFn>,
    codecs: Vec<EventCodec>,
}

impl HandlerTable {
    /// Starts a handler table for aggregate type `A`.
    pub fn new<A: Any>() -> Self {
        Self {
            aggregate: short_type_name::<A>(),
            entries: HashMap::new(),
            codecs: Vec::new(),
        }
    }

    /// A table bound to no aggregate, used by default-constructed
    /// event-source bases until they are rebound.
    pub(crate) fn detached() -> Self {
        Self {
            aggregate: "<detached>",
            entries: HashMap::new(),
            codecs: Vec::new(),
        }
    }

    /// Registers `apply` as the handler for event shape `E`.
    ///
    /// The event shape is also recorded with its serde codec so that
    /// [`TypeRegistry::register_aggregate`] can register every event the
    /// aggregate handles in one call.
    ///
    /// # Panics
    ///
    /// Panics when a handler for `E` is already present.
    pub fn on<A, E>(mut self, apply: fn(&mut A, &E)) -> Self
    where
        A: Any,
        E: Any + Send + Sync + Serialize + DeserializeOwned,
    {
        let type_id = TypeId::of::<E>();
        let name = short_type_name::<E>();
        if self.entries.contains_key(&type_id) {
            panic!(
                "duplicate handler for event type {name} on aggregate {}",
                self.aggregate
            );
        }

        let aggregate_name = self.aggregate;
        let apply_fn: ApplyFn = Arc::new(move |aggregate: &mut dyn Any, event: &dyn Any| {
            let (Some(aggregate), Some(event)) =
                (aggregate.downcast_mut::<A>(), event.downcast_ref::<E>())
            else {
                panic!("handler table for {aggregate_name} invoked with mismatched types");
            };
            apply(aggregate, event);
        });
        self.entries.insert(type_id, apply_fn);

        let (decode, encode) = codec_for::<E>(name);
        self.codecs.push(EventCodec {
            name: name.to_string(),
            type_id,
            decode,
            encode,
        });
        self
    }

    /// Whether a handler exists for the given event shape.
    pub fn handles(&self, type_id: TypeId) -> bool {
        self.entries.contains_key(&type_id)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn aggregate_name(&self) -> &'static str {
        self.aggregate
    }

    pub(crate) fn codecs(&self) -> &[EventCodec] {
        &self.codecs
    }

    /// Applies `event` to `aggregate` through the registered handler.
    /// Returns `false` when no handler exists for the event's shape.
    pub(crate) fn apply(&self, aggregate: &mut dyn Any, event: &dyn Any) -> bool {
        match self.entries.get(&event.type_id()) {
            Some(apply) => {
                apply(aggregate, event);
                true
            }
            None => false,
        }
    }
}

/// Implemented by aggregates to declare which events they fold and how.
pub trait HandleEvents: Any + Send {
    /// Builds the aggregate's handler table. Called once per aggregate type
    /// and cached; per-instance construction reuses the same entries.
    fn handler_table() -> HandlerTable
    where
        Self: Sized;
}

#[derive(Default)]
struct Inner {
    types: HashMap<String, TypeEntry>,
    names: HashMap<TypeId, String>,
    handlers: HashMap<TypeId, Arc<HandlerTable>>,
}

/// Process-wide mapping between stable textual names and concrete shapes,
/// plus the per-aggregate handler-table cache.
#[derive(Default)]
pub struct TypeRegistry {
    inner: RwLock<Inner>,
    sealed: AtomicBool,
}

impl TypeRegistry {
    /// Creates a registry with the framework error event pre-registered.
    pub fn new() -> Self {
        let registry = Self::default();
        registry.register_type_as::<CqrsErrorEvent>(CQRS_ERROR_EVENT_TYPE);
        registry
    }

    /// Registers `T` under its unqualified type name.
    pub fn register_type<T>(&self)
    where
        T: Any + Send + Sync + Serialize + DeserializeOwned,
    {
        self.register_type_as::<T>(short_type_name::<T>());
    }

    /// Registers `T` under an explicit stable name.
    pub fn register_type_as<T>(&self, name: &str)
    where
        T: Any + Send + Sync + Serialize + DeserializeOwned,
    {
        self.assert_unsealed();
        let (decode, encode) = codec_for::<T>(name);
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.names.insert(TypeId::of::<T>(), name.to_string());
        inner.types.insert(
            name.to_string(),
            TypeEntry {
                type_id: TypeId::of::<T>(),
                decode,
                encode,
            },
        );
        debug!(type_name = name, "type registered");
    }

    /// Registers an aggregate: caches its handler table and registers every
    /// event shape the table names.
    pub fn register_aggregate<A: HandleEvents>(&self) {
        self.assert_unsealed();
        let table = Arc::new(A::handler_table());
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .names
            .insert(TypeId::of::<A>(), table.aggregate_name().to_string());
        for codec in table.codecs() {
            inner.names.insert(codec.type_id, codec.name.clone());
            inner.types.insert(
                codec.name.clone(),
                TypeEntry {
                    type_id: codec.type_id,
                    decode: Arc::clone(&codec.decode),
                    encode: Arc::clone(&codec.encode),
                },
            );
        }
        debug!(
            aggregate = table.aggregate_name(),
            events = table.len(),
            "aggregate registered"
        );
        inner.handlers.insert(TypeId::of::<A>(), table);
    }

    /// Reverse lookup used by decoders. `None` on miss.
    pub fn get_type_by_name(&self, name: &str) -> Option<TypeId> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.types.get(name).map(|entry| entry.type_id)
    }

    /// The registered name of a shape, if any.
    pub fn name_of(&self, type_id: TypeId) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.names.get(&type_id).cloned()
    }

    /// Returns the cached handler table for `A`, building it on first use.
    pub fn get_handlers<A: HandleEvents>(&self) -> Arc<HandlerTable> {
        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(table) = inner.handlers.get(&TypeId::of::<A>()) {
                return Arc::clone(table);
            }
        }
        let table = Arc::new(A::handler_table());
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            inner
                .handlers
                .entry(TypeId::of::<A>())
                .or_insert(table),
        )
    }

    /// Freezes the registry. Registration after sealing is a programming
    /// error and panics; lookups and the handler cache remain available.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    fn assert_unsealed(&self) {
        if self.sealed.load(Ordering::SeqCst) {
            panic!("type registry is sealed; registration is startup-only");
        }
    }

    /// Encodes an event into its wire envelope.
    pub fn encode_event(&self, event: &VersionedEvent) -> Result<EventEnvelope, RegistryError> {
        let body = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let entry = inner
                .types
                .get(&event.event_type)
                .ok_or_else(|| RegistryError::UnknownType(event.event_type.clone()))?;
            (entry.encode)(event.event.as_ref())?
        };
        Ok(EventEnvelope {
            id: event.id.clone(),
            correlation_id: event.correlation_id.clone(),
            source_id: event.source_id.clone(),
            version: event.version,
            event_type: event.event_type.clone(),
            created: event.created,
            event: body,
        })
    }

    /// Decodes an event envelope, resolving the payload shape by name.
    pub fn decode_event(&self, envelope: EventEnvelope) -> Result<VersionedEvent, RegistryError> {
        let payload = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let entry = inner
                .types
                .get(&envelope.event_type)
                .ok_or_else(|| RegistryError::UnknownType(envelope.event_type.clone()))?;
            (entry.decode)(&envelope.event)?
        };
        Ok(VersionedEvent {
            id: envelope.id,
            correlation_id: envelope.correlation_id,
            source_id: envelope.source_id,
            version: envelope.version,
            event_type: envelope.event_type,
            created: envelope.created,
            event: payload,
        })
    }

    /// Encodes a command into its wire envelope.
    pub fn encode_command(&self, command: &Command) -> Result<CommandEnvelope, RegistryError> {
        let body = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let entry = inner
                .types
                .get(&command.command_type)
                .ok_or_else(|| RegistryError::UnknownType(command.command_type.clone()))?;
            (entry.encode)(command.body.as_ref())?
        };
        Ok(CommandEnvelope {
            message_id: command.message_id.clone(),
            correlation_id: command.correlation_id.clone(),
            command_type: command.command_type.clone(),
            created: command.created,
            body,
        })
    }

    /// Decodes a command envelope, resolving the payload shape by name.
    pub fn decode_command(&self, envelope: CommandEnvelope) -> Result<Command, RegistryError> {
        let body = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let entry = inner
                .types
                .get(&envelope.command_type)
                .ok_or_else(|| RegistryError::UnknownType(envelope.command_type.clone()))?;
            (entry.decode)(&envelope.body)?
        };
        Ok(Command {
            message_id: envelope.message_id,
            correlation_id: envelope.correlation_id,
            command_type: envelope.command_type,
            created: envelope.created,
            body,
        })
    }
}
