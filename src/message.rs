//! Core message types: commands, versioned events, and their wire envelopes.
//!
//! A [`Command`] expresses an actor's intent to change state; a
//! [`VersionedEvent`] records a fact that happened to an aggregate. Both carry
//! a type-erased payload in memory and travel as a two-level JSON envelope on
//! the wire: the outer envelope is decoded first, then the payload is decoded
//! by resolving its type name through the [`TypeRegistry`](crate::registry::TypeRegistry).

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ident;
use crate::registry::short_type_name;

/// Type-erased message payload shared between storage and publication.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// A request to alter the state of the system.
///
/// Consumed by exactly one registered consumer group, then discarded.
#[derive(Clone)]
pub struct Command {
    /// Unique message identifier.
    pub message_id: String,
    /// Groups related messages across the lifecycle of an initiating request.
    pub correlation_id: String,
    /// Stable textual name of the payload shape.
    pub command_type: String,
    /// UTC creation timestamp.
    pub created: DateTime<Utc>,
    /// Opaque payload of a registered concrete shape.
    pub body: Payload,
}

impl Command {
    /// Creates a command with fresh message and correlation identifiers.
    pub fn new<T: Any + Send + Sync>(body: T) -> Self {
        Self::with_correlation_id(body, ident::new_id())
    }

    /// Creates a command that joins an existing correlation chain.
    pub fn with_correlation_id<T: Any + Send + Sync>(
        body: T,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            message_id: ident::new_id(),
            correlation_id: correlation_id.into(),
            command_type: short_type_name::<T>().to_string(),
            created: Utc::now(),
            body: Arc::new(body),
        }
    }

    /// Downcasts the payload to a concrete command shape.
    pub fn body_as<T: Any>(&self) -> Option<&T> {
        self.body.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("message_id", &self.message_id)
            .field("correlation_id", &self.correlation_id)
            .field("command_type", &self.command_type)
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

/// An immutable fact about a past state change, addressable by
/// `(source_id, version)`.
///
/// Constructed by the write engine at save time, persisted, then published.
#[derive(Clone)]
pub struct VersionedEvent {
    /// Unique event identifier.
    pub id: String,
    /// Inherited from the originating command unless overridden.
    pub correlation_id: String,
    /// Identity of the aggregate the event belongs to.
    pub source_id: String,
    /// Strictly positive, monotonic per `source_id`, no gaps. Framework
    /// error events use version 0 and never enter an aggregate stream.
    pub version: i64,
    /// Stable textual name of the payload shape.
    pub event_type: String,
    /// UTC creation timestamp.
    pub created: DateTime<Utc>,
    /// Opaque payload of a registered concrete shape.
    pub event: Payload,
}

impl VersionedEvent {
    /// Downcasts the payload to a concrete event shape.
    pub fn event_as<T: Any>(&self) -> Option<&T> {
        self.event.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for VersionedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedEvent")
            .field("id", &self.id)
            .field("correlation_id", &self.correlation_id)
            .field("source_id", &self.source_id)
            .field("version", &self.version)
            .field("event_type", &self.event_type)
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

/// Wire and storage envelope for a [`VersionedEvent`].
///
/// Field names are part of the portable persisted layout and must not change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "correlationID")]
    pub correlation_id: String,
    #[serde(rename = "sourceID")]
    pub source_id: String,
    pub version: i64,
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(rename = "time")]
    pub created: DateTime<Utc>,
    pub event: serde_json::Value,
}

/// Wire envelope for a [`Command`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "correlationID")]
    pub correlation_id: String,
    #[serde(rename = "commandType")]
    pub command_type: String,
    #[serde(rename = "time")]
    pub created: DateTime<Utc>,
    pub body: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OpenAccount {
        owner: String,
    }

    #[test]
    fn new_command_populates_defaults() {
        let command = Command::new(OpenAccount {
            owner: "john".to_string(),
        });

        assert!(!command.message_id.is_empty());
        assert!(!command.correlation_id.is_empty());
        assert_eq!(command.command_type, "OpenAccount");
        assert_eq!(command.body_as::<OpenAccount>().map(|b| b.owner.as_str()), Some("john"));
    }

    #[test]
    fn correlation_id_is_preserved() {
        let command = Command::with_correlation_id(OpenAccount { owner: "jo".into() }, "corr-1");
        assert_eq!(command.correlation_id, "corr-1");
    }

    #[test]
    fn event_envelope_uses_portable_field_names() {
        let envelope = EventEnvelope {
            id: "e-1".to_string(),
            correlation_id: "c-1".to_string(),
            source_id: "s-1".to_string(),
            version: 3,
            event_type: "OpenAccount".to_string(),
            created: Utc::now(),
            event: serde_json::json!({"owner": "john"}),
        };

        let value = serde_json::to_value(&envelope).expect("envelope should serialize");
        let object = value.as_object().expect("envelope should be an object");
        for field in ["id", "correlationID", "sourceID", "version", "eventType", "time", "event"] {
            assert!(object.contains_key(field), "missing field {field}");
        }
        assert_eq!(object.len(), 7);
    }

    #[test]
    fn command_envelope_round_trips() {
        let envelope = CommandEnvelope {
            message_id: "m-1".to_string(),
            correlation_id: "c-1".to_string(),
            command_type: "OpenAccount".to_string(),
            created: Utc::now(),
            body: serde_json::json!({"owner": "jo"}),
        };

        let raw = serde_json::to_string(&envelope).expect("envelope should serialize");
        assert!(raw.contains("messageID"));
        assert!(raw.contains("commandType"));
        let back: CommandEnvelope = serde_json::from_str(&raw).expect("envelope should parse");
        assert_eq!(back.message_id, "m-1");
        assert_eq!(back.command_type, "OpenAccount");
    }
}
