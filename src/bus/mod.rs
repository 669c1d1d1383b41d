//! Command and event transports.
//!
//! This module contains:
//! - publisher/receiver traits for commands and versioned events
//! - per-message consumer callbacks driving acknowledgement
//! - receiver option structures (close channel, error channel, workers)
//! - Implementations: in-memory (tokio channels), AMQP (RabbitMQ)

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use crate::message::{Command, VersionedEvent};
use crate::registry::{RegistryError, TypeRegistry};

pub mod memory;
pub(crate) mod retry;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use memory::{InMemoryCommandBus, InMemoryEventBus};

#[cfg(feature = "amqp")]
pub use amqp::{AmqpCommandBus, AmqpEventBus, ReconnectionSupervisor};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("decoding message: {0}")]
    Decode(String),

    #[error("cannot find command type {0}")]
    UnknownCommandType(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("bus closed")]
    Closed,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Reply channel handed to a receiver when the consumer is asked to stop.
/// The receiver acknowledges the close by completing the sender.
pub type CloseSignal = oneshot::Sender<Result<()>>;

/// Per-message callback invoked by command receivers.
///
/// The return value drives acknowledgement: `Ok` acks the message, `Err`
/// rejects it back onto the queue.
pub trait CommandConsumer: Send + Sync {
    fn consume(&self, command: Command) -> BoxFuture<'static, Result<()>>;
}

/// Per-message callback invoked by event receivers. Same acknowledgement
/// contract as [`CommandConsumer`].
pub trait EventConsumer: Send + Sync {
    fn consume(&self, event: VersionedEvent) -> BoxFuture<'static, Result<()>>;
}

/// Options handed to a command receiver when consumption starts.
pub struct CommandReceiverOptions {
    /// Registry used to resolve command type names while decoding.
    pub registry: Arc<TypeRegistry>,
    /// Callback invoked for each received command.
    pub consumer: Arc<dyn CommandConsumer>,
    /// Stop requests; each carries a channel for the close acknowledgement.
    pub close: mpsc::Receiver<CloseSignal>,
    /// Channel on which the receiver reports worker-side failures.
    pub errors: mpsc::Sender<BusError>,
    /// Request exclusive consumption of the queue.
    pub exclusive: bool,
    /// Number of consumer workers to start.
    pub listener_count: usize,
}

/// Options handed to an event receiver when consumption starts.
pub struct EventReceiverOptions {
    /// Registry used to resolve event type names while decoding.
    pub registry: Arc<TypeRegistry>,
    /// Callback invoked for each received event.
    pub consumer: Arc<dyn EventConsumer>,
    /// Stop requests; each carries a channel for the close acknowledgement.
    pub close: mpsc::Receiver<CloseSignal>,
    /// Channel on which the receiver reports worker-side failures.
    pub errors: mpsc::Sender<BusError>,
    /// Number of consumer workers to start.
    pub listener_count: usize,
}

/// Publishes commands by name-addressed routing.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    /// Sends the batch, retrying transient failures. Returns an error only
    /// when the publish is not recoverable.
    async fn publish_commands(&self, commands: Vec<Command>) -> Result<()>;
}

/// Receives commands and feeds them to the configured consumer.
#[async_trait]
pub trait CommandReceiver: Send + Sync {
    /// Starts `listener_count` consumer workers and returns once they are
    /// running. Delivery and acknowledgement happen on the workers.
    async fn receive_commands(&self, options: CommandReceiverOptions) -> Result<()>;
}

/// Publishes versioned events by broadcast.
#[async_trait]
pub trait VersionedEventPublisher: Send + Sync {
    /// Sends the batch, retrying transient failures. Publication never
    /// precedes persistence of the same events.
    async fn publish_events(&self, events: Vec<VersionedEvent>) -> Result<()>;
}

/// Receives globally published events and feeds them to the consumer.
#[async_trait]
pub trait VersionedEventReceiver: Send + Sync {
    /// Starts `listener_count` consumer workers and returns once they are
    /// running.
    async fn receive_events(&self, options: EventReceiverOptions) -> Result<()>;
}
