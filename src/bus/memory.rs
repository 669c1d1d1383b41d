//! In-memory transports for single-process deployments and tests.
//!
//! The command bus is a point-to-point queue: workers compete for messages,
//! mirroring the competing-consumer semantics of the broker transport. The
//! event bus is a broadcast channel: every receiver observes every event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, warn};

use super::{
    BusError, CommandConsumer, CommandPublisher, CommandReceiver, CommandReceiverOptions,
    EventConsumer, EventReceiverOptions, Result, VersionedEventPublisher, VersionedEventReceiver,
};
use crate::message::{Command, VersionedEvent};

const COMMAND_QUEUE_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// In-memory command bus over a tokio mpsc queue.
///
/// Publishing before any receiver has started silently drops the batch,
/// so fire-and-forget callers never block on an unconsumed queue.
pub struct InMemoryCommandBus {
    sender: mpsc::Sender<Command>,
    receiver: Mutex<Option<mpsc::Receiver<Command>>>,
    receiving: AtomicBool,
}

impl InMemoryCommandBus {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            receiving: AtomicBool::new(false),
        }
    }
}

impl Default for InMemoryCommandBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandPublisher for InMemoryCommandBus {
    async fn publish_commands(&self, commands: Vec<Command>) -> Result<()> {
        if !self.receiving.load(Ordering::SeqCst) {
            debug!(count = commands.len(), "no receiver started, dropping commands");
            return Ok(());
        }
        for command in commands {
            self.sender
                .send(command)
                .await
                .map_err(|_| BusError::Closed)?;
        }
        Ok(())
    }
}

#[async_trait]
impl CommandReceiver for InMemoryCommandBus {
    async fn receive_commands(&self, options: CommandReceiverOptions) -> Result<()> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| BusError::Subscribe("command bus is already consuming".to_string()))?;
        self.receiving.store(true, Ordering::SeqCst);

        let queue = Arc::new(tokio::sync::Mutex::new(receiver));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut workers = Vec::new();
        for worker in 0..options.listener_count.max(1) {
            workers.push(tokio::spawn(command_worker(
                worker,
                Arc::clone(&queue),
                Arc::clone(&options.consumer),
                options.errors.clone(),
                shutdown_rx.clone(),
            )));
        }

        let mut close = options.close;
        tokio::spawn(async move {
            let reply = close.recv().await;
            let _ = shutdown_tx.send(true);
            for worker in workers {
                let _ = worker.await;
            }
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
        });

        Ok(())
    }
}

async fn command_worker(
    worker: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Command>>>,
    consumer: Arc<dyn CommandConsumer>,
    errors: mpsc::Sender<BusError>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let command = tokio::select! {
            _ = shutdown.changed() => break,
            command = async { queue.lock().await.recv().await } => command,
        };
        let Some(command) = command else { break };
        if let Err(err) = consumer.consume(command).await {
            debug!(worker, error = %err, "command consumer reported failure");
            let _ = errors.send(err).await;
        }
    }
}

/// In-memory event bus over a tokio broadcast channel.
///
/// Each `receive_events` call takes its own subscription, so every consumer
/// observes every published event, like queues bound to a fanout exchange.
pub struct InMemoryEventBus {
    sender: broadcast::Sender<VersionedEvent>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VersionedEventPublisher for InMemoryEventBus {
    async fn publish_events(&self, events: Vec<VersionedEvent>) -> Result<()> {
        for event in events {
            // No subscribers means the event is dropped, as with a fanout
            // exchange that has no bound queues.
            let _ = self.sender.send(event);
        }
        Ok(())
    }
}

#[async_trait]
impl VersionedEventReceiver for InMemoryEventBus {
    async fn receive_events(&self, options: EventReceiverOptions) -> Result<()> {
        let subscription = self.sender.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = tokio::spawn(event_worker(
            subscription,
            Arc::clone(&options.consumer),
            options.errors.clone(),
            shutdown_rx,
        ));

        let mut close = options.close;
        tokio::spawn(async move {
            let reply = close.recv().await;
            let _ = shutdown_tx.send(true);
            let _ = worker.await;
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
        });

        Ok(())
    }
}

async fn event_worker(
    mut subscription: broadcast::Receiver<VersionedEvent>,
    consumer: Arc<dyn EventConsumer>,
    errors: mpsc::Sender<BusError>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = subscription.recv() => received,
        };
        match received {
            Ok(event) => {
                if let Err(err) = consumer.consume(event).await {
                    error!(error = %err, "event consumer reported failure");
                    let _ = errors.send(err).await;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event subscription lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures::future::BoxFuture;
    use tokio::sync::oneshot;

    use super::*;
    use crate::registry::TypeRegistry;

    struct CountingCommandConsumer {
        count: Arc<AtomicUsize>,
        notify: mpsc::Sender<Command>,
    }

    impl CommandConsumer for CountingCommandConsumer {
        fn consume(&self, command: Command) -> BoxFuture<'static, Result<()>> {
            let count = Arc::clone(&self.count);
            let notify = self.notify.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                let _ = notify.send(command).await;
                Ok(())
            })
        }
    }

    struct CountingEventConsumer {
        notify: mpsc::Sender<VersionedEvent>,
    }

    impl EventConsumer for CountingEventConsumer {
        fn consume(&self, event: VersionedEvent) -> BoxFuture<'static, Result<()>> {
            let notify = self.notify.clone();
            Box::pin(async move {
                let _ = notify.send(event).await;
                Ok(())
            })
        }
    }

    fn test_event(version: i64) -> VersionedEvent {
        use chrono::Utc;
        VersionedEvent {
            id: crate::ident::new_id(),
            correlation_id: "c-1".to_string(),
            source_id: "s-1".to_string(),
            version,
            event_type: "Ticked".to_string(),
            created: Utc::now(),
            event: Arc::new(version),
        }
    }

    #[tokio::test]
    async fn publish_without_receiver_is_dropped() {
        let bus = InMemoryCommandBus::new();
        bus.publish_commands(vec![Command::new(1u32)])
            .await
            .expect("publish should succeed");
    }

    #[tokio::test]
    async fn commands_round_trip() {
        let bus = InMemoryCommandBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let (notify_tx, mut notify_rx) = mpsc::channel(8);
        let (_close_tx, close_rx) = mpsc::channel(1);
        let (error_tx, _error_rx) = mpsc::channel(8);

        bus.receive_commands(CommandReceiverOptions {
            registry: Arc::new(TypeRegistry::new()),
            consumer: Arc::new(CountingCommandConsumer {
                count: Arc::clone(&count),
                notify: notify_tx,
            }),
            close: close_rx,
            errors: error_tx,
            exclusive: false,
            listener_count: 2,
        })
        .await
        .expect("receive should start");

        bus.publish_commands(vec![Command::new(1u32), Command::new(2u32)])
            .await
            .expect("publish should succeed");

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(5), notify_rx.recv())
                .await
                .expect("should not time out")
                .expect("channel should stay open");
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_is_acknowledged() {
        let bus = InMemoryCommandBus::new();
        let (close_tx, close_rx) = mpsc::channel(1);
        let (error_tx, _error_rx) = mpsc::channel(8);
        let (notify_tx, _notify_rx) = mpsc::channel(8);

        bus.receive_commands(CommandReceiverOptions {
            registry: Arc::new(TypeRegistry::new()),
            consumer: Arc::new(CountingCommandConsumer {
                count: Arc::new(AtomicUsize::new(0)),
                notify: notify_tx,
            }),
            close: close_rx,
            errors: error_tx,
            exclusive: false,
            listener_count: 1,
        })
        .await
        .expect("receive should start");

        let (reply_tx, reply_rx) = oneshot::channel();
        close_tx.send(reply_tx).await.expect("close send should succeed");
        let ack = tokio::time::timeout(Duration::from_secs(5), reply_rx)
            .await
            .expect("close should be acknowledged")
            .expect("reply channel should complete");
        assert!(ack.is_ok());
    }

    #[tokio::test]
    async fn every_event_receiver_sees_every_event() {
        let bus = InMemoryEventBus::new();
        let (notify_a_tx, mut notify_a_rx) = mpsc::channel(8);
        let (notify_b_tx, mut notify_b_rx) = mpsc::channel(8);

        let mut close_senders = Vec::new();
        for notify in [notify_a_tx, notify_b_tx] {
            let (close_tx, close_rx) = mpsc::channel(1);
            close_senders.push(close_tx);
            let (error_tx, _error_rx) = mpsc::channel(8);
            bus.receive_events(EventReceiverOptions {
                registry: Arc::new(TypeRegistry::new()),
                consumer: Arc::new(CountingEventConsumer { notify }),
                close: close_rx,
                errors: error_tx,
                listener_count: 1,
            })
            .await
            .expect("receive should start");
        }

        bus.publish_events(vec![test_event(1)])
            .await
            .expect("publish should succeed");

        for receiver in [&mut notify_a_rx, &mut notify_b_rx] {
            let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
                .await
                .expect("should not time out")
                .expect("channel should stay open");
            assert_eq!(event.version, 1);
        }
    }
}
