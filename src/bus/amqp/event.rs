//! AMQP event bus: durable fanout exchange, one queue per consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lapin::message::Delivery;
use lapin::options::QueueDeleteOptions;
use lapin::{Connection, ExchangeKind};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use super::{
    ack, amqp_dialer, consume_loop, publish_with_retry, reject, supervise_close, ConsumerBinding,
    Epoch, ReconnectionSupervisor, DEFAULT_EVENT_PREFETCH,
};
use crate::bus::{
    BusError, EventConsumer, EventReceiverOptions, Result, VersionedEventPublisher,
    VersionedEventReceiver,
};
use crate::message::{EventEnvelope, VersionedEvent};
use crate::metrics;
use crate::registry::{RegistryError, TypeRegistry};
use crate::ConnectionStringResolver;

/// Event bus over a RabbitMQ fanout exchange.
pub struct AmqpEventBus {
    name: String,
    exchange: String,
    registry: Arc<TypeRegistry>,
    supervisor: ReconnectionSupervisor<Connection>,
    epoch: Mutex<Epoch>,
    healthy: Arc<AtomicBool>,
    prefetch: u16,
}

impl AmqpEventBus {
    /// Creates a bus whose consumer queue is named `name`. Every queue
    /// bound to the exchange receives every published event. No connection
    /// is opened until the first publish or receive.
    pub fn new(
        resolver: ConnectionStringResolver,
        name: impl Into<String>,
        exchange: impl Into<String>,
        registry: Arc<TypeRegistry>,
    ) -> Self {
        let healthy = Arc::new(AtomicBool::new(true));
        let rebind = {
            let healthy = Arc::clone(&healthy);
            Arc::new(move |_connection: &Arc<Connection>, context: u64| {
                healthy.store(true, Ordering::SeqCst);
                debug!(context, "event bus connection rebound");
            }) as super::RebindHook<Connection>
        };
        let supervisor = ReconnectionSupervisor::spawn(resolver, amqp_dialer(), Some(rebind));
        Self {
            name: name.into(),
            exchange: exchange.into(),
            registry,
            supervisor,
            epoch: Mutex::new(Epoch::new()),
            healthy,
            prefetch: DEFAULT_EVENT_PREFETCH,
        }
    }

    /// Overrides the consumer prefetch window.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Publish health: false after a failed publish, true again once the
    /// supervisor reconnects.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Deletes a consumer queue. Used by tests and operational teardown.
    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        let connection = {
            let mut epoch = self.epoch.lock().await;
            if epoch.connection.is_none() {
                let (connection, context) = self.supervisor.reconnect(epoch.context).await?;
                epoch.connection = Some(connection);
                epoch.context = context;
            }
            epoch
                .connection
                .clone()
                .ok_or_else(|| BusError::Connection("no connection available".to_string()))?
        };
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| BusError::Connection(format!("channel.open: {err}")))?;
        channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|err| BusError::Subscribe(format!("queue.delete: {err}")))?;
        Ok(())
    }
}

#[async_trait]
impl VersionedEventPublisher for AmqpEventBus {
    async fn publish_events(&self, events: Vec<VersionedEvent>) -> Result<()> {
        let mut payloads = Vec::with_capacity(events.len());
        for event in &events {
            let envelope = self.registry.encode_event(event)?;
            let body = serde_json::to_vec(&envelope)
                .map_err(|err| BusError::Publish(format!("encoding event envelope: {err}")))?;
            payloads.push(body);
        }

        let result = publish_with_retry(
            &self.supervisor,
            &self.epoch,
            &self.healthy,
            &self.exchange,
            ExchangeKind::Fanout,
            "",
            payloads,
        )
        .await;

        match &result {
            Ok(()) => {
                for event in &events {
                    metrics::EVENTS_PUBLISHED.add(1, &[metrics::event_attr(&event.event_type)]);
                }
            }
            Err(_) => {
                metrics::PUBLISH_FAILURES.add(1, &[]);
            }
        }
        result
    }
}

#[async_trait]
impl VersionedEventReceiver for AmqpEventBus {
    async fn receive_events(&self, options: EventReceiverOptions) -> Result<()> {
        let binding = ConsumerBinding {
            exchange: self.exchange.clone(),
            kind: ExchangeKind::Fanout,
            queue: self.name.clone(),
            routing_key: self.name.clone(),
            prefetch: self.prefetch,
            exclusive: false,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::new();
        for worker in 0..options.listener_count.max(1) {
            let registry = Arc::clone(&options.registry);
            let consumer = Arc::clone(&options.consumer);
            let errors = options.errors.clone();
            workers.push(tokio::spawn(consume_loop(
                self.supervisor.clone(),
                binding.clone(),
                shutdown_rx.clone(),
                worker,
                move |delivery| {
                    let registry = Arc::clone(&registry);
                    let consumer = Arc::clone(&consumer);
                    let errors = errors.clone();
                    Box::pin(process_event_delivery(delivery, registry, consumer, errors))
                },
            )));
        }

        tokio::spawn(supervise_close(options.close, shutdown_tx, workers));
        Ok(())
    }
}

/// Decodes the two-level envelope and drives acknowledgement. Events are
/// broadcast, so a type this consumer does not recognize is acked silently;
/// malformed payloads are requeued once, then left to the operator.
async fn process_event_delivery(
    delivery: Delivery,
    registry: Arc<TypeRegistry>,
    consumer: Arc<dyn EventConsumer>,
    errors: mpsc::Sender<BusError>,
) {
    let envelope: EventEnvelope = match serde_json::from_slice(&delivery.data) {
        Ok(envelope) => envelope,
        Err(err) => {
            let requeue = !delivery.redelivered;
            let _ = errors
                .send(BusError::Decode(format!("event envelope: {err}")))
                .await;
            reject(&delivery, requeue).await;
            return;
        }
    };

    let event = match registry.decode_event(envelope) {
        Ok(event) => event,
        Err(RegistryError::UnknownType(name)) => {
            debug!(event_type = name, "event type not registered here, acking");
            ack(&delivery).await;
            return;
        }
        Err(err) => {
            let requeue = !delivery.redelivered;
            let _ = errors.send(BusError::Decode(err.to_string())).await;
            reject(&delivery, requeue).await;
            return;
        }
    };

    let event_type = event.event_type.clone();
    match consumer.consume(event).await {
        Ok(()) => ack(&delivery).await,
        Err(err) => {
            debug!(event_type, error = %err, "handler rejected event, requeueing");
            reject(&delivery, true).await;
        }
    }
}
