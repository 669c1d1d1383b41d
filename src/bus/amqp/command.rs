//! AMQP command bus: durable topic exchange, service-named queue, routing
//! key equal to the service name.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lapin::message::Delivery;
use lapin::{Connection, ExchangeKind};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use super::{
    ack, amqp_dialer, consume_loop, publish_with_retry, reject, supervise_close, ConsumerBinding,
    Epoch, ReconnectionSupervisor, DEFAULT_COMMAND_PREFETCH,
};
use crate::bus::{
    BusError, CommandConsumer, CommandPublisher, CommandReceiver, CommandReceiverOptions, Result,
};
use crate::message::CommandEnvelope;
use crate::registry::{RegistryError, TypeRegistry};
use crate::ConnectionStringResolver;

/// Command bus over a RabbitMQ topic exchange.
pub struct AmqpCommandBus {
    name: String,
    exchange: String,
    registry: Arc<TypeRegistry>,
    supervisor: ReconnectionSupervisor<Connection>,
    epoch: Mutex<Epoch>,
    healthy: Arc<AtomicBool>,
    prefetch: u16,
}

impl AmqpCommandBus {
    /// Creates a bus for the given service. `name` is used as the consumer
    /// queue name and the publish routing key. No connection is opened
    /// until the first publish or receive.
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
                debug!(context, "command bus connection rebound");
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
            prefetch: DEFAULT_COMMAND_PREFETCH,
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
}

#[async_trait]
impl CommandPublisher for AmqpCommandBus {
    async fn publish_commands(&self, commands: Vec<crate::message::Command>) -> Result<()> {
        let mut payloads = Vec::with_capacity(commands.len());
        for command in &commands {
            let envelope = self.registry.encode_command(command)?;
            let body = serde_json::to_vec(&envelope)
                .map_err(|err| BusError::Publish(format!("encoding command envelope: {err}")))?;
            payloads.push(body);
        }

        publish_with_retry(
            &self.supervisor,
            &self.epoch,
            &self.healthy,
            &self.exchange,
            ExchangeKind::Topic,
            &self.name,
            payloads,
        )
        .await
    }
}

#[async_trait]
impl CommandReceiver for AmqpCommandBus {
    async fn receive_commands(&self, options: CommandReceiverOptions) -> Result<()> {
        let binding = ConsumerBinding {
            exchange: self.exchange.clone(),
            kind: ExchangeKind::Topic,
            queue: self.name.clone(),
            routing_key: self.name.clone(),
            prefetch: self.prefetch,
            exclusive: options.exclusive,
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
                    Box::pin(process_command_delivery(delivery, registry, consumer, errors))
                },
            )));
        }

        tokio::spawn(supervise_close(options.close, shutdown_tx, workers));
        Ok(())
    }
}

/// Decodes the two-level envelope and drives acknowledgement from the
/// consumer's verdict. An unknown command type is a hard error; malformed
/// payloads are requeued once, then left to the operator.
async fn process_command_delivery(
    delivery: Delivery,
    registry: Arc<TypeRegistry>,
    consumer: Arc<dyn CommandConsumer>,
    errors: mpsc::Sender<BusError>,
) {
    let envelope: CommandEnvelope = match serde_json::from_slice(&delivery.data) {
        Ok(envelope) => envelope,
        Err(err) => {
            let requeue = !delivery.redelivered;
            let _ = errors
                .send(BusError::Decode(format!("command envelope: {err}")))
                .await;
            reject(&delivery, requeue).await;
            return;
        }
    };

    let command = match registry.decode_command(envelope) {
        Ok(command) => command,
        Err(RegistryError::UnknownType(name)) => {
            let requeue = !delivery.redelivered;
            let _ = errors.send(BusError::UnknownCommandType(name)).await;
            reject(&delivery, requeue).await;
            return;
        }
        Err(err) => {
            let requeue = !delivery.redelivered;
            let _ = errors.send(BusError::Decode(err.to_string())).await;
            reject(&delivery, requeue).await;
            return;
        }
    };

    let command_type = command.command_type.clone();
    match consumer.consume(command).await {
        Ok(()) => ack(&delivery).await,
        Err(err) => {
            debug!(command_type, error = %err, "handler rejected command, requeueing");
            reject(&delivery, true).await;
        }
    }
}
