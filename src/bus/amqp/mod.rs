//! AMQP (RabbitMQ) transports.
//!
//! Commands travel over a durable topic exchange: the consumer queue is
//! named for the service and bound with the service name as routing key, and
//! publishers route to that same key. Events travel over a durable fanout
//! exchange with a queue per consumer. Messages are persistent; prefetch is
//! tunable per bus.
//!
//! Connection loss is handled by a [`ReconnectionSupervisor`]: workers that
//! observe a failure present their reconnect context and either drive the
//! redial or, when another worker already did, receive the fresh connection
//! immediately.

use std::sync::Arc;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use super::retry::PUBLISH_ATTEMPTS;
use super::{BusError, CloseSignal, Result};

mod command;
mod connection;
mod event;

pub use command::AmqpCommandBus;
pub use connection::{DialFn, RebindHook, ReconnectionSupervisor};
pub use event::AmqpEventBus;

/// Default prefetch for command consumers.
pub const DEFAULT_COMMAND_PREFETCH: u16 = 3;

/// Default prefetch for event consumers.
pub const DEFAULT_EVENT_PREFETCH: u16 = 1;

/// Dialer for real AMQP connections.
pub(crate) fn amqp_dialer() -> DialFn<Connection> {
    Arc::new(|url: String| {
        Box::pin(async move {
            Connection::connect(&url, ConnectionProperties::default())
                .await
                .map_err(|err| BusError::Connection(format!("connection.open: {err}")))
        })
    })
}

/// Properties for persistent JSON messages.
pub(crate) fn persistent_properties() -> BasicProperties {
    BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2)
}

/// The connection epoch a publisher or `delete_queue` caller currently
/// holds: the supervised connection plus its reconnect context.
pub(crate) struct Epoch {
    pub(crate) connection: Option<Arc<Connection>>,
    pub(crate) context: u64,
}

impl Epoch {
    pub(crate) fn new() -> Self {
        Self {
            connection: None,
            context: 0,
        }
    }
}

/// Topology one consumer worker declares before consuming.
#[derive(Clone)]
pub(crate) struct ConsumerBinding {
    pub(crate) exchange: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) queue: String,
    pub(crate) routing_key: String,
    pub(crate) prefetch: u16,
    pub(crate) exclusive: bool,
}

/// Declares exchange, queue, and binding, sets prefetch, and starts a
/// consumer. The empty consumer tag lets the broker assign one, so multiple
/// workers compete on the same queue.
pub(crate) async fn bind_consumer(
    connection: &Connection,
    binding: &ConsumerBinding,
) -> Result<lapin::Consumer> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|err| BusError::Connection(format!("channel.open: {err}")))?;

    channel
        .exchange_declare(
            &binding.exchange,
            binding.kind.clone(),
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| BusError::Subscribe(format!("exchange.declare: {err}")))?;

    channel
        .queue_declare(
            &binding.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| BusError::Subscribe(format!("queue.declare: {err}")))?;

    channel
        .queue_bind(
            &binding.queue,
            &binding.exchange,
            &binding.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|err| BusError::Subscribe(format!("queue.bind: {err}")))?;

    channel
        .basic_qos(binding.prefetch, BasicQosOptions::default())
        .await
        .map_err(|err| BusError::Subscribe(format!("basic.qos: {err}")))?;

    let consumer = channel
        .basic_consume(
            &binding.queue,
            "",
            BasicConsumeOptions {
                exclusive: binding.exclusive,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| BusError::Subscribe(format!("basic.consume: {err}")))?;

    Ok(consumer)
}

pub(crate) async fn ack(delivery: &Delivery) {
    if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
        error!(error = %err, "failed to ack message");
    }
}

pub(crate) async fn reject(delivery: &Delivery, requeue: bool) {
    if let Err(err) = delivery.reject(BasicRejectOptions { requeue }).await {
        error!(error = %err, "failed to reject message");
    }
}

/// Opens a channel, declares the exchange, and publishes the batch with
/// persistent delivery, awaiting broker confirms.
async fn publish_once(
    connection: &Connection,
    exchange: &str,
    kind: ExchangeKind,
    routing_key: &str,
    payloads: &[Vec<u8>],
) -> Result<()> {
    let channel: Channel = connection
        .create_channel()
        .await
        .map_err(|err| BusError::Connection(format!("channel.open: {err}")))?;

    channel
        .exchange_declare(
            exchange,
            kind,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| BusError::Publish(format!("exchange.declare: {err}")))?;

    for payload in payloads {
        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                persistent_properties(),
            )
            .await
            .map_err(|err| BusError::Publish(format!("basic.publish: {err}")))?;
        confirm
            .await
            .map_err(|err| BusError::Publish(format!("publish confirmation: {err}")))?;
    }
    Ok(())
}

/// Publish with the retry schedule, funnelling reconnects through the
/// supervisor so only one observer of a broken connection redials.
pub(crate) async fn publish_with_retry(
    supervisor: &ReconnectionSupervisor<Connection>,
    epoch: &tokio::sync::Mutex<Epoch>,
    healthy: &std::sync::atomic::AtomicBool,
    exchange: &str,
    kind: ExchangeKind,
    routing_key: &str,
    payloads: Vec<Vec<u8>>,
) -> Result<()> {
    use std::sync::atomic::Ordering;

    let mut last_error = None;
    for (attempt, delay) in super::retry::backoff_delays(PUBLISH_ATTEMPTS).enumerate() {
        let (connection, context) = {
            let mut state = epoch.lock().await;
            if state.connection.is_none() {
                let (connection, context) = supervisor.reconnect(state.context).await?;
                state.connection = Some(connection);
                state.context = context;
            }
            match &state.connection {
                Some(connection) => (Arc::clone(connection), state.context),
                None => return Err(BusError::Connection("no connection available".to_string())),
            }
        };

        match publish_once(&connection, exchange, kind.clone(), routing_key, &payloads).await {
            Ok(()) => {
                healthy.store(true, Ordering::SeqCst);
                return Ok(());
            }
            Err(err) => {
                healthy.store(false, Ordering::SeqCst);
                warn!(
                    attempt,
                    exchange,
                    error = %err,
                    "publish attempt failed"
                );
                last_error = Some(err);
                tokio::time::sleep(delay).await;

                let mut state = epoch.lock().await;
                if state.context == context {
                    match supervisor.reconnect(context).await {
                        Ok((connection, new_context)) => {
                            state.connection = Some(connection);
                            state.context = new_context;
                        }
                        Err(err) => last_error = Some(err),
                    }
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| BusError::Publish("publish retries exhausted".to_string())))
}

/// Waits for the close request, broadcasts shutdown to the workers, awaits
/// them (draining in-flight deliveries), then acknowledges the close.
pub(crate) async fn supervise_close(
    mut close: mpsc::Receiver<CloseSignal>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
) {
    let reply = close.recv().await;
    let _ = shutdown.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    info!("amqp consumer stopped");
    if let Some(reply) = reply {
        let _ = reply.send(Ok(()));
    }
}

/// Generic consumer worker: keeps a consumer bound across reconnects and
/// spawns one task per delivery so a slow handler never blocks the stream.
pub(crate) async fn consume_loop<F>(
    supervisor: ReconnectionSupervisor<Connection>,
    binding: ConsumerBinding,
    mut shutdown: watch::Receiver<bool>,
    worker: usize,
    process: F,
) where
    F: Fn(Delivery) -> futures::future::BoxFuture<'static, ()> + Send + Sync + 'static,
{
    let mut context = 0u64;
    let mut tasks = JoinSet::new();

    'outer: loop {
        let (connection, new_context) = match supervisor.reconnect(context).await {
            Ok(reply) => reply,
            Err(_) => break,
        };
        context = new_context;

        let mut consumer = match bind_consumer(&connection, &binding).await {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(worker, queue = %binding.queue, error = %err, "consumer setup failed");
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                continue;
            }
        };
        info!(worker, queue = %binding.queue, context, "consumer ready");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break 'outer,
                _ = tasks.join_next(), if !tasks.is_empty() => {}
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => {
                        tasks.spawn(process(delivery));
                    }
                    Some(Err(err)) => {
                        warn!(worker, error = %err, "delivery error, reconnecting");
                        break;
                    }
                    None => {
                        warn!(worker, "consumer stream ended, reconnecting");
                        break;
                    }
                }
            }
        }
    }

    // Drain in-flight deliveries so everything gets acked or rejected.
    while tasks.join_next().await.is_some() {}
}
