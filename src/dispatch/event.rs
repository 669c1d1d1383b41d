//! Versioned-event dispatcher and dispatch manager.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use super::{DispatchError, DispatchState, StateHandle, VersionedEventHandler};
use crate::bus::{
    BusError, CloseSignal, EventConsumer, EventReceiverOptions, VersionedEventReceiver,
};
use crate::message::VersionedEvent;
use crate::metrics;
use crate::registry::TypeRegistry;

/// Routes events to handlers registered by payload shape.
///
/// Events whose shape has no registered handler still reach the global
/// handlers, which is how integration logs and projections observe every
/// event regardless of type.
#[derive(Default)]
pub struct MapBasedVersionedEventDispatcher {
    registry: HashMap<TypeId, Vec<Arc<dyn VersionedEventHandler>>>,
    global_handlers: Vec<Arc<dyn VersionedEventHandler>>,
}

impl MapBasedVersionedEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for events whose payload is of shape `E`.
    pub fn register_event_handler<E: Any>(&mut self, handler: Arc<dyn VersionedEventHandler>) {
        self.registry
            .entry(TypeId::of::<E>())
            .or_default()
            .push(handler);
    }

    /// Registers a handler that runs after type-specific ones for every
    /// event.
    pub fn register_global_handler(&mut self, handler: Arc<dyn VersionedEventHandler>) {
        self.global_handlers.push(handler);
    }

    /// Executes all handlers registered for the event's payload shape,
    /// recording per-type success and failure counters.
    pub async fn dispatch_event(&self, event: VersionedEvent) -> Result<(), DispatchError> {
        let event_type = event.event_type.clone();
        let result = self.run_handlers(event).await;
        match &result {
            Ok(()) => {
                metrics::EVENTS_DISPATCHED.add(1, &[metrics::event_attr(&event_type)]);
            }
            Err(_) => {
                metrics::EVENTS_FAILED.add(1, &[metrics::event_attr(&event_type)]);
            }
        }
        result
    }

    async fn run_handlers(&self, event: VersionedEvent) -> Result<(), DispatchError> {
        let payload_type = (*event.event).type_id();
        if let Some(handlers) = self.registry.get(&payload_type) {
            for handler in handlers {
                handler.handle(event.clone()).await?;
            }
        }
        for handler in &self.global_handlers {
            handler.handle(event.clone()).await?;
        }
        Ok(())
    }
}

/// Consumes an event transport and routes each event to registered
/// handlers and the global sink.
pub struct EventDispatchManager {
    dispatcher: MapBasedVersionedEventDispatcher,
    registry: Arc<TypeRegistry>,
    receiver: Arc<dyn VersionedEventReceiver>,
    state: StateHandle,
}

impl EventDispatchManager {
    pub fn new(receiver: Arc<dyn VersionedEventReceiver>, registry: Arc<TypeRegistry>) -> Self {
        Self {
            dispatcher: MapBasedVersionedEventDispatcher::new(),
            registry,
            receiver,
            state: StateHandle::new(),
        }
    }

    /// Registers a handler for event shape `E`, also registering the shape
    /// with the type registry so received envelopes can be decoded.
    pub fn register_event_handler<E>(&mut self, handler: Arc<dyn VersionedEventHandler>)
    where
        E: Any + Send + Sync + Serialize + DeserializeOwned,
    {
        self.registry.register_type::<E>();
        self.dispatcher.register_event_handler::<E>(handler);
    }

    /// Registers a handler invoked for every event, commonly used to
    /// forward events into an integration log or projections.
    pub fn register_global_handler(&mut self, handler: Arc<dyn VersionedEventHandler>) {
        self.dispatcher.register_global_handler(handler);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DispatchState {
        self.state.get()
    }

    /// A state handle that outlives the manager once `listen` consumes it.
    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    /// Starts consuming and supervises until stopped. Same lifecycle as the
    /// command manager, without an exclusivity flag.
    pub async fn listen(
        self,
        mut stop: mpsc::Receiver<()>,
        listener_count: usize,
    ) -> Result<(), DispatchError> {
        let state = self.state.clone();
        let (close_tx, close_rx) = mpsc::channel::<CloseSignal>(1);
        let (error_tx, mut error_rx) = mpsc::channel::<BusError>(16);

        let consumer: Arc<dyn EventConsumer> = Arc::new(DispatchingConsumer {
            dispatcher: Arc::new(self.dispatcher),
        });
        let options = EventReceiverOptions {
            registry: Arc::clone(&self.registry),
            consumer,
            close: close_rx,
            errors: error_tx,
            listener_count,
        };
        self.receiver.receive_events(options).await?;
        state.set(DispatchState::Running);
        info!(listener_count, "event dispatch manager listening");

        let mut errors_open = true;
        loop {
            tokio::select! {
                _ = stop.recv() => {
                    state.set(DispatchState::Stopping);
                    info!("event dispatch manager stopping");
                    let (reply_tx, reply_rx) = oneshot::channel();
                    let _ = close_tx.send(reply_tx).await;
                    let result = match reply_rx.await {
                        Ok(close_result) => close_result.map_err(DispatchError::from),
                        Err(_) => Ok(()),
                    };
                    state.set(DispatchState::Stopped);
                    info!("event dispatch manager stopped");
                    return result;
                }
                received = error_rx.recv(), if errors_open => match received {
                    Some(err) => {
                        error!(error = %err, "event receiver reported error");
                    }
                    None => errors_open = false,
                }
            }
        }
    }
}

struct DispatchingConsumer {
    dispatcher: Arc<MapBasedVersionedEventDispatcher>,
}

impl EventConsumer for DispatchingConsumer {
    fn consume(&self, event: VersionedEvent) -> BoxFuture<'static, crate::bus::Result<()>> {
        let dispatcher = Arc::clone(&self.dispatcher);
        Box::pin(async move {
            dispatcher
                .dispatch_event(event)
                .await
                .map_err(|err| BusError::Handler(err.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use serde::Deserialize;

    use super::*;
    use crate::ident;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Credited {
        amount: f64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Debited {
        amount: f64,
    }

    fn versioned(payload: impl Any + Send + Sync, event_type: &str) -> VersionedEvent {
        VersionedEvent {
            id: ident::new_id(),
            correlation_id: "c-1".to_string(),
            source_id: "s-1".to_string(),
            version: 1,
            event_type: event_type.to_string(),
            created: Utc::now(),
            event: Arc::new(payload),
        }
    }

    fn recording_handler(
        log: Arc<Mutex<Vec<&'static str>>>,
        tag: &'static str,
    ) -> Arc<dyn VersionedEventHandler> {
        super::super::event_handler(move |_event: VersionedEvent| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(tag);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn typed_then_global_handlers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = MapBasedVersionedEventDispatcher::new();
        dispatcher.register_event_handler::<Credited>(recording_handler(Arc::clone(&log), "typed"));
        dispatcher.register_global_handler(recording_handler(Arc::clone(&log), "global"));

        dispatcher
            .dispatch_event(versioned(Credited { amount: 10.0 }, "Credited"))
            .await
            .expect("dispatch should succeed");

        let seen = log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        assert_eq!(seen, vec!["typed", "global"]);
    }

    #[tokio::test]
    async fn unregistered_shape_reaches_global_sink() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = MapBasedVersionedEventDispatcher::new();
        dispatcher.register_event_handler::<Credited>(recording_handler(Arc::clone(&log), "typed"));
        dispatcher.register_global_handler(recording_handler(Arc::clone(&log), "global"));

        dispatcher
            .dispatch_event(versioned(Debited { amount: 5.0 }, "Debited"))
            .await
            .expect("dispatch should succeed");

        let seen = log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        assert_eq!(seen, vec!["global"]);
    }

    #[tokio::test]
    async fn handler_error_propagates() {
        let mut dispatcher = MapBasedVersionedEventDispatcher::new();
        dispatcher.register_event_handler::<Credited>(super::super::event_handler(
            |_event: VersionedEvent| async { Err(DispatchError::handler("projection down")) },
        ));

        let err = dispatcher
            .dispatch_event(versioned(Credited { amount: 1.0 }, "Credited"))
            .await
            .expect_err("dispatch must fail");
        assert!(matches!(err, DispatchError::Handler(_)));
    }
}
