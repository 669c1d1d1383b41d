//! Command dispatcher and dispatch manager.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use super::{CommandHandler, DispatchError, DispatchState, StateHandle};
use crate::bus::{BusError, CloseSignal, CommandConsumer, CommandReceiver, CommandReceiverOptions};
use crate::message::Command;
use crate::metrics;
use crate::registry::TypeRegistry;

/// Routes commands to handlers registered by payload shape.
///
/// Type-specific handlers run in registration order, then every global
/// handler; the first error aborts the dispatch.
#[derive(Default)]
pub struct MapBasedCommandDispatcher {
    registry: HashMap<TypeId, Vec<Arc<dyn CommandHandler>>>,
    global_handlers: Vec<Arc<dyn CommandHandler>>,
}

impl MapBasedCommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for commands whose body is of shape `C`.
    pub fn register_command_handler<C: Any>(&mut self, handler: Arc<dyn CommandHandler>) {
        self.registry
            .entry(TypeId::of::<C>())
            .or_default()
            .push(handler);
    }

    /// Registers a handler that runs after type-specific ones for every
    /// command.
    pub fn register_global_handler(&mut self, handler: Arc<dyn CommandHandler>) {
        self.global_handlers.push(handler);
    }

    /// Executes all handlers registered for the command's body shape,
    /// recording per-type success and failure counters.
    pub async fn dispatch_command(&self, command: Command) -> Result<(), DispatchError> {
        let command_type = command.command_type.clone();
        let result = self.run_handlers(command).await;
        match &result {
            Ok(()) => {
                metrics::COMMANDS_DISPATCHED.add(1, &[metrics::command_attr(&command_type)]);
            }
            Err(_) => {
                metrics::COMMANDS_FAILED.add(1, &[metrics::command_attr(&command_type)]);
            }
        }
        result
    }

    async fn run_handlers(&self, command: Command) -> Result<(), DispatchError> {
        let body_type = (*command.body).type_id();
        if let Some(handlers) = self.registry.get(&body_type) {
            for handler in handlers {
                handler.handle(command.clone()).await?;
            }
        }
        for handler in &self.global_handlers {
            handler.handle(command.clone()).await?;
        }
        Ok(())
    }
}

/// Consumes a command transport and routes each message to registered
/// handlers.
pub struct CommandDispatchManager {
    dispatcher: MapBasedCommandDispatcher,
    registry: Arc<TypeRegistry>,
    receiver: Arc<dyn CommandReceiver>,
    state: StateHandle,
}

impl CommandDispatchManager {
    pub fn new(receiver: Arc<dyn CommandReceiver>, registry: Arc<TypeRegistry>) -> Self {
        Self {
            dispatcher: MapBasedCommandDispatcher::new(),
            registry,
            receiver,
            state: StateHandle::new(),
        }
    }

    /// Registers a handler for command shape `C`, also registering the
    /// shape with the type registry so received envelopes can be decoded.
    pub fn register_command_handler<C>(&mut self, handler: Arc<dyn CommandHandler>)
    where
        C: Any + Send + Sync + Serialize + DeserializeOwned,
    {
        self.registry.register_type::<C>();
        self.dispatcher.register_command_handler::<C>(handler);
    }

    /// Registers a handler that runs after type-specific ones for every
    /// command.
    pub fn register_global_handler(&mut self, handler: Arc<dyn CommandHandler>) {
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

    /// Starts consuming and supervises until stopped.
    ///
    /// A message (or closure) on `stop` drains the receiver: the close
    /// channel is signalled, in-flight deliveries are allowed to ack or
    /// reject, and the receiver's acknowledgement becomes the return value.
    /// Worker-side errors are logged and consumption continues.
    pub async fn listen(
        self,
        mut stop: mpsc::Receiver<()>,
        exclusive: bool,
        listener_count: usize,
    ) -> Result<(), DispatchError> {
        let state = self.state.clone();
        let (close_tx, close_rx) = mpsc::channel::<CloseSignal>(1);
        let (error_tx, mut error_rx) = mpsc::channel::<BusError>(16);

        let consumer: Arc<dyn CommandConsumer> = Arc::new(DispatchingConsumer {
            dispatcher: Arc::new(self.dispatcher),
        });
        let options = CommandReceiverOptions {
            registry: Arc::clone(&self.registry),
            consumer,
            close: close_rx,
            errors: error_tx,
            exclusive,
            listener_count,
        };
        self.receiver.receive_commands(options).await?;
        state.set(DispatchState::Running);
        info!(listener_count, "command dispatch manager listening");

        let mut errors_open = true;
        loop {
            tokio::select! {
                _ = stop.recv() => {
                    state.set(DispatchState::Stopping);
                    info!("command dispatch manager stopping");
                    let (reply_tx, reply_rx) = oneshot::channel();
                    let _ = close_tx.send(reply_tx).await;
                    let result = match reply_rx.await {
                        Ok(close_result) => close_result.map_err(DispatchError::from),
                        Err(_) => Ok(()),
                    };
                    state.set(DispatchState::Stopped);
                    info!("command dispatch manager stopped");
                    return result;
                }
                received = error_rx.recv(), if errors_open => match received {
                    Some(err) => {
                        error!(error = %err, "command receiver reported error");
                    }
                    None => errors_open = false,
                }
            }
        }
    }
}

struct DispatchingConsumer {
    dispatcher: Arc<MapBasedCommandDispatcher>,
}

impl CommandConsumer for DispatchingConsumer {
    fn consume(&self, command: Command) -> BoxFuture<'static, crate::bus::Result<()>> {
        let dispatcher = Arc::clone(&self.dispatcher);
        Box::pin(async move {
            dispatcher
                .dispatch_command(command)
                .await
                .map_err(|err| BusError::Handler(err.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Open {
        owner: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Close;

    fn recording_handler(log: Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Arc<dyn CommandHandler> {
        super::super::command_handler(move |_command: Command| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(tag);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn type_handlers_run_before_global_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = MapBasedCommandDispatcher::new();
        dispatcher.register_command_handler::<Open>(recording_handler(Arc::clone(&log), "first"));
        dispatcher.register_command_handler::<Open>(recording_handler(Arc::clone(&log), "second"));
        dispatcher.register_global_handler(recording_handler(Arc::clone(&log), "global"));

        dispatcher
            .dispatch_command(Command::new(Open {
                owner: "jo".to_string(),
            }))
            .await
            .expect("dispatch should succeed");

        let seen = log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        assert_eq!(seen, vec!["first", "second", "global"]);
    }

    #[tokio::test]
    async fn first_error_aborts_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = MapBasedCommandDispatcher::new();
        dispatcher.register_command_handler::<Open>(super::super::command_handler(
            |_command: Command| async { Err(DispatchError::handler("rejected")) },
        ));
        let counter = Arc::clone(&calls);
        dispatcher.register_global_handler(super::super::command_handler(move |_command: Command| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        let err = dispatcher
            .dispatch_command(Command::new(Open {
                owner: "jo".to_string(),
            }))
            .await
            .expect_err("dispatch must fail");
        assert!(matches!(err, DispatchError::Handler(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "global handler must not run");
    }

    #[tokio::test]
    async fn unregistered_type_runs_only_global_handlers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = MapBasedCommandDispatcher::new();
        dispatcher.register_command_handler::<Open>(recording_handler(Arc::clone(&log), "typed"));
        dispatcher.register_global_handler(recording_handler(Arc::clone(&log), "global"));

        dispatcher
            .dispatch_command(Command::new(Close))
            .await
            .expect("dispatch should succeed");

        let seen = log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        assert_eq!(seen, vec!["global"]);
    }
}
