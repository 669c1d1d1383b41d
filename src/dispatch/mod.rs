//! Dispatch managers.
//!
//! This module contains:
//! - `MapBasedCommandDispatcher` / `MapBasedVersionedEventDispatcher`:
//!   route messages to handlers registered by payload shape
//! - `CommandDispatchManager` / `EventDispatchManager`: consume a transport,
//!   dispatch each message, and supervise lifecycle (start, stop, errors)

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;

use crate::bus::BusError;
use crate::message::{Command, VersionedEvent};

mod command;
mod event;

pub use command::{CommandDispatchManager, MapBasedCommandDispatcher};
pub use event::{EventDispatchManager, MapBasedVersionedEventDispatcher};

/// Errors surfaced by dispatching.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("handler failed: {0}")]
    Handler(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl DispatchError {
    /// A handler-level failure with the given message.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

/// A function that takes a command. The first failing handler aborts the
/// dispatch and the message is rejected back onto the transport.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, command: Command) -> BoxFuture<'static, Result<(), DispatchError>>;
}

impl<F> CommandHandler for F
where
    F: Fn(Command) -> BoxFuture<'static, Result<(), DispatchError>> + Send + Sync,
{
    fn handle(&self, command: Command) -> BoxFuture<'static, Result<(), DispatchError>> {
        self(command)
    }
}

/// A function that takes a versioned event.
pub trait VersionedEventHandler: Send + Sync {
    fn handle(&self, event: VersionedEvent) -> BoxFuture<'static, Result<(), DispatchError>>;
}

impl<F> VersionedEventHandler for F
where
    F: Fn(VersionedEvent) -> BoxFuture<'static, Result<(), DispatchError>> + Send + Sync,
{
    fn handle(&self, event: VersionedEvent) -> BoxFuture<'static, Result<(), DispatchError>> {
        self(event)
    }
}

/// Wraps an async closure as a [`CommandHandler`].
pub fn command_handler<F, Fut>(handler: F) -> Arc<dyn CommandHandler>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
{
    Arc::new(move |command: Command| handler(command).boxed())
}

/// Wraps an async closure as a [`VersionedEventHandler`].
pub fn event_handler<F, Fut>(handler: F) -> Arc<dyn VersionedEventHandler>
where
    F: Fn(VersionedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
{
    Arc::new(move |event: VersionedEvent| handler(event).boxed())
}

/// Lifecycle of a dispatch manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Shared, observable manager state. Cloned handles stay valid after the
/// manager itself is consumed by `listen`.
#[derive(Clone)]
pub struct StateHandle(Arc<AtomicU8>);

impl StateHandle {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(0)))
    }

    pub fn get(&self) -> DispatchState {
        match self.0.load(Ordering::SeqCst) {
            1 => DispatchState::Running,
            2 => DispatchState::Stopping,
            3 => DispatchState::Stopped,
            _ => DispatchState::Idle,
        }
    }

    pub(crate) fn set(&self, state: DispatchState) {
        let value = match state {
            DispatchState::Idle => 0,
            DispatchState::Running => 1,
            DispatchState::Stopping => 2,
            DispatchState::Stopped => 3,
        };
        self.0.store(value, Ordering::SeqCst);
    }
}
