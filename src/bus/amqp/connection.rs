//! Reconnection supervisor.
//!
//! A single task owns the broker connection. Workers that observe a failure
//! call [`ReconnectionSupervisor::reconnect`] with the context they were
//! using; only a caller whose context matches the supervisor's current one
//! transitions it to `reconnecting` and drives the dial. Everyone else gets
//! the already-refreshed connection and the new context back immediately,
//! so a shared disconnect never triggers a thundering herd of redials.
//!
//! The supervisor is generic over the dialed handle, which keeps the
//! context protocol testable without a broker.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use crate::bus::retry::{with_backoff, DIAL_ATTEMPTS};
use crate::bus::{BusError, Result};
use crate::ConnectionStringResolver;

/// Dials a connection from a resolved connection string.
pub type DialFn<C> = Arc<dyn Fn(String) -> BoxFuture<'static, Result<C>> + Send + Sync>;

/// Invoked with the fresh connection and new context after every successful
/// dial, before any waiting worker is answered.
pub type RebindHook<C> = Arc<dyn Fn(&Arc<C>, u64) + Send + Sync>;

struct ReconnectRequest<C> {
    context: u64,
    reply: oneshot::Sender<(Arc<C>, u64)>,
}

/// Serializes reconnect attempts across the publisher and all consumers.
pub struct ReconnectionSupervisor<C: Send + Sync + 'static> {
    requests: mpsc::Sender<ReconnectRequest<C>>,
}

impl<C: Send + Sync + 'static> Clone for ReconnectionSupervisor<C> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> ReconnectionSupervisor<C> {
    /// Starts the supervisor task. The initial context is 0 with no
    /// connection, so the first caller always drives a dial.
    pub fn spawn(
        resolver: ConnectionStringResolver,
        dial: DialFn<C>,
        rebind: Option<RebindHook<C>>,
    ) -> Self {
        let (requests, mut receiver) = mpsc::channel::<ReconnectRequest<C>>(16);

        tokio::spawn(async move {
            let mut context: u64 = 0;
            let mut connection: Option<Arc<C>> = None;

            while let Some(request) = receiver.recv().await {
                if request.context == context {
                    info!(context, state = "reconnecting", "dialing transport");
                    let dialed = Arc::new(dial_until_connected(&resolver, &dial).await);
                    context += 1;
                    if let Some(hook) = &rebind {
                        hook(&dialed, context);
                    }
                    info!(context, state = "connected", "transport reconnected");
                    connection = Some(dialed);
                }

                match &connection {
                    Some(current) => {
                        let _ = request.reply.send((Arc::clone(current), context));
                    }
                    // Unreachable: the first request always dials.
                    None => drop(request.reply),
                }
            }
        });

        Self { requests }
    }

    /// Presents `context` and waits for `(connection, new_context)`.
    ///
    /// When `context` is current, this call drives the dial (blocking until
    /// the broker is reachable again); a stale context returns the existing
    /// connection immediately.
    pub async fn reconnect(&self, context: u64) -> Result<(Arc<C>, u64)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(ReconnectRequest {
                context,
                reply: reply_tx,
            })
            .await
            .map_err(|_| BusError::Closed)?;
        reply_rx.await.map_err(|_| BusError::Closed)
    }
}

/// Runs 10-attempt dial blocks forever until a dial succeeds. The resolver
/// is consulted on every attempt so rotated credentials are picked up.
async fn dial_until_connected<C>(resolver: &ConnectionStringResolver, dial: &DialFn<C>) -> C {
    loop {
        let attempt_resolver = Arc::clone(resolver);
        let attempt_dial = Arc::clone(dial);
        let block = with_backoff(DIAL_ATTEMPTS, "transport.dial", move || {
            let resolver = Arc::clone(&attempt_resolver);
            let dial = Arc::clone(&attempt_dial);
            async move {
                let url = resolver().map_err(|err| {
                    BusError::Connection(format!("resolving connection string: {err}"))
                })?;
                dial(url).await
            }
        })
        .await;

        match block {
            Ok(connection) => return connection,
            Err(err) => {
                error!(error = %err, "dial block exhausted, restarting backoff");
            }
        }
    }
}
