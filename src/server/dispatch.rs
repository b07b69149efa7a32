use std::any::Any;
use std::sync::Arc;

use mio::Waker;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{trace, warn};

use crate::error::HandlerError;
use crate::http::handler::Handler;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::server::monitor::{ConnectionId, IdleSink};

/// Work handed back to the event loop thread.
#[derive(Debug)]
pub enum LoopMessage {
    Completed {
        id: ConnectionId,
        outcome: Result<Response, HandlerError>,
    },
    IdleExpired(ConnectionId),
    Shutdown,
}

/// Queues a message for the loop and wakes its poll.
#[derive(Debug, Clone)]
pub struct LoopNotifier {
    tx: UnboundedSender<LoopMessage>,
    waker: Arc<Waker>,
}

impl LoopNotifier {
    pub fn new(tx: UnboundedSender<LoopMessage>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }

    /// Returns `false` once the loop has stopped.
    pub fn send(&self, message: LoopMessage) -> bool {
        if self.tx.send(message).is_err() {
            return false;
        }
        if let Err(err) = self.waker.wake() {
            warn!(error = %err, "Failed to wake event loop");
        }
        true
    }
}

impl IdleSink for LoopNotifier {
    fn idle_expired(&self, id: ConnectionId) -> bool {
        self.send(LoopMessage::IdleExpired(id))
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Runs handlers off the event loop, at most `workers` at a time.
pub struct Dispatcher {
    runtime: Handle,
    handler: Arc<dyn Handler>,
    permits: Arc<Semaphore>,
    notifier: LoopNotifier,
}

impl Dispatcher {
    pub fn new(runtime: Handle, handler: Arc<dyn Handler>, workers: usize, notifier: LoopNotifier) -> Self {
        Self {
            runtime,
            handler,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            notifier,
        }
    }

    /// Queues `request`. The outcome comes back as [`LoopMessage::Completed`].
    pub fn dispatch(&self, id: ConnectionId, request: Request) {
        let handler = Arc::clone(&self.handler);
        let permits = Arc::clone(&self.permits);
        let notifier = self.notifier.clone();

        self.runtime.spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(permit) => {
                    let joined = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        handler.handle(request)
                    })
                    .await;

                    match joined {
                        Ok(outcome) => outcome,
                        Err(err) if err.is_panic() => {
                            Err(HandlerError::new(panic_message(err.into_panic())))
                        }
                        Err(_) => Err(HandlerError::new("handler cancelled")),
                    }
                }
                Err(_) => Err(HandlerError::new("worker pool closed")),
            };

            trace!(conn = %id, ok = outcome.is_ok(), "Handler finished");
            notifier.send(LoopMessage::Completed { id, outcome });
        });
    }

    /// Stops admitting new handler runs.
    pub fn close(&self) {
        self.permits.close();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => format!("handler panicked: {msg}"),
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(msg) => format!("handler panicked: {msg}"),
            Err(_) => "handler panicked".to_string(),
        },
    }
}
