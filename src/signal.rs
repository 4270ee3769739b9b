//! Signal emitter - out-of-band `Event` and `PropertiesChanged` signals.
//!
//! Emitting is fire-and-forget: [`EventEmitter::emit`] queues the event and
//! returns. A single signal task forwards queued events and property
//! change notifications to the bus session, in order. `DispatchedAt`
//! stamps arrive coalesced and go out as one `Features` change.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::BusSession;
use crate::error::{HandlerKind, WorkerError};
use crate::handler::WorkerHandler;
use crate::message::{EventKind, Metadata, WorkerEvent};
use crate::properties::{PropertiesChanged, PropertyName, PropertyStore};

/// Default capacity of the event queue.
pub const DEFAULT_SIGNAL_CAPACITY: usize = 256;

/// Handle for emitting `Event` signals. Cheap to clone.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<WorkerEvent>,
}

impl EventEmitter {
    /// Queue an `Event` signal.
    ///
    /// Never blocks and never fails: a full queue or a stopped worker is
    /// logged and the event dropped.
    pub fn emit(&self, kind: EventKind, message_id: &str, response_to: &str, data: Metadata) {
        self.emit_event(WorkerEvent::new(kind, message_id, response_to, data));
    }

    pub fn emit_event(&self, event: WorkerEvent) {
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    tracing::warn!(kind = %event.kind, message_id = %event.message_id, "Signal queue full, event dropped");
                }
                mpsc::error::TrySendError::Closed(event) => {
                    tracing::debug!(kind = %event.kind, "Worker stopped, event dropped");
                }
            }
        }
    }
}

/// Receiving side of the signal channel.
pub struct SignalQueue {
    events: mpsc::Receiver<WorkerEvent>,
    changes: broadcast::Receiver<PropertiesChanged>,
    stamps: watch::Receiver<()>,
    properties: PropertyStore,
    handler: Arc<dyn WorkerHandler>,
}

/// Create the signal channel.
///
/// Subscribes to `properties` right away. Call it before the store is
/// shared so no change is missed between registration and the task start.
pub fn signal_channel(
    capacity: usize,
    properties: &PropertyStore,
    handler: Arc<dyn WorkerHandler>,
) -> (EventEmitter, SignalQueue) {
    let (tx, events) = mpsc::channel(capacity.max(1));
    (
        EventEmitter { tx },
        SignalQueue {
            events,
            changes: properties.subscribe(),
            stamps: properties.subscribe_stamps(),
            properties: properties.clone(),
            handler,
        },
    )
}

impl SignalQueue {
    /// Spawn the task forwarding signals to `session`.
    ///
    /// On `shutdown`, already queued events are flushed before the task ends.
    pub fn spawn(self, session: Arc<dyn BusSession>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(signal_loop(self, session, shutdown))
    }
}

async fn signal_loop(queue: SignalQueue, session: Arc<dyn BusSession>, shutdown: CancellationToken) {
    let SignalQueue {
        mut events,
        mut changes,
        mut stamps,
        properties,
        handler,
    } = queue;
    let observe = handler.supports(HandlerKind::Event);
    if !observe {
        tracing::warn!("Worker has no event handler; events are emitted without local observation");
    }

    let mut changes_open = true;
    let mut stamps_open = true;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            event = events.recv() => match event {
                Some(event) => forward_event(&*session, &*handler, observe, event).await,
                None => break,
            },

            change = changes.recv(), if changes_open => match change {
                Ok(change) => forward_change(&*session, &change).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} property change notifications", n);
                }
                Err(broadcast::error::RecvError::Closed) => changes_open = false,
            },

            stamped = stamps.changed(), if stamps_open => match stamped {
                Ok(()) => forward_stamp(&*session, &mut stamps, &properties).await,
                Err(_) => stamps_open = false,
            },
        }
    }

    events.close();
    while let Some(event) = events.recv().await {
        forward_event(&*session, &*handler, observe, event).await;
    }
    loop {
        match changes.try_recv() {
            Ok(change) => forward_change(&*session, &change).await,
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                tracing::warn!("Missed {} property change notifications", n);
            }
            Err(_) => break,
        }
    }
    if stamps.has_changed().unwrap_or(false) {
        forward_stamp(&*session, &mut stamps, &properties).await;
    }
    tracing::debug!("Signal task stopped");
}

async fn forward_event(
    session: &dyn BusSession,
    handler: &dyn WorkerHandler,
    observe: bool,
    event: WorkerEvent,
) {
    if observe {
        match handler.event(&event).await {
            Ok(()) => {}
            Err(e @ WorkerError::UnimplementedHandler(_)) => {
                tracing::error!(kind = %event.kind, "{}", e);
            }
            Err(e) => {
                tracing::error!(kind = %event.kind, "Event handler failed: {}", e);
            }
        }
    }

    tracing::debug!(kind = %event.kind, message_id = %event.message_id, "Emitting event");
    if let Err(e) = session.emit_event(&event).await {
        tracing::error!(kind = %event.kind, "Failed to emit event: {}", e);
    }
}

async fn forward_stamp(
    session: &dyn BusSession,
    stamps: &mut watch::Receiver<()>,
    properties: &PropertyStore,
) {
    stamps.mark_unchanged();
    let change = properties.changed_now(&[PropertyName::Features]);
    forward_change(session, &change).await;
}

async fn forward_change(session: &dyn BusSession, change: &PropertiesChanged) {
    if let Err(e) = session.emit_properties_changed(change).await {
        tracing::error!(interface = %change.interface, "Failed to emit PropertiesChanged: {}", e);
    }
}
