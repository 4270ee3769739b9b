//! Worker service - the inbound surface the bus calls into.
//!
//! - `dispatch` - Dispatch engine: accept a request, run the handler on its own task
//! - `cancel` - Cancellation engine: trip the advisory token, forward to the handler
//! - `get_property` / `get_all_properties` / `set_property` - property interface
//!
//! Bus implementations hold an `Arc<WorkerService>` and translate their
//! wire calls into these methods.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};

use crate::error::{HandlerKind, Result, WorkerError};
use crate::handler::{CancellationRegistry, DispatchContext, WorkerContext, WorkerHandler};
use crate::identity::WorkerIdentity;
use crate::message::{CancelRequest, DispatchRequest, EventKind, Metadata};
use crate::properties::{PropertyStore, PropertyValue};
use crate::signal::EventEmitter;
use crate::transmit::TransmitHandle;

/// Default maximum concurrent dispatch handlers.
pub const DEFAULT_MAX_CONCURRENT_DISPATCHES: usize = 256;

/// Protocol engine for one registered worker.
pub struct WorkerService {
    identity: WorkerIdentity,
    handler: Arc<dyn WorkerHandler>,
    context: WorkerContext,
    cancellations: CancellationRegistry,
    permits: Arc<Semaphore>,
    idle: Arc<Notify>,
    max_concurrent: usize,
    lifecycle_events: bool,
    accepting: AtomicBool,
}

impl WorkerService {
    pub fn new(
        identity: WorkerIdentity,
        handler: Arc<dyn WorkerHandler>,
        context: WorkerContext,
        max_concurrent: usize,
        lifecycle_events: bool,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            identity,
            handler,
            context,
            cancellations: CancellationRegistry::new(),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            idle: Arc::new(Notify::new()),
            max_concurrent,
            lifecycle_events,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    pub fn properties(&self) -> &PropertyStore {
        self.context.properties()
    }

    pub fn transmitter(&self) -> &TransmitHandle {
        self.context.transmitter()
    }

    pub fn events(&self) -> &EventEmitter {
        self.context.events()
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    /// Dispatch handlers currently running.
    pub fn active_dispatches(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    /// Accept a dispatched message.
    ///
    /// Returns once the handler has been started on its own task, without
    /// waiting for it or for any transmit it issues. Handler failures are
    /// logged, never returned here.
    ///
    /// # Errors
    ///
    /// - `UnimplementedHandler` if the worker has no dispatch handler
    /// - `Busy` if `max_concurrent` handlers are already running
    /// - `ChannelClosed` once the worker is shutting down
    pub fn dispatch(&self, request: DispatchRequest) -> Result<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(WorkerError::ChannelClosed);
        }
        if !self.handler.supports(HandlerKind::Dispatch) {
            let err = WorkerError::UnimplementedHandler(HandlerKind::Dispatch);
            tracing::error!(message_id = %request.message_id, "{}", err);
            return Err(err);
        }

        let permit = self.permits.clone().try_acquire_owned().map_err(|_| {
            tracing::warn!(
                message_id = %request.message_id,
                "Dispatch capacity reached ({}), rejecting",
                self.max_concurrent
            );
            WorkerError::Busy(self.max_concurrent)
        })?;

        tracing::debug!(
            address = %request.address,
            message_id = %request.message_id,
            response_to = %request.response_to,
            bytes = request.data.len(),
            "Dispatch"
        );

        self.properties()
            .stamp_dispatched_at(&chrono::Utc::now().to_rfc3339());

        let guard = self.cancellations.register(&request.message_id);
        let ctx = DispatchContext::new(
            request.address.clone(),
            request.message_id.clone(),
            self.context.clone(),
            guard.token(),
        );
        let handler = self.handler.clone();
        let events = self.context.events().clone();
        let lifecycle = self.lifecycle_events;
        let idle = self.idle.clone();
        let message_id = request.message_id.clone();

        tokio::spawn(async move {
            if lifecycle {
                events.emit(EventKind::Begin, &message_id, "", Metadata::new());
            }

            // Inner task so a panicking handler is contained and reported
            let outcome = tokio::spawn(async move { handler.dispatch(request, ctx).await }).await;
            match outcome {
                Ok(Ok(())) => tracing::debug!(message_id = %message_id, "Dispatch done"),
                Ok(Err(e)) => {
                    tracing::error!(message_id = %message_id, "Dispatch handler failed: {}", e)
                }
                Err(e) if e.is_panic() => {
                    tracing::error!(message_id = %message_id, "Dispatch handler panicked")
                }
                Err(_) => tracing::warn!(message_id = %message_id, "Dispatch handler aborted"),
            }

            if lifecycle {
                events.emit(EventKind::End, &message_id, "", Metadata::new());
            }

            // Permit and registration are held until the handler finishes
            drop(guard);
            drop(permit);
            idle.notify_waiters();
        });

        Ok(())
    }

    /// Deliver a cancellation notice.
    ///
    /// Trips the cancellation token of `cancel_id` if that dispatch is still
    /// running, then runs the cancel handler in the calling context. An
    /// unknown `cancel_id` is not an error. Handler failures are logged.
    ///
    /// # Errors
    ///
    /// - `UnimplementedHandler` if the worker has no cancel handler
    pub async fn cancel(&self, request: CancelRequest) -> Result<()> {
        let tripped = self.cancellations.cancel(&request.cancel_id);
        tracing::debug!(
            directive = %request.directive,
            message_id = %request.message_id,
            cancel_id = %request.cancel_id,
            running = tripped,
            "Cancel"
        );

        if !self.handler.supports(HandlerKind::Cancel) {
            let err = WorkerError::UnimplementedHandler(HandlerKind::Cancel);
            tracing::error!(cancel_id = %request.cancel_id, "{}", err);
            return Err(err);
        }

        let cancel_id = request.cancel_id.clone();
        match self.handler.cancel(request, self.context.clone()).await {
            Ok(()) => Ok(()),
            Err(e @ WorkerError::UnimplementedHandler(_)) => {
                tracing::error!(cancel_id = %cancel_id, "{}", e);
                Err(e)
            }
            Err(e) => {
                tracing::error!(cancel_id = %cancel_id, "Cancel handler failed: {}", e);
                Ok(())
            }
        }
    }

    /// Property `Get`. Unknown names resolve to `None`.
    pub fn get_property(&self, interface: &str, name: &str) -> Option<PropertyValue> {
        self.properties().get(interface, name)
    }

    /// Property `GetAll`, as an independent snapshot.
    pub fn get_all_properties(&self, interface: &str) -> BTreeMap<String, PropertyValue> {
        self.properties().get_all(interface)
    }

    /// Property `Set` from the bus. Emits `PropertiesChanged`.
    pub fn set_property(&self, interface: &str, name: &str, value: PropertyValue) -> Result<()> {
        self.properties().set_and_notify(interface, name, value)
    }

    /// Stop accepting new dispatches.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Wait until no dispatch handler is running, up to `timeout`.
    ///
    /// Takes no dispatch capacity, so dispatches accepted meanwhile are
    /// waited for too. Returns false if handlers were still running at the
    /// deadline.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                // Registered before the check so a finishing handler is not missed
                notified.as_mut().enable();
                if self.active_dispatches() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}
