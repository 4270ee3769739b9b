//! Worker builder and lifecycle.
//!
//! The [`WorkerBuilder`] collects the handler and settings; `register`
//! performs the registration sequence:
//! 1. Check the handler provides Dispatch
//! 2. Claim the identity within this process
//! 3. Build the property store, transmit channel and signal channel
//! 4. Claim the bus name and export the worker surface
//! 5. Start the transmit pump and the signal task
//!
//! # Example
//!
//! ```ignore
//! use ygg_worker::{EchoHandler, MemoryBus, WorkerBuilder, WorkerIdentity};
//!
//! #[tokio::main]
//! async fn main() -> ygg_worker::Result<()> {
//!     let bus = MemoryBus::new();
//!     let worker = WorkerBuilder::new(WorkerIdentity::new("echo")?)
//!         .handler(EchoHandler::default())
//!         .remote_content(false)
//!         .register(&bus)
//!         .await?;
//!
//!     worker.run_until_shutdown().await
//! }
//! ```

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, BusSession};
use crate::config::WorkerConfig;
use crate::error::{HandlerKind, Result, WorkerError};
use crate::handler::{WorkerContext, WorkerHandler};
use crate::identity::WorkerIdentity;
use crate::message::{EventKind, Metadata};
use crate::properties::{PropertyStore, WorkerProperties};
use crate::service::{WorkerService, DEFAULT_MAX_CONCURRENT_DISPATCHES};
use crate::signal::{signal_channel, EventEmitter, DEFAULT_SIGNAL_CAPACITY};
use crate::transmit::{transmit_channel, TransmitConfig, TransmitHandle};

/// Default time shutdown waits for running dispatch handlers.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder for registering a worker on a bus.
pub struct WorkerBuilder {
    identity: WorkerIdentity,
    handler: Option<Arc<dyn WorkerHandler>>,
    properties: WorkerProperties,
    transmit_config: TransmitConfig,
    max_concurrent_dispatches: usize,
    lifecycle_events: bool,
    signal_capacity: usize,
    drain_timeout: Duration,
}

impl WorkerBuilder {
    pub fn new(identity: WorkerIdentity) -> Self {
        Self {
            identity,
            handler: None,
            properties: WorkerProperties::default(),
            transmit_config: TransmitConfig::default(),
            max_concurrent_dispatches: DEFAULT_MAX_CONCURRENT_DISPATCHES,
            lifecycle_events: false,
            signal_capacity: DEFAULT_SIGNAL_CAPACITY,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Set the worker handler.
    pub fn handler<H: WorkerHandler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Set a handler that is shared with other code.
    pub fn shared_handler(mut self, handler: Arc<dyn WorkerHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Initial `RemoteContent` value.
    ///
    /// Default: false
    pub fn remote_content(mut self, remote_content: bool) -> Self {
        self.properties.remote_content = remote_content;
        self
    }

    /// Publish an extra key in the `Features` property.
    pub fn feature(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.features.extra.insert(key.into(), value.into());
        self
    }

    /// Replace all initial property values.
    pub fn properties(mut self, properties: WorkerProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn transmit_config(mut self, config: TransmitConfig) -> Self {
        self.transmit_config = config;
        self
    }

    /// Outbound messages buffered before `transmit` reports backpressure.
    ///
    /// Default: 1024
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.transmit_config.queue_capacity = capacity;
        self
    }

    /// Concurrent outbound Transmit calls.
    ///
    /// Default: 64
    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.transmit_config.max_in_flight = limit;
        self
    }

    /// Timeout of a single outbound Transmit call.
    ///
    /// Default: 25 seconds
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.transmit_config.call_timeout = timeout;
        self
    }

    /// Maximum number of dispatch handlers running at once.
    ///
    /// When reached, Dispatch fails with `Busy`.
    /// Default: 256
    pub fn max_concurrent_dispatches(mut self, limit: usize) -> Self {
        self.max_concurrent_dispatches = limit;
        self
    }

    /// Emit `Begin`/`End` around dispatches and `Started`/`Stopped` around
    /// the worker lifetime.
    ///
    /// Default: off
    pub fn lifecycle_events(mut self, enabled: bool) -> Self {
        self.lifecycle_events = enabled;
        self
    }

    pub fn signal_capacity(mut self, capacity: usize) -> Self {
        self.signal_capacity = capacity;
        self
    }

    /// How long `shutdown` waits for running handlers.
    ///
    /// Default: 5 seconds
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Apply every setting from a loaded configuration.
    ///
    /// The identity is left as passed to [`new`](Self::new).
    pub fn config(mut self, config: &WorkerConfig) -> Result<Self> {
        self.transmit_config = config.transmit_config()?;
        self.drain_timeout = config.drain_timeout()?;
        self.max_concurrent_dispatches = config.max_concurrent_dispatches;
        self.lifecycle_events = config.lifecycle_events;
        self.signal_capacity = config.signal_capacity;
        self.properties.remote_content = config.remote_content;
        self.properties
            .features
            .extra
            .extend(config.features.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(self)
    }

    /// Register the worker on `bus`.
    ///
    /// # Errors
    ///
    /// - `UnimplementedHandler` if no handler provides Dispatch
    /// - `AlreadyRegistered` if this process already runs a worker with this identity
    /// - `BusUnavailable` / `NameTaken` from the bus
    pub async fn register<B: Bus + ?Sized>(self, bus: &B) -> Result<RegisteredWorker> {
        let handler = match self.handler {
            Some(h) if h.supports(HandlerKind::Dispatch) => h,
            _ => return Err(WorkerError::UnimplementedHandler(HandlerKind::Dispatch)),
        };

        let registration = Registration::acquire(&self.identity)?;

        let properties = PropertyStore::new(self.identity.interface_name(), self.properties);
        let (transmitter, transmit_queue) = transmit_channel(&self.transmit_config);
        let (events, signal_queue) =
            signal_channel(self.signal_capacity, &properties, handler.clone());
        let context = WorkerContext::new(transmitter, events, properties);

        let service = Arc::new(WorkerService::new(
            self.identity.clone(),
            handler,
            context,
            self.max_concurrent_dispatches,
            self.lifecycle_events,
        ));

        let session = bus.connect(&self.identity, service.clone()).await?;

        let shutdown = CancellationToken::new();
        let transmit_task = transmit_queue.spawn(session.clone(), shutdown.clone());
        let signal_task = signal_queue.spawn(session.clone(), shutdown.clone());

        tracing::info!(
            bus_name = %self.identity.bus_name(),
            object_path = %self.identity.object_path(),
            "Worker registered"
        );

        if self.lifecycle_events {
            service
                .events()
                .emit(EventKind::Started, "", "", Metadata::new());
        }

        Ok(RegisteredWorker {
            identity: self.identity,
            service,
            session,
            shutdown,
            stop: CancellationToken::new(),
            tasks: Some((transmit_task, signal_task)),
            drain_timeout: self.drain_timeout,
            lifecycle_events: self.lifecycle_events,
            _registration: registration,
        })
    }
}

/// A worker that owns its bus name.
///
/// Dropping it without calling [`shutdown`](Self::shutdown) stops the
/// background tasks but does not release the bus name.
pub struct RegisteredWorker {
    identity: WorkerIdentity,
    service: Arc<WorkerService>,
    session: Arc<dyn BusSession>,
    shutdown: CancellationToken,
    stop: CancellationToken,
    tasks: Option<(JoinHandle<()>, JoinHandle<()>)>,
    drain_timeout: Duration,
    lifecycle_events: bool,
    _registration: Registration,
}

impl RegisteredWorker {
    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn service(&self) -> &Arc<WorkerService> {
        &self.service
    }

    pub fn properties(&self) -> &PropertyStore {
        self.service.properties()
    }

    pub fn transmitter(&self) -> &TransmitHandle {
        self.service.transmitter()
    }

    pub fn events(&self) -> &EventEmitter {
        self.service.events()
    }

    /// Token that makes [`run_until_shutdown`](Self::run_until_shutdown) return.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Serve until Ctrl-C, SIGTERM or the stop token, then shut down.
    pub async fn run_until_shutdown(self) -> Result<()> {
        tokio::select! {
            _ = self.stop.cancelled() => tracing::info!("Stop requested"),
            result = termination() => {
                result?;
                tracing::info!("Termination signal received");
            }
        }
        self.shutdown().await
    }

    /// Unregister the worker.
    ///
    /// New dispatches are refused, running handlers get `drain_timeout` to
    /// finish, queued responses and signals are flushed, then the bus name
    /// is released.
    pub async fn shutdown(mut self) -> Result<()> {
        tracing::info!(bus_name = %self.identity.bus_name(), "Worker shutting down");
        self.service.close();

        if !self.service.wait_idle(self.drain_timeout).await {
            tracing::warn!(
                running = self.service.active_dispatches(),
                "Dispatch handlers still running after {:?}",
                self.drain_timeout
            );
        }

        if self.lifecycle_events {
            self.service
                .events()
                .emit(EventKind::Stopped, "", "", Metadata::new());
        }

        self.shutdown.cancel();
        if let Some((transmit_task, signal_task)) = self.tasks.take() {
            if let Err(e) = transmit_task.await {
                tracing::error!("Transmit task failed: {}", e);
            }
            if let Err(e) = signal_task.await {
                tracing::error!("Signal task failed: {}", e);
            }
        }

        let stats = self.service.transmitter().stats();
        tracing::debug!(
            delivered = stats.delivered,
            failed = stats.failed,
            "Transmit totals"
        );

        self.session.release().await?;
        tracing::info!(bus_name = %self.identity.bus_name(), "Worker unregistered");
        Ok(())
    }
}

impl Drop for RegisteredWorker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(unix)]
async fn termination() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn termination() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn registered() -> &'static Mutex<HashSet<String>> {
    static REGISTERED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    REGISTERED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Process-wide claim on a worker identity, released on drop.
struct Registration {
    bus_name: String,
}

impl Registration {
    fn acquire(identity: &WorkerIdentity) -> Result<Self> {
        let bus_name = identity.bus_name();
        if !registered().lock().insert(bus_name.clone()) {
            return Err(WorkerError::AlreadyRegistered(bus_name));
        }
        Ok(Self { bus_name })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        registered().lock().remove(&self.bus_name);
    }
}
