//! In-process bus.
//!
//! [`MemoryBus`] plays both sides of the message bus inside one process:
//! it owns the name table, routes inbound calls (`Dispatch`, `Cancel`,
//! property access) to registered workers, forwards `Transmit` to a
//! pluggable [`Dispatcher`] and records every emitted signal.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};

use super::{Bus, BusSession};
use crate::error::{Result, WorkerError};
use crate::identity::WorkerIdentity;
use crate::message::{CancelRequest, DispatchRequest, OutboundMessage, TransmitResult, WorkerEvent};
use crate::properties::{PropertiesChanged, PropertyValue};
use crate::service::WorkerService;

const SIGNAL_CAPACITY: usize = 256;

/// The dispatcher side of `Transmit`.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn transmit(&self, message: OutboundMessage) -> Result<TransmitResult>;
}

/// Dispatcher that records every transmitted message and answers with a
/// fixed result.
pub struct RecordingDispatcher {
    messages: Mutex<Vec<OutboundMessage>>,
    count: watch::Sender<usize>,
    result: TransmitResult,
}

impl Default for RecordingDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::with_result(TransmitResult::default())
    }

    pub fn with_result(result: TransmitResult) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            messages: Mutex::new(Vec::new()),
            count,
            result,
        }
    }

    /// Messages received so far, in arrival order.
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `n` messages arrived, up to `timeout`.
    ///
    /// Returns everything received so far, even on timeout.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<OutboundMessage> {
        let mut rx = self.count.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|count| *count >= n)).await;
        self.messages()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn transmit(&self, message: OutboundMessage) -> Result<TransmitResult> {
        let len = {
            let mut messages = self.messages.lock();
            messages.push(message);
            messages.len()
        };
        self.count.send_replace(len);
        Ok(self.result.clone())
    }
}

/// A signal observed on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusSignal {
    Event {
        sender: String,
        event: WorkerEvent,
    },
    PropertiesChanged {
        sender: String,
        change: PropertiesChanged,
    },
}

impl BusSignal {
    /// Bus name of the emitting worker.
    pub fn sender(&self) -> &str {
        match self {
            BusSignal::Event { sender, .. } => sender,
            BusSignal::PropertiesChanged { sender, .. } => sender,
        }
    }
}

enum Owner {
    Worker(Arc<WorkerService>),
    /// Name held by a connection outside this process.
    Foreign,
}

struct BusInner {
    available: AtomicBool,
    names: DashMap<String, Owner>,
    dispatcher: RwLock<Option<Arc<dyn Dispatcher>>>,
    signals: Mutex<Vec<BusSignal>>,
    signal_tx: broadcast::Sender<BusSignal>,
}

/// In-process message bus. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// A reachable bus with no dispatcher attached.
    pub fn new() -> Self {
        let (signal_tx, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                available: AtomicBool::new(true),
                names: DashMap::new(),
                dispatcher: RwLock::new(None),
                signals: Mutex::new(Vec::new()),
                signal_tx,
            }),
        }
    }

    pub fn with_dispatcher(dispatcher: Arc<dyn Dispatcher>) -> Self {
        let bus = Self::new();
        bus.set_dispatcher(dispatcher);
        bus
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        *self.inner.dispatcher.write() = Some(dispatcher);
    }

    /// Make the bus (un)reachable for new registrations.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
    }

    /// Mark `bus_name` as owned by some other connection.
    pub fn reserve_name(&self, bus_name: &str) {
        self.inner.names.insert(bus_name.to_string(), Owner::Foreign);
    }

    pub fn has_name(&self, bus_name: &str) -> bool {
        self.inner.names.contains_key(bus_name)
    }

    /// Call `Dispatch` on the worker owning `bus_name`.
    pub fn dispatch(&self, bus_name: &str, request: DispatchRequest) -> Result<()> {
        self.service(bus_name)?.dispatch(request)
    }

    /// Call `Cancel` on the worker owning `bus_name`.
    pub async fn cancel(&self, bus_name: &str, request: CancelRequest) -> Result<()> {
        self.service(bus_name)?.cancel(request).await
    }

    /// `org.freedesktop.DBus.Properties.Get`.
    pub fn get_property(
        &self,
        bus_name: &str,
        interface: &str,
        name: &str,
    ) -> Result<Option<PropertyValue>> {
        Ok(self.service(bus_name)?.get_property(interface, name))
    }

    /// `org.freedesktop.DBus.Properties.GetAll`.
    pub fn get_all_properties(
        &self,
        bus_name: &str,
        interface: &str,
    ) -> Result<BTreeMap<String, PropertyValue>> {
        Ok(self.service(bus_name)?.get_all_properties(interface))
    }

    /// `org.freedesktop.DBus.Properties.Set`.
    pub fn set_property(
        &self,
        bus_name: &str,
        interface: &str,
        name: &str,
        value: PropertyValue,
    ) -> Result<()> {
        self.service(bus_name)?.set_property(interface, name, value)
    }

    /// Every signal emitted so far.
    pub fn signals(&self) -> Vec<BusSignal> {
        self.inner.signals.lock().clone()
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<BusSignal> {
        self.inner.signal_tx.subscribe()
    }

    fn service(&self, bus_name: &str) -> Result<Arc<WorkerService>> {
        match self.inner.names.get(bus_name).as_deref() {
            Some(Owner::Worker(service)) => Ok(service.clone()),
            Some(Owner::Foreign) | None => Err(WorkerError::BusUnavailable(format!(
                "no worker serving {}",
                bus_name
            ))),
        }
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn connect(
        &self,
        identity: &WorkerIdentity,
        service: Arc<WorkerService>,
    ) -> Result<Arc<dyn BusSession>> {
        if !self.inner.available.load(Ordering::Acquire) {
            return Err(WorkerError::BusUnavailable("memory bus is offline".into()));
        }

        let bus_name = identity.bus_name();
        match self.inner.names.entry(bus_name.clone()) {
            Entry::Occupied(_) => return Err(WorkerError::NameTaken(bus_name)),
            Entry::Vacant(slot) => {
                slot.insert(Owner::Worker(service));
            }
        }
        tracing::debug!(bus_name = %bus_name, "Name acquired on memory bus");

        Ok(Arc::new(MemorySession {
            bus: self.inner.clone(),
            bus_name,
            released: AtomicBool::new(false),
        }))
    }
}

struct MemorySession {
    bus: Arc<BusInner>,
    bus_name: String,
    released: AtomicBool,
}

impl MemorySession {
    fn record(&self, signal: BusSignal) {
        self.bus.signals.lock().push(signal.clone());
        let _ = self.bus.signal_tx.send(signal);
    }
}

#[async_trait]
impl BusSession for MemorySession {
    async fn transmit(&self, message: &OutboundMessage) -> Result<TransmitResult> {
        let dispatcher = self.bus.dispatcher.read().clone();
        match dispatcher {
            Some(dispatcher) => dispatcher.transmit(message.clone()).await,
            None => Err(WorkerError::TransmitFailure(
                "no dispatcher on the bus".into(),
            )),
        }
    }

    async fn emit_event(&self, event: &WorkerEvent) -> Result<()> {
        self.record(BusSignal::Event {
            sender: self.bus_name.clone(),
            event: event.clone(),
        });
        Ok(())
    }

    async fn emit_properties_changed(&self, change: &PropertiesChanged) -> Result<()> {
        self.record(BusSignal::PropertiesChanged {
            sender: self.bus_name.clone(),
            change: change.clone(),
        });
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.bus
                .names
                .remove_if(&self.bus_name, |_, owner| matches!(owner, Owner::Worker(_)));
            tracing::debug!(bus_name = %self.bus_name, "Name released on memory bus");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Metadata;

    #[tokio::test]
    async fn test_recording_dispatcher_wait_for() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let d = dispatcher.clone();
        tokio::spawn(async move {
            for i in 0..3 {
                let msg = OutboundMessage::new("a", format!("m{}", i), "", Metadata::new(), bytes::Bytes::new());
                d.transmit(msg).await.unwrap();
            }
        });

        let got = dispatcher.wait_for(3, Duration::from_secs(1)).await;
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].message_id, "m0");
    }

    #[tokio::test]
    async fn test_wait_for_times_out_with_partial() {
        let dispatcher = RecordingDispatcher::new();
        let got = dispatcher.wait_for(1, Duration::from_millis(20)).await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_name_is_unavailable() {
        let bus = MemoryBus::new();
        let result = bus.dispatch(
            "com.redhat.Yggdrasil1.Worker1.nobody",
            DispatchRequest::new("", "m1", "", Metadata::new(), bytes::Bytes::new()),
        );
        assert!(matches!(result, Err(WorkerError::BusUnavailable(_))));
    }

    #[test]
    fn test_reserved_name_is_held() {
        let bus = MemoryBus::new();
        bus.reserve_name("com.redhat.Yggdrasil1.Worker1.other");
        assert!(bus.has_name("com.redhat.Yggdrasil1.Worker1.other"));
    }
}
