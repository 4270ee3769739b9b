//! Bus module - the seam between the protocol engine and the message bus.
//!
//! The engine does not know how the bus moves bytes. It needs:
//! - a way to claim the worker's name and export its surface ([`Bus::connect`])
//! - an owned session for outbound traffic ([`BusSession`])
//!
//! Implementations:
//! - [`MemoryBus`] - in-process bus, used by tests and embedders
//! - `DbusBus` - D-Bus via `zbus` (feature `dbus`)

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::identity::WorkerIdentity;
use crate::message::{OutboundMessage, TransmitResult, WorkerEvent};
use crate::properties::PropertiesChanged;
use crate::service::WorkerService;

#[cfg(feature = "dbus")]
mod dbus;
mod memory;

#[cfg(feature = "dbus")]
pub use dbus::{BusAddress, DbusBus};
pub use memory::{BusSignal, Dispatcher, MemoryBus, RecordingDispatcher};

/// A message bus a worker can register on.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Claim the worker's bus name and export `service` at its object path.
    ///
    /// # Errors
    ///
    /// - `BusUnavailable` if the bus cannot be reached
    /// - `NameTaken` if another connection owns the bus name
    async fn connect(
        &self,
        identity: &WorkerIdentity,
        service: Arc<WorkerService>,
    ) -> Result<Arc<dyn BusSession>>;
}

/// An established registration, owned by the worker for its lifetime.
#[async_trait]
pub trait BusSession: Send + Sync + 'static {
    /// Call `Transmit` on the dispatcher and wait for its answer.
    async fn transmit(&self, message: &OutboundMessage) -> Result<TransmitResult>;

    /// Emit the `Event` signal.
    async fn emit_event(&self, event: &WorkerEvent) -> Result<()>;

    /// Emit `org.freedesktop.DBus.Properties.PropertiesChanged`.
    async fn emit_properties_changed(&self, change: &PropertiesChanged) -> Result<()>;

    /// Release the bus name and stop serving inbound calls.
    async fn release(&self) -> Result<()>;
}
