//! D-Bus transport via `zbus`.
//!
//! Exports the worker interface at the worker's object path, owns the
//! worker's well-known name and calls `Transmit` on the dispatcher.
//!
//! The interface and dispatcher names are fixed at compile time, so only
//! the default namespace (`com.redhat.Yggdrasil1`) can be served.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use zbus::fdo;
use zbus::names::InterfaceName;
use zbus::zvariant::Value;
use zbus::{Connection, SignalContext};

use super::{Bus, BusSession};
use crate::config::{BusKind, WorkerConfig};
use crate::error::{Result, WorkerError};
use crate::identity::{WorkerIdentity, DEFAULT_NAMESPACE};
use crate::message::{CancelRequest, DispatchRequest, OutboundMessage, TransmitResult, WorkerEvent};
use crate::properties::{PropertiesChanged, PropertyValue};
use crate::service::WorkerService;

/// Where to find the bus.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BusAddress {
    #[default]
    Session,
    System,
    Address(String),
}

/// The D-Bus message bus.
#[derive(Debug, Clone, Default)]
pub struct DbusBus {
    address: BusAddress,
}

impl DbusBus {
    pub fn new(address: BusAddress) -> Self {
        Self { address }
    }

    pub fn session() -> Self {
        Self::new(BusAddress::Session)
    }

    pub fn system() -> Self {
        Self::new(BusAddress::System)
    }

    pub fn from_config(config: &WorkerConfig) -> Result<Self> {
        let address = match config.bus {
            BusKind::Session => BusAddress::Session,
            BusKind::System => BusAddress::System,
            BusKind::Address => BusAddress::Address(config.address.clone().ok_or_else(|| {
                WorkerError::Config("bus = \"address\" requires an address".into())
            })?),
        };
        Ok(Self::new(address))
    }

    fn builder(&self) -> zbus::Result<zbus::connection::Builder<'static>> {
        match &self.address {
            BusAddress::Session => zbus::connection::Builder::session(),
            BusAddress::System => zbus::connection::Builder::system(),
            BusAddress::Address(addr) => zbus::connection::Builder::address(addr.as_str()),
        }
    }
}

#[async_trait]
impl Bus for DbusBus {
    async fn connect(
        &self,
        identity: &WorkerIdentity,
        service: Arc<WorkerService>,
    ) -> Result<Arc<dyn BusSession>> {
        if identity.namespace() != DEFAULT_NAMESPACE {
            return Err(WorkerError::Config(format!(
                "D-Bus transport serves only the {} namespace, got {}",
                DEFAULT_NAMESPACE,
                identity.namespace()
            )));
        }

        let bus_name = identity.bus_name();
        let path = identity.object_path();

        let connection = self
            .builder()
            .and_then(|b| b.name(bus_name.clone()))
            .and_then(|b| b.serve_at(path.clone(), WorkerInterface { service }))
            .map_err(unavailable)?
            .build()
            .await
            .map_err(|e| match e {
                zbus::Error::NameTaken => WorkerError::NameTaken(bus_name.clone()),
                other => unavailable(other),
            })?;

        let dispatcher = Dispatcher1Proxy::new(&connection)
            .await
            .map_err(unavailable)?;

        tracing::debug!(bus_name = %bus_name, object_path = %path, "Name acquired on D-Bus");

        Ok(Arc::new(DbusSession {
            connection,
            dispatcher,
            bus_name,
            path,
            released: AtomicBool::new(false),
        }))
    }
}

fn unavailable(e: zbus::Error) -> WorkerError {
    WorkerError::BusUnavailable(e.to_string())
}

fn to_fdo(e: WorkerError) -> fdo::Error {
    let msg = e.to_string();
    match e {
        WorkerError::UnimplementedHandler(_) => fdo::Error::NotSupported(msg),
        WorkerError::Busy(_) | WorkerError::Backpressure => fdo::Error::LimitsExceeded(msg),
        WorkerError::UnknownProperty(_) => fdo::Error::UnknownProperty(msg),
        WorkerError::InvalidProperty { .. } | WorkerError::UnknownEvent(_) => {
            fdo::Error::InvalidArgs(msg)
        }
        _ => fdo::Error::Failed(msg),
    }
}

/// The exported `Worker1` object.
struct WorkerInterface {
    service: Arc<WorkerService>,
}

#[zbus::interface(name = "com.redhat.Yggdrasil1.Worker1")]
impl WorkerInterface {
    async fn dispatch(
        &self,
        addr: String,
        id: String,
        response_to: String,
        metadata: HashMap<String, String>,
        data: Vec<u8>,
    ) -> fdo::Result<()> {
        let request = DispatchRequest::new(addr, id, response_to, metadata, Bytes::from(data));
        self.service.dispatch(request).map_err(to_fdo)
    }

    async fn cancel(&self, directive: String, id: String, cancel_id: String) -> fdo::Result<()> {
        let request = CancelRequest::new(directive, id, cancel_id);
        self.service.cancel(request).await.map_err(to_fdo)
    }

    #[zbus(signal)]
    async fn event(
        ctxt: &SignalContext<'_>,
        name: u32,
        message_id: &str,
        response_to: &str,
        data: HashMap<String, String>,
    ) -> zbus::Result<()>;

    #[zbus(property(emits_changed_signal = "false"))]
    async fn remote_content(&self) -> bool {
        self.service.properties().snapshot().remote_content
    }

    #[zbus(property)]
    async fn set_remote_content(&mut self, value: bool) {
        self.store_property("RemoteContent", PropertyValue::Bool(value));
    }

    #[zbus(property(emits_changed_signal = "false"))]
    async fn features(&self) -> HashMap<String, String> {
        self.service
            .properties()
            .snapshot()
            .features
            .to_map()
            .into_iter()
            .collect()
    }

    #[zbus(property)]
    async fn set_features(&mut self, value: HashMap<String, String>) {
        self.store_property("Features", PropertyValue::Map(value.into_iter().collect()));
    }
}

impl WorkerInterface {
    // Types are already checked by the D-Bus signature
    fn store_property(&self, name: &str, value: PropertyValue) {
        let interface = self.service.identity().interface_name();
        if let Err(e) = self.service.set_property(&interface, name, value) {
            tracing::error!(property = name, "Property Set failed: {}", e);
        }
    }
}

#[zbus::proxy(
    interface = "com.redhat.Yggdrasil1.Dispatcher1",
    default_service = "com.redhat.Yggdrasil1.Dispatcher1",
    default_path = "/com/redhat/Yggdrasil1/Dispatcher1"
)]
trait Dispatcher1 {
    fn transmit(
        &self,
        addr: &str,
        id: &str,
        response_to: &str,
        metadata: &HashMap<String, String>,
        data: &[u8],
    ) -> zbus::Result<(i32, HashMap<String, String>, Vec<u8>)>;
}

struct DbusSession {
    connection: Connection,
    dispatcher: Dispatcher1Proxy<'static>,
    bus_name: String,
    path: String,
    released: AtomicBool,
}

impl DbusSession {
    fn signal_context(&self) -> Result<SignalContext<'_>> {
        SignalContext::new(&self.connection, self.path.as_str()).map_err(unavailable)
    }
}

fn to_value(value: &PropertyValue) -> Value<'static> {
    match value {
        PropertyValue::Bool(b) => Value::from(*b),
        PropertyValue::Str(s) => Value::from(s.clone()),
        PropertyValue::Map(map) => {
            let map: HashMap<String, String> = map.clone().into_iter().collect();
            Value::from(map)
        }
    }
}

#[async_trait]
impl BusSession for DbusSession {
    async fn transmit(&self, message: &OutboundMessage) -> Result<TransmitResult> {
        let (code, metadata, data) = self
            .dispatcher
            .transmit(
                &message.address,
                &message.message_id,
                &message.response_to,
                &message.metadata,
                &message.data,
            )
            .await
            .map_err(|e| WorkerError::TransmitFailure(e.to_string()))?;

        Ok(TransmitResult {
            code,
            metadata,
            data: Bytes::from(data),
        })
    }

    async fn emit_event(&self, event: &WorkerEvent) -> Result<()> {
        let ctxt = self.signal_context()?;
        WorkerInterface::event(
            &ctxt,
            event.kind.code(),
            &event.message_id,
            &event.response_to,
            event.data.clone(),
        )
        .await
        .map_err(unavailable)
    }

    async fn emit_properties_changed(&self, change: &PropertiesChanged) -> Result<()> {
        let ctxt = self.signal_context()?;
        let interface = InterfaceName::try_from(change.interface.as_str())
            .map_err(|e| WorkerError::UnknownProperty(e.to_string()))?;

        let values: Vec<(&str, Value<'static>)> = change
            .changed
            .iter()
            .map(|(name, value)| (name.as_str(), to_value(value)))
            .collect();
        let changed: HashMap<&str, &Value<'_>> =
            values.iter().map(|(name, value)| (*name, value)).collect();
        let invalidated: Vec<&str> = change.invalidated.iter().map(String::as_str).collect();

        fdo::Properties::properties_changed(&ctxt, interface, &changed, &invalidated)
            .await
            .map_err(unavailable)
    }

    async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self
            .connection
            .object_server()
            .remove::<WorkerInterface, _>(self.path.as_str())
            .await
        {
            tracing::warn!(object_path = %self.path, "Failed to unexport worker: {}", e);
        }
        self.connection
            .release_name(self.bus_name.as_str())
            .await
            .map_err(unavailable)?;
        tracing::debug!(bus_name = %self.bus_name, "Name released on D-Bus");
        Ok(())
    }
}
