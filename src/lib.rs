//! # ygg-worker
//!
//! Worker-side protocol engine for the Yggdrasil message-bus dispatch
//! framework.
//!
//! A worker claims a well-known name on the bus, receives `Dispatch` and
//! `Cancel` calls from the dispatcher daemon, answers through the
//! dispatcher's `Transmit` method and publishes `Event` signals and a small
//! set of properties.
//!
//! ## Architecture
//!
//! - **Inbound** ([`WorkerService`]): Dispatch returns as soon as the handler
//!   task is started; Cancel trips an advisory token and runs the cancel handler
//! - **Outbound** ([`transmit`]): bounded queue drained by a pump, one delivery
//!   task per message, at-most-once
//! - **Signals** ([`signal`]): `Event` and `PropertiesChanged`, fire-and-forget
//! - **Bus** ([`bus`]): [`MemoryBus`] in process, `DbusBus` over D-Bus (feature `dbus`)
//!
//! ## Example
//!
//! ```ignore
//! use ygg_worker::{HandlerSet, MemoryBus, WorkerBuilder, WorkerIdentity};
//!
//! #[tokio::main]
//! async fn main() -> ygg_worker::Result<()> {
//!     let bus = MemoryBus::new();
//!     let worker = WorkerBuilder::new(WorkerIdentity::new("echo")?)
//!         .handler(HandlerSet::new().on_dispatch(|req, ctx| async move {
//!             ctx.respond(req.metadata.clone(), req.data.clone())?;
//!             Ok(())
//!         }))
//!         .register(&bus)
//!         .await?;
//!
//!     worker.run_until_shutdown().await
//! }
//! ```

pub mod bus;
pub mod codec;
pub mod config;
pub mod echo;
pub mod error;
pub mod handler;
pub mod identity;
pub mod logging;
pub mod message;
pub mod properties;
pub mod service;
pub mod signal;
pub mod transmit;
pub mod worker;

#[cfg(feature = "dbus")]
pub use bus::{BusAddress, DbusBus};
pub use bus::{Bus, BusSession, MemoryBus};
pub use config::{WorkerArgs, WorkerConfig};
pub use echo::EchoHandler;
pub use error::{HandlerKind, Result, WorkerError};
pub use handler::{DispatchContext, HandlerSet, WorkerContext, WorkerHandler};
pub use identity::WorkerIdentity;
pub use message::{CancelRequest, DispatchRequest, EventKind, Metadata, OutboundMessage, WorkerEvent};
pub use properties::{PropertyStore, PropertyValue};
pub use service::WorkerService;
pub use worker::{RegisteredWorker, WorkerBuilder};
