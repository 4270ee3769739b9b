//! Handler module - the worker-specific side of the protocol.
//!
//! Provides:
//! - [`WorkerHandler`] - capability set {dispatch, cancel, event} a worker implements
//! - [`HandlerSet`] - a `WorkerHandler` assembled from closures
//! - [`DispatchContext`] / [`WorkerContext`] - what a handler can do (transmit, emit, check cancellation)
//! - [`CancellationRegistry`] - advisory cancellation bookkeeping
//!
//! # Example
//!
//! ```ignore
//! use ygg_worker::handler::{DispatchContext, HandlerResult, WorkerHandler};
//! use ygg_worker::DispatchRequest;
//!
//! struct Upper;
//!
//! #[async_trait::async_trait]
//! impl WorkerHandler for Upper {
//!     async fn dispatch(&self, req: DispatchRequest, ctx: DispatchContext) -> HandlerResult {
//!         let data = req.data.to_ascii_uppercase();
//!         ctx.respond(req.metadata.clone(), data)?;
//!         Ok(())
//!     }
//! }
//! ```

mod cancel;
mod closures;
mod context;

use async_trait::async_trait;

pub use cancel::{CancellationGuard, CancellationRegistry};
pub use closures::{BoxFuture, HandlerSet};
pub use context::{DispatchContext, WorkerContext};

use crate::error::{HandlerKind, Result, WorkerError};
use crate::message::{CancelRequest, DispatchRequest, WorkerEvent};

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Worker-specific behaviour invoked by the protocol engine.
///
/// `dispatch` is required. `cancel` and `event` default to
/// `Err(UnimplementedHandler)`, which the engine reports to the caller
/// (Cancel) or logs (event observation).
#[async_trait]
pub trait WorkerHandler: Send + Sync + 'static {
    /// Whether this handler provides the given capability.
    ///
    /// The engine checks this before invoking a handler so a missing one is
    /// reported as `UnimplementedHandler` up front. Implementors that build
    /// their capability set at runtime override it; a handler reporting no
    /// `Dispatch` is refused at registration.
    fn supports(&self, kind: HandlerKind) -> bool {
        let _ = kind;
        true
    }

    /// Handle a dispatched message.
    ///
    /// Runs on its own task. Responses go out through `ctx`; returning does
    /// not wait for them to be delivered.
    async fn dispatch(&self, request: DispatchRequest, ctx: DispatchContext) -> HandlerResult;

    /// Handle a cancellation notice.
    ///
    /// The engine has already tripped the cancellation token of
    /// `request.cancel_id` if that dispatch is still running.
    async fn cancel(&self, request: CancelRequest, ctx: WorkerContext) -> HandlerResult {
        let _ = (request, ctx);
        Err(WorkerError::UnimplementedHandler(HandlerKind::Cancel))
    }

    /// Observe an event this worker is about to emit.
    async fn event(&self, event: &WorkerEvent) -> HandlerResult {
        let _ = event;
        Err(WorkerError::UnimplementedHandler(HandlerKind::Event))
    }
}
