//! Closure-backed handlers.
//!
//! [`HandlerSet`] builds a [`WorkerHandler`] from plain async closures.
//! Capabilities left unset are reported as unsupported.
//!
//! # Example
//!
//! ```ignore
//! use ygg_worker::handler::HandlerSet;
//!
//! let handler = HandlerSet::new()
//!     .on_dispatch(|req, ctx| async move {
//!         ctx.respond(req.metadata.clone(), req.data.clone())?;
//!         Ok(())
//!     })
//!     .on_cancel(|req, _ctx| async move {
//!         tracing::info!("cancel {}", req.cancel_id);
//!         Ok(())
//!     });
//! ```

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use super::{DispatchContext, HandlerResult, WorkerContext, WorkerHandler};
use crate::error::{HandlerKind, WorkerError};
use crate::message::{CancelRequest, DispatchRequest, WorkerEvent};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type DispatchFn =
    dyn Fn(DispatchRequest, DispatchContext) -> BoxFuture<'static, HandlerResult> + Send + Sync;
type CancelFn =
    dyn Fn(CancelRequest, WorkerContext) -> BoxFuture<'static, HandlerResult> + Send + Sync;
type EventFn = dyn Fn(WorkerEvent) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// A [`WorkerHandler`] made of optional closures.
#[derive(Default)]
pub struct HandlerSet {
    dispatch: Option<Box<DispatchFn>>,
    cancel: Option<Box<CancelFn>>,
    event: Option<Box<EventFn>>,
}

impl HandlerSet {
    /// Create an empty handler set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dispatch handler.
    pub fn on_dispatch<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(DispatchRequest, DispatchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.dispatch = Some(Box::new(
            move |req, ctx| -> BoxFuture<'static, HandlerResult> { Box::pin(handler(req, ctx)) },
        ));
        self
    }

    /// Set the cancel handler.
    pub fn on_cancel<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(CancelRequest, WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.cancel = Some(Box::new(
            move |req, ctx| -> BoxFuture<'static, HandlerResult> { Box::pin(handler(req, ctx)) },
        ));
        self
    }

    /// Set the event observer.
    pub fn on_event<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(WorkerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.event = Some(Box::new(
            move |event| -> BoxFuture<'static, HandlerResult> { Box::pin(handler(event)) },
        ));
        self
    }
}

#[async_trait]
impl WorkerHandler for HandlerSet {
    fn supports(&self, kind: HandlerKind) -> bool {
        match kind {
            HandlerKind::Dispatch => self.dispatch.is_some(),
            HandlerKind::Cancel => self.cancel.is_some(),
            HandlerKind::Event => self.event.is_some(),
        }
    }

    async fn dispatch(&self, request: DispatchRequest, ctx: DispatchContext) -> HandlerResult {
        match &self.dispatch {
            Some(f) => f(request, ctx).await,
            None => Err(WorkerError::UnimplementedHandler(HandlerKind::Dispatch)),
        }
    }

    async fn cancel(&self, request: CancelRequest, ctx: WorkerContext) -> HandlerResult {
        match &self.cancel {
            Some(f) => f(request, ctx).await,
            None => Err(WorkerError::UnimplementedHandler(HandlerKind::Cancel)),
        }
    }

    async fn event(&self, event: &WorkerEvent) -> HandlerResult {
        match &self.event {
            Some(f) => f(event.clone()).await,
            None => Err(WorkerError::UnimplementedHandler(HandlerKind::Event)),
        }
    }
}
