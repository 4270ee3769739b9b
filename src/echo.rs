//! Echo worker.
//!
//! Answers every dispatched message with `loop_count` copies of itself:
//! same address, metadata and data, a fresh message id each time and
//! `response_to` pointing at the request. With a non-zero `sleep` it
//! pauses after each copy.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::EchoSettings;
use crate::error::Result;
use crate::handler::{DispatchContext, HandlerResult, WorkerContext, WorkerHandler};
use crate::message::{CancelRequest, DispatchRequest, WorkerEvent};

/// Name the echo worker registers under.
pub const ECHO_WORKER_NAME: &str = "echo";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoHandler {
    loop_count: u32,
    sleep: Duration,
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl EchoHandler {
    pub fn new(loop_count: u32, sleep: Duration) -> Self {
        Self { loop_count, sleep }
    }

    pub fn from_settings(settings: &EchoSettings) -> Result<Self> {
        Ok(Self::new(settings.loop_count, settings.sleep()?))
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn sleep(&self) -> Duration {
        self.sleep
    }
}

#[async_trait]
impl WorkerHandler for EchoHandler {
    async fn dispatch(&self, request: DispatchRequest, ctx: DispatchContext) -> HandlerResult {
        tracing::info!(
            address = %request.address,
            message_id = %request.message_id,
            response_to = %request.response_to,
            bytes = request.data.len(),
            "Echo dispatch"
        );

        // Every copy goes out even if a Cancel arrives meanwhile
        for i in 0..self.loop_count {
            let id = ctx
                .respond_wait(request.metadata.clone(), request.data.clone())
                .await?;
            tracing::debug!(iteration = i, message_id = %id, "Echo sent");

            if !self.sleep.is_zero() {
                tokio::time::sleep(self.sleep).await;
            }
        }

        tracing::info!(message_id = %request.message_id, "Echo done");
        Ok(())
    }

    async fn cancel(&self, request: CancelRequest, _ctx: WorkerContext) -> HandlerResult {
        tracing::info!(
            directive = %request.directive,
            message_id = %request.message_id,
            cancel_id = %request.cancel_id,
            "Echo cancel"
        );
        Ok(())
    }

    async fn event(&self, event: &WorkerEvent) -> HandlerResult {
        tracing::info!(
            kind = %event.kind,
            message_id = %event.message_id,
            response_to = %event.response_to,
            "Echo event"
        );
        Ok(())
    }
}
