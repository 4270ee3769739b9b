//! Contexts handed to worker handlers.
//!
//! [`WorkerContext`] gives access to the worker-wide side channels:
//! - `transmit` / `send` - schedule an outbound message to the dispatcher
//! - `emit` - queue an `Event` signal
//! - `properties` - the shared property store
//!
//! [`DispatchContext`] adds what belongs to a single dispatched message:
//! - `respond` - reply to the request with a fresh message id
//! - `is_cancelled` / `cancelled` - advisory cancellation state
//!
//! # Example
//!
//! ```ignore
//! async fn handle(req: DispatchRequest, ctx: DispatchContext) -> HandlerResult {
//!     for chunk in req.data.chunks(1024) {
//!         if ctx.is_cancelled() {
//!             break;
//!         }
//!         ctx.respond(Metadata::new(), Bytes::copy_from_slice(chunk))?;
//!     }
//!     Ok(())
//! }
//! ```

use bytes::Bytes;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::codec::JsonCodec;
use crate::error::Result;
use crate::message::{EventKind, Metadata, OutboundMessage};
use crate::properties::PropertyStore;
use crate::signal::EventEmitter;
use crate::transmit::TransmitHandle;

/// Worker-wide handles shared by every handler invocation.
///
/// `Clone` and cheap to share across tasks.
#[derive(Clone)]
pub struct WorkerContext {
    transmitter: TransmitHandle,
    events: EventEmitter,
    properties: PropertyStore,
}

impl WorkerContext {
    pub fn new(transmitter: TransmitHandle, events: EventEmitter, properties: PropertyStore) -> Self {
        Self {
            transmitter,
            events,
            properties,
        }
    }

    /// Schedule an outbound message without waiting.
    #[inline]
    pub fn transmit(&self, message: OutboundMessage) -> Result<()> {
        self.transmitter.transmit(message)
    }

    /// Schedule an outbound message, waiting for queue space if needed.
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.transmitter.send(message).await
    }

    /// Queue an `Event` signal (fire-and-forget).
    pub fn emit(&self, kind: EventKind, message_id: &str, response_to: &str, data: Metadata) {
        self.events.emit(kind, message_id, response_to, data);
    }

    pub fn transmitter(&self) -> &TransmitHandle {
        &self.transmitter
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }
}

/// Context passed to the dispatch handler for one request.
#[derive(Clone)]
pub struct DispatchContext {
    address: String,
    message_id: String,
    worker: WorkerContext,
    token: CancellationToken,
}

impl DispatchContext {
    pub fn new(
        address: impl Into<String>,
        message_id: impl Into<String>,
        worker: WorkerContext,
        token: CancellationToken,
    ) -> Self {
        Self {
            address: address.into(),
            message_id: message_id.into(),
            worker,
            token,
        }
    }

    /// Address of the request being handled.
    #[inline]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Message id of the request being handled.
    #[inline]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Reply to the request.
    ///
    /// The reply carries a fresh message id, `response_to` set to the
    /// request id and the request's address. Returns the new message id.
    pub fn respond(&self, metadata: Metadata, data: impl Into<Bytes>) -> Result<String> {
        let message = self.reply(metadata, data.into());
        let id = message.message_id.clone();
        self.worker.transmit(message)?;
        Ok(id)
    }

    /// Reply with a JSON-encoded payload.
    pub fn respond_json<T: serde::Serialize>(&self, metadata: Metadata, value: &T) -> Result<String> {
        self.respond(metadata, JsonCodec::encode(value)?)
    }

    /// Like [`respond`](Self::respond) but waits for queue space.
    pub async fn respond_wait(&self, metadata: Metadata, data: impl Into<Bytes>) -> Result<String> {
        let message = self.reply(metadata, data.into());
        let id = message.message_id.clone();
        self.worker.send(message).await?;
        Ok(id)
    }

    /// Schedule an arbitrary outbound message.
    #[inline]
    pub fn transmit(&self, message: OutboundMessage) -> Result<()> {
        self.worker.transmit(message)
    }

    /// Queue an `Event` signal about this request.
    pub fn emit(&self, kind: EventKind, data: Metadata) {
        self.worker.emit(kind, &self.message_id, "", data);
    }

    /// Whether a Cancel naming this request has arrived.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a Cancel naming this request arrives.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Worker-wide handles.
    pub fn worker(&self) -> &WorkerContext {
        &self.worker
    }

    fn reply(&self, metadata: Metadata, data: Bytes) -> OutboundMessage {
        OutboundMessage::response(&self.address, &self.message_id, metadata, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::handler::HandlerSet;
    use crate::properties::WorkerProperties;
    use crate::signal::signal_channel;
    use crate::transmit::{transmit_channel, TransmitConfig, TransmitQueue};
    use std::sync::Arc;

    const IFACE: &str = "com.redhat.Yggdrasil1.Worker1";

    fn context(capacity: usize) -> (DispatchContext, TransmitQueue, CancellationToken) {
        let config = TransmitConfig {
            queue_capacity: capacity,
            ..TransmitConfig::default()
        };
        let (transmitter, queue) = transmit_channel(&config);
        let properties = PropertyStore::new(IFACE, WorkerProperties::default());
        let (events, _signals) = signal_channel(4, &properties, Arc::new(HandlerSet::new()));
        let worker = WorkerContext::new(transmitter, events, properties);
        let token = CancellationToken::new();
        (
            DispatchContext::new("addr", "m1", worker, token.clone()),
            queue,
            token,
        )
    }

    #[tokio::test]
    async fn test_respond_links_to_request() {
        let (ctx, mut queue, _token) = context(8);
        assert_eq!(ctx.address(), "addr");
        assert_eq!(ctx.message_id(), "m1");

        let id = ctx.respond(Metadata::new(), Bytes::from_static(b"hello")).unwrap();
        let sent = queue.try_next().unwrap();

        assert_eq!(sent.message_id, id);
        assert_eq!(sent.response_to, "m1");
        assert_eq!(sent.address, "addr");
        assert_eq!(sent.data, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_each_response_has_fresh_id() {
        let (ctx, mut queue, _token) = context(8);
        ctx.respond(Metadata::new(), Bytes::new()).unwrap();
        ctx.respond(Metadata::new(), Bytes::new()).unwrap();

        let a = queue.try_next().unwrap();
        let b = queue.try_next().unwrap();
        assert_ne!(a.message_id, b.message_id);
    }

    #[tokio::test]
    async fn test_respond_json() {
        let (ctx, mut queue, _token) = context(8);
        ctx.respond_json(Metadata::new(), &serde_json::json!({"ok": true}))
            .unwrap();

        let sent = queue.try_next().unwrap();
        assert_eq!(&sent.data[..], br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_respond_reports_backpressure() {
        let (ctx, _queue, _token) = context(1);
        ctx.respond(Metadata::new(), Bytes::new()).unwrap();
        let result = ctx.respond(Metadata::new(), Bytes::new());
        assert!(matches!(result, Err(WorkerError::Backpressure)));
    }

    #[tokio::test]
    async fn test_cancellation_visible() {
        let (ctx, _queue, token) = context(8);
        assert!(!ctx.is_cancelled());

        token.cancel();
        assert!(ctx.is_cancelled());
        ctx.cancelled().await;
    }
}
