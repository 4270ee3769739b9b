//! Messages exchanged between the worker and the dispatcher.
//!
//! - [`DispatchRequest`] - inbound work item (`Dispatch`)
//! - [`CancelRequest`] - inbound cancellation notice (`Cancel`)
//! - [`OutboundMessage`] - outbound response (`Transmit` on the dispatcher)
//! - [`TransmitResult`] - what the dispatcher answered to a transmit
//! - [`WorkerEvent`] / [`EventKind`] - out-of-band `Event` signal

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::codec::JsonCodec;
use crate::error::{Result, WorkerError};

/// Metadata attached to messages (`a{ss}` on the wire).
pub type Metadata = HashMap<String, String>;

/// Generate a fresh, globally unique message id.
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A unit of work delivered by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    /// Destination hint.
    pub address: String,
    pub message_id: String,
    /// Id of the message this one answers, empty if none.
    pub response_to: String,
    pub metadata: Metadata,
    pub data: Bytes,
}

impl DispatchRequest {
    pub fn new(
        address: impl Into<String>,
        message_id: impl Into<String>,
        response_to: impl Into<String>,
        metadata: Metadata,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            address: address.into(),
            message_id: message_id.into(),
            response_to: response_to.into(),
            metadata,
            data: data.into(),
        }
    }

    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        JsonCodec::decode(&self.data)
    }

    /// Build a response addressed back to the sender of this request.
    ///
    /// The response gets a fresh message id and points at this request
    /// through `response_to`.
    pub fn reply(&self, metadata: Metadata, data: impl Into<Bytes>) -> OutboundMessage {
        OutboundMessage::response(&self.address, &self.message_id, metadata, data)
    }
}

/// A cancellation notice for a previously dispatched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    /// Class of the operation being cancelled.
    pub directive: String,
    /// Id of the cancel notice itself.
    pub message_id: String,
    /// Id of the message to cancel.
    pub cancel_id: String,
}

impl CancelRequest {
    pub fn new(
        directive: impl Into<String>,
        message_id: impl Into<String>,
        cancel_id: impl Into<String>,
    ) -> Self {
        Self {
            directive: directive.into(),
            message_id: message_id.into(),
            cancel_id: cancel_id.into(),
        }
    }
}

/// A message sent to the dispatcher through its `Transmit` method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub address: String,
    pub message_id: String,
    pub response_to: String,
    pub metadata: Metadata,
    pub data: Bytes,
}

impl OutboundMessage {
    pub fn new(
        address: impl Into<String>,
        message_id: impl Into<String>,
        response_to: impl Into<String>,
        metadata: Metadata,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            address: address.into(),
            message_id: message_id.into(),
            response_to: response_to.into(),
            metadata,
            data: data.into(),
        }
    }

    /// A response to `response_to` under a fresh message id.
    pub fn response(
        address: impl Into<String>,
        response_to: impl Into<String>,
        metadata: Metadata,
        data: impl Into<Bytes>,
    ) -> Self {
        Self::new(address, new_message_id(), response_to, metadata, data)
    }
}

/// Answer of the dispatcher to a `Transmit` call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransmitResult {
    pub code: i32,
    pub metadata: Metadata,
    pub data: Bytes,
}

/// Kinds of out-of-band worker events understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventKind {
    /// Worker started handling a message.
    Begin = 1,
    /// Worker finished handling a message.
    End = 2,
    /// Worker is still busy with a message.
    Working = 3,
    /// Worker process started.
    Started = 4,
    /// Worker process is stopping.
    Stopped = 5,
}

impl EventKind {
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Map an `Event` signal code back to its kind, for code observing signals.
impl TryFrom<u32> for EventKind {
    type Error = WorkerError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            1 => Ok(EventKind::Begin),
            2 => Ok(EventKind::End),
            3 => Ok(EventKind::Working),
            4 => Ok(EventKind::Started),
            5 => Ok(EventKind::Stopped),
            other => Err(WorkerError::UnknownEvent(other)),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Begin => "begin",
            EventKind::End => "end",
            EventKind::Working => "working",
            EventKind::Started => "started",
            EventKind::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Payload of the `Event` signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEvent {
    pub kind: EventKind,
    pub message_id: String,
    pub response_to: String,
    pub data: Metadata,
}

impl WorkerEvent {
    pub fn new(
        kind: EventKind,
        message_id: impl Into<String>,
        response_to: impl Into<String>,
        data: Metadata,
    ) -> Self {
        Self {
            kind,
            message_id: message_id.into(),
            response_to: response_to.into(),
            data,
        }
    }
}
