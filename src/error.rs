//! Error types for ygg-worker.

use std::fmt;

use thiserror::Error;

/// The worker-specific capabilities a handler may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Dispatch,
    Cancel,
    Event,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerKind::Dispatch => "dispatch",
            HandlerKind::Cancel => "cancel",
            HandlerKind::Event => "event",
        };
        f.write_str(name)
    }
}

/// Main error type for all worker operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The local message bus could not be reached.
    #[error("Bus unavailable: {0}")]
    BusUnavailable(String),

    /// The derived bus name is already owned by another connection.
    #[error("Bus name already taken: {0}")]
    NameTaken(String),

    /// This process already registered a worker under the same identity.
    #[error("Worker already registered: {0}")]
    AlreadyRegistered(String),

    /// Worker name or namespace is not a valid bus name element.
    #[error("Invalid worker identity: {0}")]
    InvalidIdentity(String),

    /// The worker does not provide the named handler.
    #[error("Handler not implemented: {0}")]
    UnimplementedHandler(HandlerKind),

    /// A worker-specific handler reported a failure.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// Outbound delivery to the dispatcher failed.
    #[error("Transmit failed: {0}")]
    TransmitFailure(String),

    /// Property name (or interface) outside the recognized schema.
    #[error("Unknown property: {0}")]
    UnknownProperty(String),

    /// Property value has the wrong type for the schema.
    #[error("Invalid value for property {name}: expected {expected}")]
    InvalidProperty {
        name: String,
        expected: &'static str,
    },

    /// `Event` signal code outside the known set, seen by a signal observer.
    #[error("Unknown event kind: {0}")]
    UnknownEvent(u32),

    /// Dispatch capacity reached.
    #[error("Worker busy: {0} dispatches in flight")]
    Busy(usize),

    /// Outbound queue full.
    #[error("Backpressure: outbound queue full")]
    Backpressure,

    /// Outbound channel closed (worker shutting down).
    #[error("Channel closed")]
    ChannelClosed,

    /// Configuration could not be loaded.
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (payload codec).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkerError {
    /// Build a handler failure from any displayable error.
    pub fn handler(err: impl fmt::Display) -> Self {
        WorkerError::Handler(err.to_string())
    }

    /// Errors that must end the process when hit during startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::BusUnavailable(_)
                | WorkerError::NameTaken(_)
                | WorkerError::AlreadyRegistered(_)
                | WorkerError::InvalidIdentity(_)
                | WorkerError::UnimplementedHandler(_)
                | WorkerError::Config(_)
        )
    }

    /// D-Bus error name used when this error is returned to a bus caller.
    pub fn bus_error_name(&self) -> &'static str {
        match self {
            WorkerError::UnimplementedHandler(_) => "org.freedesktop.DBus.Error.NotSupported",
            WorkerError::UnknownProperty(_) => "org.freedesktop.DBus.Error.UnknownProperty",
            WorkerError::InvalidProperty { .. } => "org.freedesktop.DBus.Error.InvalidArgs",
            WorkerError::UnknownEvent(_) => "org.freedesktop.DBus.Error.InvalidArgs",
            WorkerError::Busy(_) | WorkerError::Backpressure => {
                "org.freedesktop.DBus.Error.LimitsExceeded"
            }
            _ => "org.freedesktop.DBus.Error.Failed",
        }
    }
}

/// Result type alias using WorkerError.
pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(WorkerError::BusUnavailable("no socket".into()).is_fatal());
        assert!(WorkerError::NameTaken("x".into()).is_fatal());
        assert!(WorkerError::UnimplementedHandler(HandlerKind::Dispatch).is_fatal());
        assert!(!WorkerError::TransmitFailure("timeout".into()).is_fatal());
        assert!(!WorkerError::Handler("boom".into()).is_fatal());
    }

    #[test]
    fn test_unimplemented_message_names_handler() {
        let err = WorkerError::UnimplementedHandler(HandlerKind::Cancel);
        assert_eq!(err.to_string(), "Handler not implemented: cancel");
        assert_eq!(err.bus_error_name(), "org.freedesktop.DBus.Error.NotSupported");
    }

    #[test]
    fn test_invalid_property_message() {
        let err = WorkerError::InvalidProperty {
            name: "RemoteContent".into(),
            expected: "boolean",
        };
        assert_eq!(
            err.to_string(),
            "Invalid value for property RemoteContent: expected boolean"
        );
    }
}
