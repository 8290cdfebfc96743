//! Roomcast error types.
//!
//! Errors surfaced to clients go through [`SocketError::client_message`] so
//! that internal details (backend addresses, serialization failures) are
//! logged server-side but never written to a connection.

use serde_json::{json, Value};
use thiserror::Error;

use crate::transport::LEGACY_PROTOCOL;

/// Top-level error type for the messaging core.
#[derive(Debug, Error)]
pub enum SocketError {
    /// An application tried to emit a lifecycle-reserved event name.
    #[error("\"{0}\" is a reserved event name")]
    ReservedEvent(String),

    /// A connection was rejected by a namespace middleware.
    #[error("Middleware rejected connection: {0}")]
    Middleware(#[from] MiddlewareError),

    /// The client asked for a namespace that is not registered.
    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    /// Writing to the underlying transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session persistence backend failed.
    #[error("Session store error: {0}")]
    SessionStore(#[from] SessionStoreError),

    /// Cluster coordination failed.
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Acknowledgement failure.
    #[error("Acknowledgement error: {0}")]
    Ack(#[from] AckError),

    /// Operation attempted on a socket that is no longer connected.
    #[error("Socket is not connected")]
    NotConnected,

    /// Parent namespaces do not support this operation.
    #[error("{0} is not supported on parent namespaces")]
    UnsupportedOnParent(&'static str),

    /// Packet encoding failed.
    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl SocketError {
    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            SocketError::ReservedEvent(_) => self.to_string(),
            SocketError::Middleware(e) => e.message.clone(),
            SocketError::InvalidNamespace(_) => "Invalid namespace".to_string(),
            SocketError::NotConnected => "Not connected".to_string(),
            SocketError::Ack(AckError::Timeout) => "operation has timed out".to_string(),
            SocketError::Transport(_)
            | SocketError::SessionStore(_)
            | SocketError::Cluster(_)
            | SocketError::Ack(_)
            | SocketError::UnsupportedOnParent(_)
            | SocketError::Encoding(_) => "An internal error occurred".to_string(),
        }
    }

    /// Body of the `CONNECT_ERROR` packet reporting this error.
    ///
    /// Legacy clients get the middleware data, or the bare message. Current
    /// clients get `{"message", "data"?}`.
    pub fn connect_error_payload(&self, protocol: u8) -> Value {
        let data = match self {
            SocketError::Middleware(e) => e.data.clone(),
            _ => None,
        };
        let message = self.client_message();
        if protocol == LEGACY_PROTOCOL {
            return data.unwrap_or(Value::String(message));
        }
        let mut payload = json!({ "message": message });
        if let (Some(data), Some(obj)) = (data, payload.as_object_mut()) {
            obj.insert("data".to_string(), data);
        }
        payload
    }
}

/// Error produced by a namespace middleware.
///
/// Carries a message and optional structured data that is forwarded to the
/// client inside the `CONNECT_ERROR` packet.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct MiddlewareError {
    pub message: String,
    pub data: Option<Value>,
}

impl MiddlewareError {
    /// Create an error with a message only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data forwarded to the client.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Acknowledgement failures, recorded per recipient or for a whole request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AckError {
    /// Not every expected response arrived before the deadline.
    #[error("operation has timed out")]
    Timeout,

    /// The recipient disconnected before acknowledging.
    #[error("socket disconnected before acknowledging")]
    Disconnected,

    /// The packet could not be written to the recipient.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// A remote server reported an error for this slot.
    #[error("remote error: {0}")]
    Remote(String),
}

/// Errors reported by the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection is closed or closing.
    #[error("connection closed")]
    Closed,

    /// The write could not be queued.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Errors raised by session persistence backends.
#[derive(Debug, Error)]
pub enum SessionStoreError {
    /// Storage backend unavailable or command failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// Stored value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
