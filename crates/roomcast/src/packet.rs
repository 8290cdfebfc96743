//! Logical packet model and the encoder boundary.
//!
//! Framing on the wire belongs to an external codec. The core only builds
//! [`Packet`] values and hands them to a [`PacketEncoder`], which turns them
//! into opaque [`Frame`]s for the transport.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SocketError;

/// Packet types understood by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketKind {
    Connect,
    Disconnect,
    Event,
    Ack,
    ConnectError,
    BinaryEvent,
    BinaryAck,
}

/// A decoded packet addressed to one namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub kind: PacketKind,
    pub nsp: String,
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl Packet {
    /// An `EVENT` packet: `[event, ...args]`.
    pub fn event(nsp: impl Into<String>, event: &str, args: Vec<Value>) -> Self {
        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(Value::String(event.to_string()));
        data.extend(args);
        Self {
            kind: PacketKind::Event,
            nsp: nsp.into(),
            data,
            id: None,
        }
    }

    /// An `ACK` packet answering the request `id`.
    pub fn ack(nsp: impl Into<String>, id: u64, args: Vec<Value>) -> Self {
        Self {
            kind: PacketKind::Ack,
            nsp: nsp.into(),
            data: args,
            id: Some(id),
        }
    }

    pub fn connect(nsp: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            kind: PacketKind::Connect,
            nsp: nsp.into(),
            data: payload.into_iter().collect(),
            id: None,
        }
    }

    pub fn connect_error(nsp: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: PacketKind::ConnectError,
            nsp: nsp.into(),
            data: vec![payload],
            id: None,
        }
    }

    pub fn disconnect(nsp: impl Into<String>) -> Self {
        Self {
            kind: PacketKind::Disconnect,
            nsp: nsp.into(),
            data: Vec::new(),
            id: None,
        }
    }

    /// Whether this is an event (text or binary).
    pub fn is_event(&self) -> bool {
        matches!(self.kind, PacketKind::Event | PacketKind::BinaryEvent)
    }

    /// Event name for `EVENT` packets.
    pub fn event_name(&self) -> Option<&str> {
        if !self.is_event() {
            return None;
        }
        self.data.first().and_then(Value::as_str)
    }

    /// Arguments following the event name.
    pub fn event_args(&self) -> &[Value] {
        self.data.get(1..).unwrap_or(&[])
    }
}

/// An encoded unit handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Bytes),
    Binary(Bytes),
}

/// Per-write options passed down to the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    pub compress: bool,
    /// Drop the write instead of buffering it when the transport is not writable.
    pub volatile: bool,
    /// The payload carries binary attachments; transports may pick binary framing.
    #[serde(default)]
    pub binary: bool,
}

/// Encoder boundary: packet in, frames out.
pub trait PacketEncoder: Send + Sync {
    fn encode(&self, packet: &Packet) -> Result<Vec<Frame>, SocketError>;
}

/// Encodes each packet as a single JSON text frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEncoder;

impl PacketEncoder for JsonEncoder {
    fn encode(&self, packet: &Packet) -> Result<Vec<Frame>, SocketError> {
        let bytes =
            serde_json::to_vec(packet).map_err(|e| SocketError::Encoding(e.to_string()))?;
        Ok(vec![Frame::Text(Bytes::from(bytes))])
    }
}
