//! Transport boundary.
//!
//! The persistent-connection engine (handshake, upgrades, heartbeats, byte
//! I/O) lives outside this crate. It hands each accepted connection to
//! [`crate::Server::accept`] as an `Arc<dyn Connection>`, feeds decoded
//! packets to the returned [`crate::Client`] and reports the close reason
//! through [`crate::Client::on_close`].

use crate::errors::TransportError;
use crate::packet::{Frame, WriteOptions};

/// Protocol revision spoken by the legacy client generation.
pub const LEGACY_PROTOCOL: u8 = 3;

/// Protocol revision spoken by current clients.
pub const CURRENT_PROTOCOL: u8 = 4;

/// Readiness of an underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// One persistent client connection as seen by the core.
pub trait Connection: Send + Sync {
    /// Transport-level session identifier.
    fn id(&self) -> &str;

    /// Protocol revision negotiated during the handshake.
    fn protocol(&self) -> u8;

    fn ready_state(&self) -> ReadyState;

    /// Whether a write would be flushed right away rather than buffered.
    fn is_writable(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Queue frames for delivery. Must not block.
    fn send(&self, frames: Vec<Frame>, opts: &WriteOptions) -> Result<(), TransportError>;

    /// Close the connection. The transport reports the outcome through
    /// `Client::on_close`.
    fn close(&self);

    fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }
}
