//! In-memory transport connection recording every frame written to it.
//!
//! # Example
//!
//! ```rust,ignore
//! use roomcast_test_utils::MockConnection;
//!
//! let conn = MockConnection::new();
//! let client = server.accept(conn.as_connection()).await;
//! client.connect("/", json!({})).await.unwrap();
//!
//! assert_eq!(conn.packets_of(PacketKind::Connect).len(), 1);
//! ```

use roomcast::errors::TransportError;
use roomcast::packet::{Frame, Packet, PacketKind, WriteOptions};
use roomcast::transport::{Connection, ReadyState, CURRENT_PROTOCOL, LEGACY_PROTOCOL};
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Mock transport connection.
///
/// Clones share state, so a test keeps one clone to inspect what the server
/// wrote while the server holds another.
#[derive(Debug, Clone)]
pub struct MockConnection {
    inner: Arc<MockConnectionInner>,
}

#[derive(Debug)]
struct MockConnectionInner {
    id: String,
    protocol: u8,
    state: Mutex<ReadyState>,
    writable: Mutex<bool>,
    fail_writes: Mutex<bool>,
    frames: Mutex<Vec<(Frame, WriteOptions)>>,
    close_calls: Mutex<usize>,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnection {
    /// Open connection speaking the current protocol, with a random id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_protocol(CURRENT_PROTOCOL)
    }

    /// Open connection speaking the legacy protocol.
    #[must_use]
    pub fn legacy() -> Self {
        Self::with_protocol(LEGACY_PROTOCOL)
    }

    #[must_use]
    pub fn with_protocol(protocol: u8) -> Self {
        Self {
            inner: Arc::new(MockConnectionInner {
                id: format!("conn-{}", uuid::Uuid::new_v4().simple()),
                protocol,
                state: Mutex::new(ReadyState::Open),
                writable: Mutex::new(true),
                fail_writes: Mutex::new(false),
                frames: Mutex::new(Vec::new()),
                close_calls: Mutex::new(0),
            }),
        }
    }

    /// Handle to pass to `Server::accept`.
    pub fn as_connection(&self) -> Arc<dyn Connection> {
        Arc::new(self.clone())
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        *self.inner.state.lock().unwrap() = state;
    }

    /// Simulate a transport that is open but cannot flush right now.
    pub fn set_writable(&self, writable: bool) {
        *self.inner.writable.lock().unwrap() = writable;
    }

    /// Make every subsequent write fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        *self.inner.fail_writes.lock().unwrap() = fail;
    }

    /// Every frame written so far, in order.
    pub fn frames(&self) -> Vec<Frame> {
        self.inner
            .frames
            .lock()
            .unwrap()
            .iter()
            .map(|(frame, _)| frame.clone())
            .collect()
    }

    /// Write options of every frame written so far.
    pub fn write_options(&self) -> Vec<WriteOptions> {
        self.inner
            .frames
            .lock()
            .unwrap()
            .iter()
            .map(|(_, opts)| *opts)
            .collect()
    }

    /// Every frame decoded back into a packet (JSON encoder only).
    pub fn packets(&self) -> Vec<Packet> {
        self.frames()
            .into_iter()
            .map(|frame| match frame {
                Frame::Text(bytes) | Frame::Binary(bytes) => {
                    serde_json::from_slice(&bytes).expect("frame is not a JSON packet")
                }
            })
            .collect()
    }

    pub fn packets_of(&self, kind: PacketKind) -> Vec<Packet> {
        self.packets().into_iter().filter(|p| p.kind == kind).collect()
    }

    /// Arguments of every `event` packet received, in order.
    pub fn events(&self, event: &str) -> Vec<Vec<Value>> {
        self.packets()
            .into_iter()
            .filter(|p| p.event_name() == Some(event))
            .map(|p| p.event_args().to_vec())
            .collect()
    }

    /// Forget recorded frames.
    pub fn clear(&self) {
        self.inner.frames.lock().unwrap().clear();
    }

    pub fn close_calls(&self) -> usize {
        *self.inner.close_calls.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.state.lock().unwrap() == ReadyState::Closed
    }
}

impl Connection for MockConnection {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn protocol(&self) -> u8 {
        self.inner.protocol
    }

    fn ready_state(&self) -> ReadyState {
        *self.inner.state.lock().unwrap()
    }

    fn is_writable(&self) -> bool {
        self.ready_state() == ReadyState::Open && *self.inner.writable.lock().unwrap()
    }

    fn send(&self, frames: Vec<Frame>, opts: &WriteOptions) -> Result<(), TransportError> {
        if *self.inner.fail_writes.lock().unwrap() {
            return Err(TransportError::Io("mock write failure".to_string()));
        }
        if self.ready_state() == ReadyState::Closed {
            return Err(TransportError::Closed);
        }
        self.inner
            .frames
            .lock()
            .unwrap()
            .extend(frames.into_iter().map(|frame| (frame, *opts)));
        Ok(())
    }

    fn close(&self) {
        *self.inner.close_calls.lock().unwrap() += 1;
        *self.inner.state.lock().unwrap() = ReadyState::Closed;
    }
}
