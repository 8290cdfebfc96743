//! Ready-made servers, clients and auth payloads.

use roomcast::config::RecoveryConfig;
use roomcast::packet::{Packet, PacketKind};
use roomcast::{Client, Server, ServerOptions, Socket, SocketError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::mock_connection::MockConnection;

/// Recovery window used by [`recovering_server`].
pub const TEST_RECOVERY_WINDOW: Duration = Duration::from_secs(120);

/// Server with connection-state recovery and in-memory session stores.
pub fn recovering_server() -> Server {
    Server::new(ServerOptions::default().with_recovery(RecoveryConfig {
        max_disconnection_duration: TEST_RECOVERY_WINDOW,
        skip_middlewares: true,
    }))
}

/// Auth payload asking to resume session `pid` after packet `offset`.
pub fn recovery_auth(pid: &str, offset: &str) -> Value {
    json!({ "pid": pid, "offset": offset })
}

/// A mock connection accepted by a server.
#[derive(Debug, Clone)]
pub struct TestClient {
    pub conn: MockConnection,
    pub client: Arc<Client>,
}

impl TestClient {
    /// Accept a new current-protocol connection.
    pub async fn accept(server: &Server) -> Self {
        Self::accept_with(server, MockConnection::new()).await
    }

    pub async fn accept_with(server: &Server, conn: MockConnection) -> Self {
        let client = server.accept(conn.as_connection()).await;
        Self { conn, client }
    }

    /// Accept a connection and join `nsp` with an empty auth payload.
    pub async fn connected(server: &Server, nsp: &str) -> (Self, Arc<Socket>) {
        let test_client = Self::accept(server).await;
        let socket = test_client
            .connect(nsp, json!({}))
            .await
            .expect("namespace connection refused");
        (test_client, socket)
    }

    pub async fn connect(&self, nsp: &str, auth: Value) -> Result<Arc<Socket>, SocketError> {
        self.client.connect(nsp, auth).await
    }

    /// Payload of the last `CONNECT` acknowledgement for `nsp`.
    pub fn connect_payload(&self, nsp: &str) -> Option<Value> {
        self.conn
            .packets_of(PacketKind::Connect)
            .into_iter()
            .filter(|p| p.nsp == nsp)
            .last()
            .and_then(|p| p.data.into_iter().next())
    }

    /// Private session id announced by the server for `nsp`.
    pub fn pid(&self, nsp: &str) -> Option<String> {
        self.connect_payload(nsp)
            .and_then(|payload| payload.get("pid").and_then(Value::as_str).map(str::to_string))
    }

    /// Offset carried by the last event received, as a client would track it.
    pub fn last_offset(&self) -> Option<String> {
        self.conn
            .packets_of(PacketKind::Event)
            .into_iter()
            .filter_map(|p| p.data.last().and_then(Value::as_str).map(str::to_string))
            .last()
    }

    /// Client acknowledges event packet `packet`.
    pub async fn ack(&self, packet: &Packet, args: Vec<Value>) {
        let id = packet.id.expect("packet did not request an ack");
        self.client
            .handle_packet(Packet::ack(packet.nsp.clone(), id, args))
            .await;
    }

    /// Client sends an event to the server.
    pub async fn send_event(&self, nsp: &str, event: &str, args: Vec<Value>, ack_id: Option<u64>) {
        let mut packet = Packet::event(nsp, event, args);
        packet.id = ack_id;
        self.client.handle_packet(packet).await;
    }
}
