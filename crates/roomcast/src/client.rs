//! One client per transport connection.
//!
//! A client multiplexes namespaces over its connection: it routes namespace
//! `CONNECT` packets to the server registry, forwards every other packet to
//! the socket of the packet's namespace and tears all sockets down when the
//! transport closes.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::errors::SocketError;
use crate::packet::{Packet, PacketKind, WriteOptions};
use crate::server::ServerInner;
use crate::socket::{DisconnectReason, Socket};
use crate::transport::Connection;

pub struct Client {
    conn: Arc<dyn Connection>,
    server: Weak<ServerInner>,
    sockets: Mutex<HashMap<String, Arc<Socket>>>,
    connect_timer: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id())
            .field("namespaces", &self.lock_sockets().len())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub(crate) fn new(conn: Arc<dyn Connection>, server: Weak<ServerInner>) -> Arc<Self> {
        Arc::new(Self {
            conn,
            server,
            sockets: Mutex::new(HashMap::new()),
            connect_timer: Mutex::new(None),
        })
    }

    /// Transport connection id.
    pub fn id(&self) -> &str {
        self.conn.id()
    }

    pub fn conn(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Socket of this client in namespace `nsp`, if connected there.
    pub fn socket(&self, nsp: &str) -> Option<Arc<Socket>> {
        self.lock_sockets().get(nsp).cloned()
    }

    fn lock_sockets(&self) -> MutexGuard<'_, HashMap<String, Arc<Socket>>> {
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close the connection if it has not joined any namespace after `timeout`.
    pub(crate) fn arm_connect_timeout(self: &Arc<Self>, timeout: Duration) {
        let client = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(client) = client.upgrade() else {
                return;
            };
            if client.lock_sockets().is_empty() {
                info!(
                    target: "roomcast.client",
                    connection_id = %client.id(),
                    "No namespace joined in time, closing connection"
                );
                client.close().await;
            }
        });

        if let Some(previous) = self
            .connect_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(timer)
        {
            previous.abort();
        }
    }

    fn cancel_connect_timeout(&self) {
        if let Some(timer) = self
            .connect_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
    }

    /// Join namespace `nsp`, creating it from a parent namespace if one matches.
    #[instrument(skip_all, fields(connection_id = %self.id(), nsp = %nsp))]
    pub async fn connect(self: &Arc<Self>, nsp: &str, auth: Value) -> Result<Arc<Socket>, SocketError> {
        if let Some(existing) = self.socket(nsp) {
            debug!(target: "roomcast.client", "Already connected to namespace");
            return Ok(existing);
        }

        let server = self.server.upgrade().ok_or(SocketError::NotConnected)?;
        let Some(namespace) = server.resolve_namespace(nsp, &auth).await else {
            debug!(target: "roomcast.client", "Connection to unknown namespace refused");
            let err = SocketError::InvalidNamespace(nsp.to_string());
            let payload = err.connect_error_payload(self.conn.protocol());
            let frames = server.encoder().encode(&Packet::connect_error(nsp, payload))?;
            let _ = self.conn.send(frames, &WriteOptions::default());
            return Err(err);
        };

        namespace.add(self, auth).await
    }

    /// Route a decoded packet from the transport.
    pub async fn handle_packet(self: &Arc<Self>, packet: Packet) {
        if packet.kind == PacketKind::Connect {
            let auth = packet.data.into_iter().next().unwrap_or(Value::Null);
            // Refusals were already reported to the client as CONNECT_ERROR.
            let _ = self.connect(&packet.nsp, auth).await;
            return;
        }

        match self.socket(&packet.nsp) {
            Some(socket) => socket.on_packet(packet).await,
            None => debug!(
                target: "roomcast.client",
                connection_id = %self.id(),
                nsp = %packet.nsp,
                "Packet for a namespace the client is not connected to"
            ),
        }
    }

    /// The transport closed: every socket of this client leaves its namespace.
    pub async fn on_close(&self, reason: DisconnectReason) {
        self.cancel_connect_timeout();
        let sockets: Vec<Arc<Socket>> = self.lock_sockets().drain().map(|(_, s)| s).collect();
        for socket in sockets {
            socket.on_close(reason).await;
        }
        if let Some(server) = self.server.upgrade() {
            server.forget_client(self.id());
        }
        debug!(target: "roomcast.client", connection_id = %self.id(), reason = %reason, "Client closed");
    }

    /// Leave every namespace with a `DISCONNECT`, then close the transport.
    pub async fn disconnect(&self) {
        let sockets: Vec<Arc<Socket>> = self.lock_sockets().values().cloned().collect();
        for socket in sockets {
            socket.disconnect_now().await;
        }
        self.close().await;
    }

    /// Close the transport without notifying namespaces first.
    pub async fn close(&self) {
        if self.conn.is_open() {
            self.conn.close();
        }
        self.on_close(DisconnectReason::ForcedClose).await;
    }

    pub(crate) fn register(&self, nsp: &str, socket: Arc<Socket>) {
        self.cancel_connect_timeout();
        self.lock_sockets().insert(nsp.to_string(), socket);
    }

    pub(crate) fn remove(&self, nsp: &str) {
        self.lock_sockets().remove(nsp);
    }
}
