//! Server-side socket: one client's presence in one namespace.
//!
//! # Lifecycle
//!
//! ```text
//! Pending -> MiddlewareRunning -> Connected -> Disconnected
//!                              \-> Rejected
//! ```
//!
//! A socket is created by [`Namespace`] for every namespace `CONNECT`. It only
//! becomes reachable through the room registry once it is `Connected`.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, info};

use crate::adapter::ack::{AckCollector, AckOutcome};
use crate::adapter::types::{Handshake, PrivateSessionId, Room, SessionToPersist, SocketId};
use crate::client::Client;
use crate::errors::{AckError, SocketError};
use crate::namespace::Namespace;
use crate::observability::metrics;
use crate::operator::BroadcastOperator;
use crate::packet::{Frame, Packet, PacketKind, WriteOptions};
use crate::transport::{Connection, LEGACY_PROTOCOL};

/// Event names a socket may not emit: they belong to the connection lifecycle.
pub const RESERVED_EVENTS: [&str; 6] = [
    "connect",
    "connect_error",
    "disconnect",
    "disconnecting",
    "newListener",
    "removeListener",
];

pub(crate) fn check_reserved(event: &str) -> Result<(), SocketError> {
    if RESERVED_EVENTS.contains(&event) {
        return Err(SocketError::ReservedEvent(event.to_string()));
    }
    Ok(())
}

/// Why a socket left its namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server called `disconnect()`.
    ServerNamespaceDisconnect,
    /// The client sent a namespace `DISCONNECT`.
    ClientNamespaceDisconnect,
    TransportClose,
    TransportError,
    ServerShuttingDown,
    ParseError,
    PingTimeout,
    ForcedClose,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ServerNamespaceDisconnect => "server namespace disconnect",
            DisconnectReason::ClientNamespaceDisconnect => "client namespace disconnect",
            DisconnectReason::TransportClose => "transport close",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::ServerShuttingDown => "server shutting down",
            DisconnectReason::ParseError => "parse error",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::ForcedClose => "forced close",
        }
    }

    /// Explicit namespace disconnects never leave a recoverable session.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            DisconnectReason::ServerNamespaceDisconnect
                | DisconnectReason::ClientNamespaceDisconnect
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Pending,
    MiddlewareRunning,
    Connected,
    Rejected,
    Disconnected,
}

/// Receives the acknowledgement (or its failure) for one emitted packet.
pub(crate) type AckSink = Box<dyn FnOnce(Result<Vec<Value>, AckError>) + Send>;

type EventHandler =
    Arc<dyn Fn(Arc<Socket>, Vec<Value>, Option<AckSender>) -> BoxFuture<'static, ()> + Send + Sync>;

type DisconnectHandler =
    Arc<dyn Fn(Arc<Socket>, DisconnectReason) -> BoxFuture<'static, ()> + Send + Sync>;

/// Replies to a client event that requested an acknowledgement.
pub struct AckSender {
    socket: Weak<Socket>,
    id: u64,
}

impl fmt::Debug for AckSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckSender").field("id", &self.id).finish()
    }
}

impl AckSender {
    pub fn send(self, args: Vec<Value>) -> Result<(), SocketError> {
        let socket = self.socket.upgrade().ok_or(SocketError::NotConnected)?;
        let packet = Packet::ack(socket.nsp.name(), self.id, args);
        socket.write_packet(&packet, &WriteOptions::default())
    }
}

/// State recovered from a previous session, applied on connect.
#[derive(Debug, Default)]
pub(crate) struct Restored {
    pub rooms: HashSet<Room>,
    pub missed_packets: Vec<Vec<Value>>,
}

pub(crate) struct SocketInit {
    pub id: SocketId,
    pub pid: Option<PrivateSessionId>,
    pub nsp: Arc<Namespace>,
    pub client: Weak<Client>,
    pub conn: Arc<dyn Connection>,
    pub auth: Value,
    pub data: Value,
    pub restored: Option<Restored>,
}

pub struct Socket {
    id: SocketId,
    pid: Option<PrivateSessionId>,
    nsp: Arc<Namespace>,
    client: Weak<Client>,
    conn: Arc<dyn Connection>,
    handshake: Handshake,
    data: RwLock<Value>,
    recovered: bool,
    state: Mutex<ConnectionState>,
    acks: Mutex<HashMap<u64, AckSink>>,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    disconnect_handlers: RwLock<Vec<DisconnectHandler>>,
    restored: Mutex<Option<Restored>>,
    me: Weak<Socket>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("nsp", &self.nsp.name())
            .field("recovered", &self.recovered)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Socket {
    pub(crate) fn new(init: SocketInit) -> Arc<Self> {
        let handshake = Handshake {
            auth: init.auth,
            issued_at: chrono::Utc::now(),
            connection_id: init.conn.id().to_string(),
        };
        Arc::new_cyclic(|me| Self {
            id: init.id,
            pid: init.pid,
            nsp: init.nsp,
            client: init.client,
            conn: init.conn,
            handshake,
            data: RwLock::new(init.data),
            recovered: init.restored.is_some(),
            state: Mutex::new(ConnectionState::Pending),
            acks: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            disconnect_handlers: RwLock::new(Vec::new()),
            restored: Mutex::new(init.restored),
            me: me.clone(),
        })
    }

    pub fn id(&self) -> &SocketId {
        &self.id
    }

    /// Private session id, present when connection-state recovery is enabled.
    pub fn pid(&self) -> Option<&PrivateSessionId> {
        self.pid.as_ref()
    }

    pub fn nsp(&self) -> &Arc<Namespace> {
        &self.nsp
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Application data attached to this socket.
    pub fn data(&self) -> Value {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_data(&self, data: Value) {
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = data;
    }

    /// Whether this socket resumed a previous session.
    pub fn recovered(&self) -> bool {
        self.recovered
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Rooms this socket is in, its own id room included.
    pub fn rooms(&self) -> HashSet<Room> {
        self.nsp.adapter().socket_rooms(&self.id).unwrap_or_default()
    }

    pub fn join<I, R>(&self, rooms: I)
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        let rooms: Vec<Room> = rooms.into_iter().map(Into::into).collect();
        debug!(target: "roomcast.socket", socket_id = %self.id, rooms = rooms.len(), "Joining rooms");
        self.nsp.adapter().add_all(&self.id, rooms);
    }

    pub fn leave(&self, room: impl Into<Room>) {
        self.nsp.adapter().del(&self.id, &room.into());
    }

    /// Emit an event to this client.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), SocketError> {
        check_reserved(event)?;
        let packet = Packet::event(self.nsp.name(), event, args);
        self.write_packet(&packet, &WriteOptions::default())
    }

    /// Emit dropping the packet if the transport is not ready to write.
    pub fn emit_volatile(&self, event: &str, args: Vec<Value>) -> Result<(), SocketError> {
        check_reserved(event)?;
        let packet = Packet::event(self.nsp.name(), event, args);
        self.write_packet(
            &packet,
            &WriteOptions {
                volatile: true,
                ..Default::default()
            },
        )
    }

    /// Emits a `message` event.
    pub fn send(&self, args: Vec<Value>) -> Result<(), SocketError> {
        self.emit("message", args)
    }

    /// Emit an event and wait for the client's acknowledgement.
    pub async fn emit_with_ack(
        &self,
        event: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>, SocketError> {
        check_reserved(event)?;

        let (collector, handle) = AckCollector::channel(true);
        if let Some(timeout) = timeout {
            collector.arm_timeout(timeout);
        }
        collector.set_expected_servers(1);

        let ack_id = self.nsp.next_id();
        let sink = collector.clone();
        let source = self.id.to_string();
        self.register_ack(ack_id, Box::new(move |result| sink.push(source, result)));

        let mut packet = Packet::event(self.nsp.name(), event, args);
        packet.id = Some(ack_id);
        if let Err(e) = self.write_packet(&packet, &WriteOptions::default()) {
            self.cancel_ack(ack_id);
            return Err(e);
        }
        collector.report_expected(1);
        drop(collector);

        let outcome = handle.await;
        self.cancel_ack(ack_id);
        match outcome {
            AckOutcome::Completed(mut responses) => match responses.pop() {
                Some(response) => response.result.map_err(SocketError::from),
                None => Err(AckError::Timeout.into()),
            },
            AckOutcome::TimedOut(_) => Err(AckError::Timeout.into()),
        }
    }

    /// Broadcast to `rooms`, excluding this socket.
    pub fn to<I, R>(&self, rooms: I) -> BroadcastOperator
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.broadcast().to(rooms)
    }

    pub fn in_<I, R>(&self, rooms: I) -> BroadcastOperator
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.to(rooms)
    }

    pub fn except<I, R>(&self, rooms: I) -> BroadcastOperator
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.broadcast().except(rooms)
    }

    /// Broadcast to every socket of the namespace but this one.
    pub fn broadcast(&self) -> BroadcastOperator {
        BroadcastOperator::new(self.nsp.clone()).except([&self.id])
    }

    /// Register a handler for a client event.
    ///
    /// Handlers run on their own task; only the first handler of an event
    /// receives the [`AckSender`] when the client asked for an ack.
    pub fn on<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(Arc<Socket>, Vec<Value>, Option<AckSender>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: EventHandler =
            Arc::new(move |socket, args, ack| handler(socket, args, ack).boxed());
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    pub fn on_disconnect<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Socket>, DisconnectReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: DisconnectHandler =
            Arc::new(move |socket, reason| handler(socket, reason).boxed());
        self.disconnect_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Leave the namespace.
    ///
    /// With `close`, every namespace of the underlying client is left and
    /// the transport connection is closed.
    pub async fn disconnect(&self, close: bool) {
        if !self.connected() {
            return;
        }
        if close {
            if let Some(client) = self.client.upgrade() {
                client.disconnect().await;
                return;
            }
        }
        self.disconnect_now().await;
    }

    /// Send `DISCONNECT` and run the close sequence.
    pub(crate) async fn disconnect_now(&self) {
        if !self.connected() {
            return;
        }
        let _ = self.write_packet(&Packet::disconnect(self.nsp.name()), &WriteOptions::default());
        self.on_close(DisconnectReason::ServerNamespaceDisconnect).await;
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.lock_state() = state;
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_acks(&self) -> MutexGuard<'_, HashMap<u64, AckSink>> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn conn(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub(crate) fn register_ack(&self, id: u64, sink: AckSink) {
        self.lock_acks().insert(id, sink);
    }

    pub(crate) fn cancel_ack(&self, id: u64) {
        self.lock_acks().remove(&id);
    }

    pub(crate) fn write_packet(&self, packet: &Packet, opts: &WriteOptions) -> Result<(), SocketError> {
        let frames = self.nsp.encoder().encode(packet)?;
        self.write_frames(frames, opts)
    }

    pub(crate) fn write_frames(&self, frames: Vec<Frame>, opts: &WriteOptions) -> Result<(), SocketError> {
        if opts.volatile && !self.conn.is_writable() {
            debug!(target: "roomcast.socket", socket_id = %self.id, "Volatile packet discarded");
            return Ok(());
        }
        self.conn.send(frames, opts).map_err(SocketError::from)
    }

    /// Join rooms, mark connected, confirm the connection and replay missed packets.
    ///
    /// Runs before the socket is handed to any connection listener.
    pub(crate) fn on_connect(&self) {
        let restored = self
            .restored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut rooms = vec![Room::from(&self.id)];
        if let Some(restored) = &restored {
            rooms.extend(restored.rooms.iter().cloned());
        }
        self.nsp.adapter().add_all(&self.id, rooms);
        self.set_state(ConnectionState::Connected);

        let payload = if self.conn.protocol() == LEGACY_PROTOCOL {
            None
        } else {
            let mut payload = json!({ "sid": self.id });
            if let (Some(pid), Some(obj)) = (&self.pid, payload.as_object_mut()) {
                obj.insert("pid".to_string(), json!(pid));
            }
            Some(payload)
        };
        let _ = self.write_packet(&Packet::connect(self.nsp.name(), payload), &WriteOptions::default());

        if let Some(restored) = restored {
            for data in restored.missed_packets {
                let packet = Packet {
                    kind: PacketKind::Event,
                    nsp: self.nsp.name().to_string(),
                    data,
                    id: None,
                };
                let _ = self.write_packet(&packet, &WriteOptions::default());
            }
        }
    }

    /// Handle a packet the client sent to this namespace.
    pub(crate) async fn on_packet(&self, packet: Packet) {
        if !self.connected() {
            debug!(target: "roomcast.socket", socket_id = %self.id, "Packet for disconnected socket ignored");
            return;
        }
        match packet.kind {
            PacketKind::Event | PacketKind::BinaryEvent => self.dispatch_event(packet),
            PacketKind::Ack | PacketKind::BinaryAck => {
                let sink = packet.id.and_then(|id| self.lock_acks().remove(&id));
                match sink {
                    Some(sink) => sink(Ok(packet.data)),
                    None => debug!(
                        target: "roomcast.socket",
                        socket_id = %self.id,
                        ack_id = ?packet.id,
                        "Unknown acknowledgement ignored"
                    ),
                }
            }
            PacketKind::Disconnect => self.on_close(DisconnectReason::ClientNamespaceDisconnect).await,
            PacketKind::Connect | PacketKind::ConnectError => {}
        }
    }

    fn dispatch_event(&self, packet: Packet) {
        let Some(event) = packet.event_name().map(str::to_string) else {
            debug!(target: "roomcast.socket", socket_id = %self.id, "Event packet without a name ignored");
            return;
        };
        let Some(me) = self.me.upgrade() else {
            return;
        };

        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .cloned()
            .unwrap_or_default();

        let args = packet.event_args().to_vec();
        let mut ack = packet.id.map(|id| AckSender {
            socket: self.me.clone(),
            id,
        });
        for handler in handlers {
            tokio::spawn(handler(me.clone(), args.clone(), ack.take()));
        }
    }

    /// Close sequence: leave every room, persist when recoverable, unregister,
    /// fail pending acks, then notify disconnect listeners.
    pub(crate) async fn on_close(&self, reason: DisconnectReason) {
        {
            let mut state = self.lock_state();
            if *state != ConnectionState::Connected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }

        // Leave rooms before persisting: a broadcast racing the close must be
        // buffered or delivered, never both.
        let adapter = self.nsp.adapter();
        let rooms = adapter.socket_rooms(&self.id).unwrap_or_default();
        adapter.del_all(&self.id);

        if reason.is_recoverable() && self.nsp.recovery().is_some() {
            if let Some(pid) = &self.pid {
                adapter
                    .persist_session(SessionToPersist {
                        sid: self.id.clone(),
                        pid: pid.clone(),
                        rooms,
                        data: self.data(),
                    })
                    .await;
            }
        }

        self.nsp.remove(&self.id).await;
        if let Some(client) = self.client.upgrade() {
            client.remove(self.nsp.name());
        }

        let pending: Vec<AckSink> = self.lock_acks().drain().map(|(_, sink)| sink).collect();
        for sink in pending {
            sink(Err(AckError::Disconnected));
        }

        metrics::record_socket_disconnected(self.nsp.metrics_label(), reason.as_str());
        info!(
            target: "roomcast.socket",
            socket_id = %self.id,
            nsp = %self.nsp.name(),
            reason = %reason,
            "Socket disconnected"
        );

        let handlers = self
            .disconnect_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(me) = self.me.upgrade() {
            for handler in handlers {
                handler(me.clone(), reason).await;
            }
        }
    }
}
