//! Namespaces: isolated channels multiplexed over client connections.
//!
//! A namespace owns its live sockets, an ordered middleware list and one
//! adapter. New connections go through [`Namespace::add`]:
//!
//! 1. try to restore a previous session from the `pid`/`offset` auth fields;
//! 2. run middleware one at a time, first error wins;
//! 3. on success, register the socket, join its rooms, send `CONNECT`,
//!    register it with its client and only then fire connection listeners.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::adapter::ack::{AckCollector, AckOutcome};
use crate::adapter::types::{PrivateSessionId, Room, SocketId};
use crate::adapter::{Adapter, AdapterBuilder, AdapterContext, SocketMap};
use crate::client::Client;
use crate::config::RecoveryConfig;
use crate::errors::{MiddlewareError, SocketError, TransportError};
use crate::observability::metrics;
use crate::operator::{BroadcastOperator, RemoteSocket};
use crate::packet::{Packet, PacketEncoder, WriteOptions};
use crate::parent::ParentNamespace;
use crate::socket::{ConnectionState, Restored, Socket, SocketInit};

/// Event names reserved for server-to-server messaging.
pub const RESERVED_SERVER_SIDE_EVENTS: [&str; 3] = ["connect", "connection", "new_namespace"];

pub(crate) type Middleware =
    Arc<dyn Fn(Arc<Socket>) -> BoxFuture<'static, Result<(), MiddlewareError>> + Send + Sync>;

pub(crate) type ConnectionHandler = Arc<dyn Fn(Arc<Socket>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Reply callback handed to a server-side event listener when the sender
/// expects an acknowledgement.
pub type ServerSideReply = Box<dyn FnOnce(Vec<Value>) + Send>;

type ServerSideHandler =
    Arc<dyn Fn(Vec<Value>, Option<ServerSideReply>) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) fn boxed_middleware<F, Fut>(f: F) -> Middleware
where
    F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), MiddlewareError>> + Send + 'static,
{
    Arc::new(move |socket| f(socket).boxed())
}

pub(crate) fn boxed_connection_handler<F, Fut>(f: F) -> ConnectionHandler
where
    F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |socket| f(socket).boxed())
}

pub(crate) struct NamespaceInit<'a> {
    pub name: String,
    pub builder: &'a dyn AdapterBuilder,
    pub encoder: Arc<dyn PacketEncoder>,
    pub recovery: Option<RecoveryConfig>,
    pub parent: Option<Weak<ParentNamespace>>,
}

pub struct Namespace {
    name: String,
    ids: Arc<AtomicU64>,
    sockets: SocketMap,
    adapter: RwLock<Arc<dyn Adapter>>,
    encoder: Arc<dyn PacketEncoder>,
    middlewares: RwLock<Vec<Middleware>>,
    connection_handlers: RwLock<Vec<ConnectionHandler>>,
    server_side_handlers: RwLock<HashMap<String, Vec<ServerSideHandler>>>,
    recovery: Option<RecoveryConfig>,
    parent: Option<Weak<ParentNamespace>>,
    /// `nsp` label for socket metrics; children report under their parent.
    metrics_label: String,
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("sockets", &self.socket_count())
            .finish_non_exhaustive()
    }
}

impl Namespace {
    pub(crate) fn new(init: NamespaceInit<'_>) -> Arc<Self> {
        let ids = Arc::new(AtomicU64::new(0));
        let sockets: SocketMap = Arc::new(RwLock::new(HashMap::new()));
        let adapter = init.builder.build(AdapterContext::new(
            init.name.clone(),
            sockets.clone(),
            init.encoder.clone(),
            ids.clone(),
        ));
        adapter.init();

        let metrics_label = init
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map_or_else(|| init.name.clone(), |parent| parent.name().to_string());

        Arc::new(Self {
            name: init.name,
            ids,
            sockets,
            adapter: RwLock::new(adapter),
            encoder: init.encoder,
            middlewares: RwLock::new(Vec::new()),
            connection_handlers: RwLock::new(Vec::new()),
            server_side_handlers: RwLock::new(HashMap::new()),
            recovery: init.recovery,
            parent: init.parent,
            metrics_label,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn metrics_label(&self) -> &str {
        &self.metrics_label
    }

    /// Next value of this namespace's monotonic counter.
    pub fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn adapter(&self) -> Arc<dyn Adapter> {
        self.adapter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn encoder(&self) -> &Arc<dyn PacketEncoder> {
        &self.encoder
    }

    pub fn recovery(&self) -> Option<RecoveryConfig> {
        self.recovery
    }

    /// Connected sockets of this server.
    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn socket(&self, id: &SocketId) -> Option<Arc<Socket>> {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn socket_count(&self) -> usize {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Register a middleware. Middleware run in registration order for every
    /// new socket; the first error rejects the connection.
    pub fn use_middleware<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MiddlewareError>> + Send + 'static,
    {
        self.middlewares
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(boxed_middleware(f));
    }

    /// Register a listener fired for every accepted socket.
    pub fn on_connection<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.connection_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(boxed_connection_handler(f));
    }

    /// Listen for an event sent by another server with `server_side_emit`.
    pub fn on_server_side_emit<F, Fut>(&self, event: &str, f: F)
    where
        F: Fn(Vec<Value>, Option<ServerSideReply>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: ServerSideHandler = Arc::new(move |args, reply| f(args, reply).boxed());
        self.server_side_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    /// Entry point for cluster bridges delivering a server-side event.
    ///
    /// Only the first listener receives `reply`.
    pub async fn on_server_side_emit_received(
        &self,
        event: &str,
        args: Vec<Value>,
        reply: Option<ServerSideReply>,
    ) {
        let handlers = self
            .server_side_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(target: "roomcast.namespace", nsp = %self.name, event, "No listener for server-side event");
            return;
        }

        let mut reply = reply;
        for handler in handlers {
            handler(args.clone(), reply.take()).await;
        }
    }

    pub(crate) fn inherit(&self, middlewares: Vec<Middleware>, handlers: Vec<ConnectionHandler>) {
        self.middlewares
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(middlewares);
        self.connection_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handlers);
    }

    // ------------------------------------------------------------------
    // Broadcast operator shortcuts
    // ------------------------------------------------------------------

    fn operator(self: &Arc<Self>) -> BroadcastOperator {
        BroadcastOperator::new(self.clone())
    }

    pub fn to<I, R>(self: &Arc<Self>, rooms: I) -> BroadcastOperator
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.operator().to(rooms)
    }

    pub fn in_<I, R>(self: &Arc<Self>, rooms: I) -> BroadcastOperator
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.operator().in_(rooms)
    }

    pub fn except<I, R>(self: &Arc<Self>, rooms: I) -> BroadcastOperator
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.operator().except(rooms)
    }

    pub fn local(self: &Arc<Self>) -> BroadcastOperator {
        self.operator().local()
    }

    pub fn volatile(self: &Arc<Self>) -> BroadcastOperator {
        self.operator().volatile()
    }

    pub fn compress(self: &Arc<Self>, compress: bool) -> BroadcastOperator {
        self.operator().compress(compress)
    }

    pub fn binary(self: &Arc<Self>, binary: bool) -> BroadcastOperator {
        self.operator().binary(binary)
    }

    pub fn timeout(self: &Arc<Self>, timeout: Duration) -> BroadcastOperator {
        self.operator().timeout(timeout)
    }

    /// Emit to every socket of the namespace.
    pub async fn emit(self: &Arc<Self>, event: &str, args: Vec<Value>) -> Result<(), SocketError> {
        self.operator().emit(event, args).await
    }

    /// Emits a `message` event to every socket.
    pub async fn send(self: &Arc<Self>, args: Vec<Value>) -> Result<(), SocketError> {
        self.emit("message", args).await
    }

    pub async fn fetch_sockets(self: &Arc<Self>) -> Result<Vec<RemoteSocket>, SocketError> {
        self.operator().fetch_sockets().await
    }

    pub async fn sockets_join<I, R>(self: &Arc<Self>, rooms: I) -> Result<(), SocketError>
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.operator().sockets_join(rooms).await
    }

    pub async fn sockets_leave<I, R>(self: &Arc<Self>, rooms: I) -> Result<(), SocketError>
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.operator().sockets_leave(rooms).await
    }

    pub async fn disconnect_sockets(self: &Arc<Self>, close: bool) -> Result<(), SocketError> {
        self.operator().disconnect_sockets(close).await
    }

    pub async fn all_sockets(self: &Arc<Self>) -> Result<HashSet<SocketId>, SocketError> {
        self.operator().all_sockets().await
    }

    // ------------------------------------------------------------------
    // Server-side messaging
    // ------------------------------------------------------------------

    /// Send an event to every other server of the cluster.
    pub async fn server_side_emit(&self, event: &str, args: Vec<Value>) -> Result<(), SocketError> {
        check_reserved_server_side(event)?;
        self.adapter().server_side_emit(event, args, None).await
    }

    /// Send an event to every other server and collect one reply per server.
    pub async fn server_side_emit_with_ack(
        &self,
        event: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<AckOutcome, SocketError> {
        check_reserved_server_side(event)?;
        let (collector, handle) = AckCollector::channel(false);
        if let Some(timeout) = timeout {
            collector.arm_timeout(timeout);
        }
        self.adapter()
            .server_side_emit(event, args, Some(collector))
            .await?;
        Ok(handle.await)
    }

    // ------------------------------------------------------------------
    // Connection pipeline
    // ------------------------------------------------------------------

    /// Admit a client into this namespace.
    #[instrument(skip_all, fields(nsp = %self.name, connection_id = %client.id()))]
    pub(crate) async fn add(
        self: &Arc<Self>,
        client: &Arc<Client>,
        auth: Value,
    ) -> Result<Arc<Socket>, SocketError> {
        let socket = self.create_socket(client, auth).await;
        let conn = socket.conn().clone();

        let skip_middlewares = socket.recovered()
            && self.recovery.is_some_and(|r| r.skip_middlewares)
            && conn.is_open();
        if skip_middlewares {
            debug!(target: "roomcast.namespace", socket_id = %socket.id(), "Recovered socket skips middleware");
            return Ok(self.do_connect(socket, client).await);
        }

        socket.set_state(ConnectionState::MiddlewareRunning);
        let verdict = self.run_middlewares(&socket).await;

        if !conn.is_open() {
            socket.set_state(ConnectionState::Disconnected);
            debug!(
                target: "roomcast.namespace",
                socket_id = %socket.id(),
                "Transport closed during middleware, dropping socket"
            );
            return Err(TransportError::Closed.into());
        }

        if let Err(err) = verdict {
            socket.set_state(ConnectionState::Rejected);
            metrics::record_connection("rejected");
            debug!(
                target: "roomcast.namespace",
                socket_id = %socket.id(),
                error = %err,
                "Connection rejected by middleware"
            );
            let err = SocketError::from(err);
            let _ = socket.write_packet(
                &Packet::connect_error(self.name.as_str(), err.connect_error_payload(conn.protocol())),
                &WriteOptions::default(),
            );
            return Err(err);
        }

        Ok(self.do_connect(socket, client).await)
    }

    /// Build the provisional socket, recovering a previous session when possible.
    async fn create_socket(self: &Arc<Self>, client: &Arc<Client>, auth: Value) -> Arc<Socket> {
        let base = SocketInit {
            id: SocketId::generate(),
            pid: None,
            nsp: self.clone(),
            client: Arc::downgrade(client),
            conn: client.conn().clone(),
            auth: Value::Null,
            data: Value::Null,
            restored: None,
        };

        if self.recovery.is_none() {
            return Socket::new(SocketInit { auth, ..base });
        }

        let pid = auth.get("pid").and_then(Value::as_str);
        let offset = auth.get("offset").and_then(Value::as_str);
        if let (Some(pid), Some(offset)) = (pid, offset) {
            let pid = PrivateSessionId::from(pid);
            match self.adapter().restore_session(&pid, offset).await {
                Ok(Some(session)) => {
                    info!(
                        target: "roomcast.namespace",
                        nsp = %self.name,
                        socket_id = %session.session.sid,
                        missed = session.missed_packets.len(),
                        "Connection state recovered"
                    );
                    return Socket::new(SocketInit {
                        id: session.session.sid,
                        pid: Some(session.session.pid),
                        data: session.session.data,
                        restored: Some(Restored {
                            rooms: session.session.rooms,
                            missed_packets: session.missed_packets,
                        }),
                        auth,
                        ..base
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        target: "roomcast.namespace",
                        nsp = %self.name,
                        error = %e,
                        "Session restore failed, connecting as new"
                    );
                }
            }
        }

        Socket::new(SocketInit {
            pid: Some(PrivateSessionId::generate()),
            auth,
            ..base
        })
    }

    async fn run_middlewares(&self, socket: &Arc<Socket>) -> Result<(), MiddlewareError> {
        let middlewares = self
            .middlewares
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for middleware in middlewares {
            middleware(socket.clone()).await?;
        }
        Ok(())
    }

    async fn do_connect(&self, socket: Arc<Socket>, client: &Arc<Client>) -> Arc<Socket> {
        self.sockets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(socket.id().clone(), socket.clone());

        socket.on_connect();
        client.register(&self.name, socket.clone());

        metrics::record_connection("accepted");
        metrics::record_socket_connected(&self.metrics_label);
        info!(
            target: "roomcast.namespace",
            nsp = %self.name,
            socket_id = %socket.id(),
            recovered = socket.recovered(),
            "Socket connected"
        );

        let handlers = self
            .connection_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(socket.clone()).await;
        }
        socket
    }

    /// Drop a socket from the live map; an emptied child namespace may be cleaned up.
    pub(crate) async fn remove(&self, id: &SocketId) {
        let now_empty = {
            let mut sockets = self.sockets.write().unwrap_or_else(PoisonError::into_inner);
            if sockets.remove(id).is_none() {
                debug!(target: "roomcast.namespace", nsp = %self.name, socket_id = %id, "Ignoring remove for unknown socket");
                return;
            }
            sockets.is_empty()
        };

        if now_empty {
            if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
                parent.on_child_empty(&self.name).await;
            }
        }
    }

    /// Swap in an adapter built by `builder`, carrying over room memberships.
    pub(crate) async fn init_adapter(&self, builder: &dyn AdapterBuilder) {
        let next = builder.build(AdapterContext::new(
            self.name.clone(),
            self.sockets.clone(),
            self.encoder.clone(),
            self.ids.clone(),
        ));
        next.init();

        let previous = {
            let mut adapter = self.adapter.write().unwrap_or_else(PoisonError::into_inner);
            for (id, rooms) in adapter.registry().snapshot() {
                next.add_all(&id, rooms.into_iter().collect());
            }
            std::mem::replace(&mut *adapter, next)
        };
        previous.close().await;
        debug!(target: "roomcast.namespace", nsp = %self.name, "Adapter replaced");
    }
}

fn check_reserved_server_side(event: &str) -> Result<(), SocketError> {
    if RESERVED_SERVER_SIDE_EVENTS.contains(&event) {
        return Err(SocketError::ReservedEvent(event.to_string()));
    }
    Ok(())
}
