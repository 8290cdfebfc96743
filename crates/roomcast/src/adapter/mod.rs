//! Adapters: per-namespace room bookkeeping, broadcast delivery and cluster
//! coordination.
//!
//! [`Adapter`] carries the in-memory behaviour as default methods. A concrete
//! adapter supplies its [`AdapterContext`], [`RoomRegistry`] and
//! [`ClusterBridge`], and overrides only what it changes; the
//! session-aware adapter, for instance, wraps a [`LocalAdapter`] and
//! intercepts `broadcast`, `persist_session` and `restore_session`.
//!
//! Adapters are built per namespace by an [`AdapterBuilder`], which the
//! server swaps at runtime with `Server::set_adapter`.

pub mod ack;
pub mod registry;
pub mod session;
pub mod types;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::cluster::{ClusterBridge, SingleNode};
use crate::errors::{AckError, SocketError};
use crate::observability::metrics;
use crate::packet::{Packet, PacketEncoder};
use crate::socket::Socket;

use ack::AckCollector;
use registry::RoomRegistry;
use types::{BroadcastOptions, PrivateSessionId, Room, Session, SessionToPersist, SocketDetails, SocketId};

pub use session::{SessionAwareAdapter, SessionAwareAdapterBuilder};

/// Live sockets of one namespace, shared between the namespace and its adapter.
pub(crate) type SocketMap = Arc<RwLock<HashMap<SocketId, Arc<Socket>>>>;

/// What a namespace hands to its adapter.
#[derive(Clone)]
pub struct AdapterContext {
    nsp: String,
    sockets: SocketMap,
    encoder: Arc<dyn PacketEncoder>,
    ids: Arc<AtomicU64>,
}

impl fmt::Debug for AdapterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterContext")
            .field("nsp", &self.nsp)
            .finish_non_exhaustive()
    }
}

impl AdapterContext {
    pub(crate) fn new(
        nsp: String,
        sockets: SocketMap,
        encoder: Arc<dyn PacketEncoder>,
        ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            nsp,
            sockets,
            encoder,
            ids,
        }
    }

    /// Name of the owning namespace.
    pub fn nsp(&self) -> &str {
        &self.nsp
    }

    pub fn encoder(&self) -> &Arc<dyn PacketEncoder> {
        &self.encoder
    }

    /// Next value of the namespace's monotonic counter.
    pub fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Live sockets among `ids`; ids without a live socket are skipped.
    pub(crate) fn lookup(&self, ids: &HashSet<SocketId>) -> Vec<Arc<Socket>> {
        let sockets = self.sockets.read().unwrap_or_else(PoisonError::into_inner);
        ids.iter().filter_map(|id| sockets.get(id).cloned()).collect()
    }
}

/// Per-namespace room registry, broadcast engine and cluster front.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn context(&self) -> &AdapterContext;

    fn registry(&self) -> &RoomRegistry;

    fn cluster(&self) -> &Arc<dyn ClusterBridge>;

    /// Called once after the adapter is attached to its namespace.
    fn init(&self) {}

    /// Called when the namespace drops this adapter.
    async fn close(&self) {}

    async fn server_count(&self) -> usize {
        self.cluster().server_count().await.max(1)
    }

    fn add_all(&self, id: &SocketId, rooms: Vec<Room>) {
        self.registry().add_all(id, rooms);
    }

    fn del(&self, id: &SocketId, room: &Room) {
        self.registry().del(id, room);
    }

    fn del_all(&self, id: &SocketId) {
        self.registry().del_all(id);
    }

    /// Local members of `rooms`, or every local socket when empty.
    fn sockets(&self, rooms: &HashSet<Room>) -> HashSet<SocketId> {
        self.registry().sockets(rooms)
    }

    fn socket_rooms(&self, id: &SocketId) -> Option<HashSet<Room>> {
        self.registry().rooms_of(id)
    }

    fn rooms(&self) -> HashSet<Room> {
        self.registry().rooms()
    }

    /// Deliver `packet` to every matching local socket, then to the cluster
    /// unless `local` is set.
    ///
    /// A failed write to one socket is recorded and skipped. A cluster failure
    /// is logged; local delivery has already happened.
    async fn broadcast(&self, packet: Packet, opts: BroadcastOptions) -> Result<(), SocketError> {
        let ctx = self.context();
        let ids = self.registry().resolve(&opts.rooms, &opts.except);
        let frames = ctx.encoder().encode(&packet)?;
        let write = opts.write_options();

        for socket in ctx.lookup(&ids) {
            if let Err(e) = socket.write_frames(frames.clone(), &write) {
                metrics::record_delivery_failure();
                debug!(
                    target: "roomcast.adapter",
                    nsp = %ctx.nsp(),
                    socket_id = %socket.id(),
                    error = %e,
                    "Broadcast delivery failed"
                );
            }
        }
        metrics::record_broadcast("plain", ids.len());

        if !opts.flags.local {
            if let Err(e) = self.cluster().broadcast(ctx.nsp(), &packet, &opts).await {
                warn!(
                    target: "roomcast.adapter",
                    nsp = %ctx.nsp(),
                    error = %e,
                    "Cluster broadcast failed"
                );
            }
        }
        Ok(())
    }

    /// Broadcast expecting one acknowledgement per recipient.
    ///
    /// The collector is told how many servers take part and how many local
    /// recipients were written to; remote servers report their own counts
    /// through the cluster bridge. If the bridge fails, servers that never
    /// reported count as zero.
    async fn broadcast_with_ack(
        &self,
        mut packet: Packet,
        opts: BroadcastOptions,
        collector: AckCollector,
    ) -> Result<(), SocketError> {
        let ctx = self.context();
        let ack_id = ctx.next_id();
        packet.id = Some(ack_id);
        let frames = ctx.encoder().encode(&packet)?;
        let write = opts.write_options();

        let servers = if opts.flags.local {
            1
        } else {
            self.server_count().await
        };
        collector.set_expected_servers(servers);

        let ids = self.registry().resolve(&opts.rooms, &opts.except);
        let recipients = ctx.lookup(&ids);
        for socket in &recipients {
            let source = socket.id().to_string();
            let sink = collector.clone();
            let sink_source = source.clone();
            socket.register_ack(
                ack_id,
                Box::new(move |result| sink.push(sink_source, result)),
            );

            if let Err(e) = socket.write_frames(frames.clone(), &write) {
                metrics::record_delivery_failure();
                socket.cancel_ack(ack_id);
                collector.push(source, Err(AckError::Delivery(e.to_string())));
            }
        }
        collector.report_expected(recipients.len());
        metrics::record_broadcast("ack", recipients.len());

        if !opts.flags.local && servers > 1 {
            if let Err(e) = self
                .cluster()
                .broadcast_with_ack(ctx.nsp(), &packet, &opts, collector.clone())
                .await
            {
                warn!(
                    target: "roomcast.adapter",
                    nsp = %ctx.nsp(),
                    error = %e,
                    "Cluster broadcast with ack failed"
                );
                collector.fail_remaining_servers();
            }
        }
        Ok(())
    }

    /// Details of matching sockets, local first, then remote unless `local` is set.
    async fn fetch_sockets(&self, opts: &BroadcastOptions) -> Result<Vec<SocketDetails>, SocketError> {
        let ids = self.registry().resolve(&opts.rooms, &opts.except);
        let mut details: Vec<SocketDetails> = self
            .context()
            .lookup(&ids)
            .into_iter()
            .map(|socket| SocketDetails {
                rooms: self.socket_rooms(socket.id()).unwrap_or_default(),
                id: socket.id().clone(),
                handshake: socket.handshake().clone(),
                data: socket.data(),
            })
            .collect();

        if !opts.flags.local {
            let remote = self
                .cluster()
                .fetch_sockets(self.context().nsp(), opts)
                .await?;
            details.extend(remote);
        }
        Ok(details)
    }

    /// Make matching sockets join `rooms`.
    async fn add_sockets(&self, opts: &BroadcastOptions, rooms: Vec<Room>) -> Result<(), SocketError> {
        for id in self.registry().resolve(&opts.rooms, &opts.except) {
            self.add_all(&id, rooms.clone());
        }
        if !opts.flags.local {
            self.cluster()
                .add_sockets(self.context().nsp(), opts, &rooms)
                .await?;
        }
        Ok(())
    }

    /// Make matching sockets leave `rooms`.
    async fn del_sockets(&self, opts: &BroadcastOptions, rooms: Vec<Room>) -> Result<(), SocketError> {
        for id in self.registry().resolve(&opts.rooms, &opts.except) {
            for room in &rooms {
                self.del(&id, room);
            }
        }
        if !opts.flags.local {
            self.cluster()
                .del_sockets(self.context().nsp(), opts, &rooms)
                .await?;
        }
        Ok(())
    }

    async fn disconnect_sockets(&self, opts: &BroadcastOptions, close: bool) -> Result<(), SocketError> {
        let ids = self.registry().resolve(&opts.rooms, &opts.except);
        for socket in self.context().lookup(&ids) {
            socket.disconnect(close).await;
        }
        if !opts.flags.local {
            self.cluster()
                .disconnect_sockets(self.context().nsp(), opts, close)
                .await?;
        }
        Ok(())
    }

    /// Send an application event to the other servers of the cluster.
    async fn server_side_emit(
        &self,
        event: &str,
        args: Vec<Value>,
        collector: Option<AckCollector>,
    ) -> Result<(), SocketError> {
        if let Some(collector) = &collector {
            let servers = self.server_count().await;
            collector.set_expected_servers(servers.saturating_sub(1));
        }
        let result = self
            .cluster()
            .server_side_emit(self.context().nsp(), event, &args, collector.clone())
            .await;
        if let (Err(_), Some(collector)) = (&result, &collector) {
            collector.fail_remaining_servers();
        }
        result
    }

    /// Store a disconnected socket's state for later recovery.
    async fn persist_session(&self, _session: SessionToPersist) {}

    /// Redeem a stored session; `Ok(None)` when there is nothing to recover.
    async fn restore_session(
        &self,
        _pid: &PrivateSessionId,
        _offset: &str,
    ) -> Result<Option<Session>, SocketError> {
        Ok(None)
    }
}

/// Creates one adapter per namespace.
pub trait AdapterBuilder: Send + Sync {
    fn build(&self, ctx: AdapterContext) -> Arc<dyn Adapter>;
}

/// In-memory adapter.
pub struct LocalAdapter {
    ctx: AdapterContext,
    registry: RoomRegistry,
    cluster: Arc<dyn ClusterBridge>,
}

impl LocalAdapter {
    pub fn new(ctx: AdapterContext, cluster: Arc<dyn ClusterBridge>) -> Self {
        Self {
            ctx,
            registry: RoomRegistry::new(),
            cluster,
        }
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn context(&self) -> &AdapterContext {
        &self.ctx
    }

    fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    fn cluster(&self) -> &Arc<dyn ClusterBridge> {
        &self.cluster
    }
}

/// Builds [`LocalAdapter`]s, on a single node unless a bridge is supplied.
#[derive(Clone)]
pub struct LocalAdapterBuilder {
    cluster: Arc<dyn ClusterBridge>,
}

impl Default for LocalAdapterBuilder {
    fn default() -> Self {
        Self {
            cluster: Arc::new(SingleNode),
        }
    }
}

impl LocalAdapterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterBridge>) -> Self {
        self.cluster = cluster;
        self
    }
}

impl AdapterBuilder for LocalAdapterBuilder {
    fn build(&self, ctx: AdapterContext) -> Arc<dyn Adapter> {
        Arc::new(LocalAdapter::new(ctx, self.cluster.clone()))
    }
}
