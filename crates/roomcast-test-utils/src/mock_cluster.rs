//! Scripted cluster bridge.
//!
//! Each [`RemoteServer`] stands for a sibling process with its own sockets.
//! Remote sockets answer ack-bearing broadcasts after a configurable delay,
//! unreachable servers report zero expected responses, and every call made
//! through the bridge is recorded for assertions. A [`MockCluster::failing`]
//! bridge records calls but returns an error from each of them, as a bridge
//! whose transport is down would.
//!
//! # Example
//!
//! ```rust,ignore
//! use roomcast_test_utils::{MockCluster, RemoteServer, RemoteSocketSpec};
//!
//! let cluster = MockCluster::new()
//!     .with_server(
//!         RemoteServer::new("node-b")
//!             .with_socket(RemoteSocketSpec::new("b1").in_room("lobby").ack_after(Duration::from_millis(10))),
//!     )
//!     .with_server(RemoteServer::new("node-c").unreachable());
//!
//! let server = Server::new(ServerOptions::default()
//!     .with_adapter(LocalAdapterBuilder::new().with_cluster(cluster.bridge())));
//! ```

use async_trait::async_trait;
use chrono::Utc;
use roomcast::adapter::ack::AckCollector;
use roomcast::adapter::types::{BroadcastOptions, Handshake, Room, SocketDetails, SocketId};
use roomcast::cluster::ClusterBridge;
use roomcast::errors::SocketError;
use roomcast::packet::Packet;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A socket living on a remote server.
#[derive(Debug, Clone)]
pub struct RemoteSocketSpec {
    id: String,
    rooms: HashSet<Room>,
    data: Value,
    ack: Option<(Duration, Vec<Value>)>,
}

impl RemoteSocketSpec {
    /// Socket `id`, member of its own id room. It never acknowledges unless
    /// [`Self::ack_after`] is set.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            rooms: HashSet::from([Room::new(id)]),
            data: Value::Null,
            ack: None,
        }
    }

    #[must_use]
    pub fn in_room(mut self, room: &str) -> Self {
        self.rooms.insert(Room::new(room));
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Acknowledge with `[id]` after `delay`.
    #[must_use]
    pub fn ack_after(self, delay: Duration) -> Self {
        let reply = vec![json!(self.id)];
        self.ack_with(delay, reply)
    }

    #[must_use]
    pub fn ack_with(mut self, delay: Duration, reply: Vec<Value>) -> Self {
        self.ack = Some((delay, reply));
        self
    }

    fn details(&self) -> SocketDetails {
        SocketDetails {
            id: SocketId::new(self.id.clone()),
            handshake: Handshake {
                auth: Value::Null,
                issued_at: Utc::now(),
                connection_id: format!("remote-{}", self.id),
            },
            rooms: self.rooms.clone(),
            data: self.data.clone(),
        }
    }
}

/// A sibling server process.
#[derive(Debug, Clone)]
pub struct RemoteServer {
    id: String,
    reachable: bool,
    sockets: Vec<RemoteSocketSpec>,
    server_side_reply: Option<Vec<Value>>,
}

impl RemoteServer {
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            reachable: true,
            sockets: Vec::new(),
            server_side_reply: None,
        }
    }

    #[must_use]
    pub fn with_socket(mut self, socket: RemoteSocketSpec) -> Self {
        self.sockets.push(socket);
        self
    }

    /// Counted in the cluster size, but never answers.
    #[must_use]
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// Reply sent to server-side emits that request an acknowledgement.
    #[must_use]
    pub fn replying(mut self, reply: Vec<Value>) -> Self {
        self.server_side_reply = Some(reply);
        self
    }
}

/// A call made through the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterCall {
    Broadcast { nsp: String, packet: Packet, opts: BroadcastOptions },
    BroadcastWithAck { nsp: String, packet: Packet, opts: BroadcastOptions },
    ServerSideEmit { nsp: String, event: String, args: Vec<Value>, with_ack: bool },
    FetchSockets { nsp: String, opts: BroadcastOptions },
    AddSockets { nsp: String, rooms: Vec<Room> },
    DelSockets { nsp: String, rooms: Vec<Room> },
    DisconnectSockets { nsp: String, close: bool },
}

/// Mock [`ClusterBridge`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockCluster {
    inner: Arc<Mutex<MockClusterInner>>,
}

#[derive(Debug, Default)]
struct MockClusterInner {
    servers: Vec<RemoteServer>,
    calls: Vec<ClusterCall>,
    failing: bool,
}

impl MockCluster {
    /// A cluster with no other servers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_server(self, server: RemoteServer) -> Self {
        self.inner.lock().unwrap().servers.push(server);
        self
    }

    /// Every bridge call fails after being recorded. Servers still count
    /// towards the cluster size.
    #[must_use]
    pub fn failing(self) -> Self {
        self.inner.lock().unwrap().failing = true;
        self
    }

    /// Bridge handle for adapter builders.
    pub fn bridge(&self) -> Arc<dyn ClusterBridge> {
        Arc::new(self.clone())
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Rooms of a remote socket, if any server hosts it.
    pub fn remote_rooms(&self, socket_id: &str) -> Option<HashSet<Room>> {
        self.inner
            .lock()
            .unwrap()
            .servers
            .iter()
            .flat_map(|s| s.sockets.iter())
            .find(|s| s.id == socket_id)
            .map(|s| s.rooms.clone())
    }

    /// Record `call`, failing it when the bridge is down.
    fn record(&self, call: ClusterCall) -> Result<(), SocketError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(call);
        if inner.failing {
            return Err(SocketError::Cluster("cluster transport unavailable".to_string()));
        }
        Ok(())
    }

    fn servers(&self) -> Vec<RemoteServer> {
        self.inner.lock().unwrap().servers.clone()
    }

    fn matching_sockets(&self, opts: &BroadcastOptions) -> Vec<RemoteSocketSpec> {
        self.servers()
            .into_iter()
            .filter(|s| s.reachable)
            .flat_map(|s| s.sockets)
            .filter(|s| opts.should_reach(&s.rooms))
            .collect()
    }
}

#[async_trait]
impl ClusterBridge for MockCluster {
    async fn server_count(&self) -> usize {
        1 + self.inner.lock().unwrap().servers.len()
    }

    async fn broadcast(
        &self,
        nsp: &str,
        packet: &Packet,
        opts: &BroadcastOptions,
    ) -> Result<(), SocketError> {
        self.record(ClusterCall::Broadcast {
            nsp: nsp.to_string(),
            packet: packet.clone(),
            opts: opts.clone(),
        })
    }

    async fn broadcast_with_ack(
        &self,
        nsp: &str,
        packet: &Packet,
        opts: &BroadcastOptions,
        collector: AckCollector,
    ) -> Result<(), SocketError> {
        self.record(ClusterCall::BroadcastWithAck {
            nsp: nsp.to_string(),
            packet: packet.clone(),
            opts: opts.clone(),
        })?;

        for server in self.servers() {
            if !server.reachable {
                collector.report_expected(0);
                continue;
            }
            let targets: Vec<RemoteSocketSpec> = server
                .sockets
                .into_iter()
                .filter(|s| opts.should_reach(&s.rooms))
                .collect();
            collector.report_expected(targets.len());

            for socket in targets {
                let Some((delay, reply)) = socket.ack else {
                    continue;
                };
                let collector = collector.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    collector.push(socket.id, Ok(reply));
                });
            }
        }
        Ok(())
    }

    async fn server_side_emit(
        &self,
        nsp: &str,
        event: &str,
        args: &[Value],
        collector: Option<AckCollector>,
    ) -> Result<(), SocketError> {
        self.record(ClusterCall::ServerSideEmit {
            nsp: nsp.to_string(),
            event: event.to_string(),
            args: args.to_vec(),
            with_ack: collector.is_some(),
        })?;

        let Some(collector) = collector else {
            return Ok(());
        };
        for server in self.servers() {
            match server.server_side_reply {
                Some(reply) if server.reachable => {
                    collector.report_expected(1);
                    collector.push(server.id, Ok(reply));
                }
                _ => collector.report_expected(0),
            }
        }
        Ok(())
    }

    async fn fetch_sockets(
        &self,
        nsp: &str,
        opts: &BroadcastOptions,
    ) -> Result<Vec<SocketDetails>, SocketError> {
        self.record(ClusterCall::FetchSockets {
            nsp: nsp.to_string(),
            opts: opts.clone(),
        })?;
        Ok(self
            .matching_sockets(opts)
            .iter()
            .map(RemoteSocketSpec::details)
            .collect())
    }

    async fn add_sockets(
        &self,
        nsp: &str,
        opts: &BroadcastOptions,
        rooms: &[Room],
    ) -> Result<(), SocketError> {
        self.record(ClusterCall::AddSockets {
            nsp: nsp.to_string(),
            rooms: rooms.to_vec(),
        })?;
        let mut inner = self.inner.lock().unwrap();
        for socket in inner.servers.iter_mut().flat_map(|s| s.sockets.iter_mut()) {
            if opts.should_reach(&socket.rooms) {
                socket.rooms.extend(rooms.iter().cloned());
            }
        }
        Ok(())
    }

    async fn del_sockets(
        &self,
        nsp: &str,
        opts: &BroadcastOptions,
        rooms: &[Room],
    ) -> Result<(), SocketError> {
        self.record(ClusterCall::DelSockets {
            nsp: nsp.to_string(),
            rooms: rooms.to_vec(),
        })?;
        let mut inner = self.inner.lock().unwrap();
        for socket in inner.servers.iter_mut().flat_map(|s| s.sockets.iter_mut()) {
            if opts.should_reach(&socket.rooms) {
                for room in rooms {
                    socket.rooms.remove(room);
                }
            }
        }
        Ok(())
    }

    async fn disconnect_sockets(
        &self,
        nsp: &str,
        opts: &BroadcastOptions,
        close: bool,
    ) -> Result<(), SocketError> {
        self.record(ClusterCall::DisconnectSockets {
            nsp: nsp.to_string(),
            close,
        })?;
        let mut inner = self.inner.lock().unwrap();
        for server in &mut inner.servers {
            server.sockets.retain(|s| !opts.should_reach(&s.rooms));
        }
        Ok(())
    }
}
