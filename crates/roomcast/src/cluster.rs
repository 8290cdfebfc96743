//! Cluster bridge contract.
//!
//! A bridge forwards broadcasts, presence queries and server-side events to
//! sibling server processes over some external pub/sub or RPC mechanism.
//! On the receiving side, a bridge applies forwarded broadcasts through the
//! target namespace's adapter with [`BroadcastOptions::into_forwarded`],
//! other operations with the `local` flag set, and hands server-side events
//! to [`crate::Namespace::on_server_side_emit_received`].

use async_trait::async_trait;
use serde_json::Value;

use crate::adapter::ack::AckCollector;
use crate::adapter::types::{BroadcastOptions, Room, SocketDetails};
use crate::errors::SocketError;
use crate::packet::Packet;

/// Server-to-server coordination used by adapters.
///
/// Every method addresses the namespace named `nsp` on every *other* server.
#[async_trait]
pub trait ClusterBridge: Send + Sync {
    /// Number of servers in the cluster, this one included. Never zero.
    async fn server_count(&self) -> usize;

    /// Fire-and-forget broadcast to the other servers.
    async fn broadcast(
        &self,
        nsp: &str,
        packet: &Packet,
        opts: &BroadcastOptions,
    ) -> Result<(), SocketError>;

    /// Broadcast expecting acknowledgements.
    ///
    /// The bridge must call `collector.report_expected(n)` exactly once per
    /// other server, with `n = 0` for a server that cannot be reached, and
    /// `collector.push` for every response it relays.
    async fn broadcast_with_ack(
        &self,
        nsp: &str,
        packet: &Packet,
        opts: &BroadcastOptions,
        collector: AckCollector,
    ) -> Result<(), SocketError>;

    /// Send an application event to the other servers.
    ///
    /// With a collector, each other server reports one expected reply (zero
    /// when unreachable) and its reply is pushed under the server's id.
    async fn server_side_emit(
        &self,
        nsp: &str,
        event: &str,
        args: &[Value],
        collector: Option<AckCollector>,
    ) -> Result<(), SocketError>;

    /// Sockets matching `opts` on the other servers.
    async fn fetch_sockets(
        &self,
        nsp: &str,
        opts: &BroadcastOptions,
    ) -> Result<Vec<SocketDetails>, SocketError>;

    async fn add_sockets(
        &self,
        nsp: &str,
        opts: &BroadcastOptions,
        rooms: &[Room],
    ) -> Result<(), SocketError>;

    async fn del_sockets(
        &self,
        nsp: &str,
        opts: &BroadcastOptions,
        rooms: &[Room],
    ) -> Result<(), SocketError>;

    async fn disconnect_sockets(
        &self,
        nsp: &str,
        opts: &BroadcastOptions,
        close: bool,
    ) -> Result<(), SocketError>;
}

/// Bridge for a server running alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleNode;

#[async_trait]
impl ClusterBridge for SingleNode {
    async fn server_count(&self) -> usize {
        1
    }

    async fn broadcast(&self, _: &str, _: &Packet, _: &BroadcastOptions) -> Result<(), SocketError> {
        Ok(())
    }

    async fn broadcast_with_ack(
        &self,
        _: &str,
        _: &Packet,
        _: &BroadcastOptions,
        _: AckCollector,
    ) -> Result<(), SocketError> {
        Ok(())
    }

    async fn server_side_emit(
        &self,
        _: &str,
        _: &str,
        _: &[Value],
        _: Option<AckCollector>,
    ) -> Result<(), SocketError> {
        Ok(())
    }

    async fn fetch_sockets(
        &self,
        _: &str,
        _: &BroadcastOptions,
    ) -> Result<Vec<SocketDetails>, SocketError> {
        Ok(Vec::new())
    }

    async fn add_sockets(&self, _: &str, _: &BroadcastOptions, _: &[Room]) -> Result<(), SocketError> {
        Ok(())
    }

    async fn del_sockets(&self, _: &str, _: &BroadcastOptions, _: &[Room]) -> Result<(), SocketError> {
        Ok(())
    }

    async fn disconnect_sockets(
        &self,
        _: &str,
        _: &BroadcastOptions,
        _: bool,
    ) -> Result<(), SocketError> {
        Ok(())
    }
}
