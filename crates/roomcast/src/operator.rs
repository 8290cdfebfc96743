//! Broadcast operator: immutable, chainable broadcast targets.
//!
//! Every builder method returns a new operator, so two chains branching from
//! the same base never see each other's rooms or flags:
//!
//! ```rust,ignore
//! let lobby = nsp.to(["lobby"]);
//! lobby.except(["banned"]).emit("news", vec![json!("hi")]).await?;
//! lobby.volatile().emit("tick", vec![]).await?; // still targets all of "lobby"
//! ```

use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::ack::{AckCollector, AckOutcome};
use crate::adapter::types::{BroadcastOptions, Handshake, Room, SocketDetails, SocketId};
use crate::errors::{AckError, SocketError};
use crate::namespace::Namespace;
use crate::packet::Packet;
use crate::socket::check_reserved;

#[derive(Clone)]
pub struct BroadcastOperator {
    nsp: Arc<Namespace>,
    opts: BroadcastOptions,
}

impl fmt::Debug for BroadcastOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastOperator")
            .field("nsp", &self.nsp.name())
            .field("opts", &self.opts)
            .finish()
    }
}

impl BroadcastOperator {
    pub(crate) fn new(nsp: Arc<Namespace>) -> Self {
        Self {
            nsp,
            opts: BroadcastOptions::default(),
        }
    }

    /// Target description accumulated so far.
    pub fn options(&self) -> &BroadcastOptions {
        &self.opts
    }

    fn layered(&self, f: impl FnOnce(&mut BroadcastOptions)) -> Self {
        let mut next = self.clone();
        f(&mut next.opts);
        next
    }

    /// Add rooms to the target set.
    #[must_use]
    pub fn to<I, R>(&self, rooms: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.layered(|opts| opts.rooms.extend(rooms.into_iter().map(Into::into)))
    }

    /// Alias of [`Self::to`].
    #[must_use]
    pub fn in_<I, R>(&self, rooms: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.to(rooms)
    }

    /// Exclude members of these rooms.
    #[must_use]
    pub fn except<I, R>(&self, rooms: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.layered(|opts| opts.except.extend(rooms.into_iter().map(Into::into)))
    }

    /// Only this server's sockets.
    #[must_use]
    pub fn local(&self) -> Self {
        self.layered(|opts| opts.flags.local = true)
    }

    /// Drop the packet for clients that are not ready to receive it.
    #[must_use]
    pub fn volatile(&self) -> Self {
        self.layered(|opts| opts.flags.volatile = true)
    }

    #[must_use]
    pub fn compress(&self, compress: bool) -> Self {
        self.layered(|opts| opts.flags.compress = compress)
    }

    /// Hint the transport that the payload carries binary data.
    #[must_use]
    pub fn binary(&self, binary: bool) -> Self {
        self.layered(|opts| opts.flags.binary = binary)
    }

    /// Deadline for acknowledgements requested by `emit_with_ack*`.
    #[must_use]
    pub fn timeout(&self, timeout: Duration) -> Self {
        self.layered(|opts| opts.flags.timeout = Some(timeout))
    }

    #[must_use]
    pub(crate) fn expect_single_response(&self) -> Self {
        self.layered(|opts| opts.flags.expect_single_response = true)
    }

    pub async fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), SocketError> {
        check_reserved(event)?;
        let packet = Packet::event(self.nsp.name(), event, args);
        self.nsp.adapter().broadcast(packet, self.opts.clone()).await
    }

    /// Emit and invoke `callback` once every targeted client acknowledged,
    /// or with partial results when the timeout fires first.
    pub async fn emit_with_ack_callback(
        &self,
        event: &str,
        args: Vec<Value>,
        callback: impl FnOnce(AckOutcome) + Send + 'static,
    ) -> Result<(), SocketError> {
        check_reserved(event)?;
        let collector = AckCollector::new(self.opts.flags.expect_single_response, callback);
        self.emit_collecting(event, args, collector).await
    }

    /// Emit and wait for the aggregated acknowledgements.
    pub async fn emit_with_ack(
        &self,
        event: &str,
        args: Vec<Value>,
    ) -> Result<AckOutcome, SocketError> {
        check_reserved(event)?;
        let (collector, handle) = AckCollector::channel(self.opts.flags.expect_single_response);
        self.emit_collecting(event, args, collector).await?;
        Ok(handle.await)
    }

    async fn emit_collecting(
        &self,
        event: &str,
        args: Vec<Value>,
        collector: AckCollector,
    ) -> Result<(), SocketError> {
        if let Some(timeout) = self.opts.flags.timeout {
            collector.arm_timeout(timeout);
        }
        let packet = Packet::event(self.nsp.name(), event, args);
        self.nsp
            .adapter()
            .broadcast_with_ack(packet, self.opts.clone(), collector)
            .await
    }

    /// Matching sockets across the cluster.
    pub async fn fetch_sockets(&self) -> Result<Vec<RemoteSocket>, SocketError> {
        let details = self.nsp.adapter().fetch_sockets(&self.opts).await?;
        Ok(details
            .into_iter()
            .map(|details| RemoteSocket {
                nsp: self.nsp.clone(),
                details,
            })
            .collect())
    }

    pub async fn sockets_join<I, R>(&self, rooms: I) -> Result<(), SocketError>
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        let rooms = rooms.into_iter().map(Into::into).collect();
        self.nsp.adapter().add_sockets(&self.opts, rooms).await
    }

    pub async fn sockets_leave<I, R>(&self, rooms: I) -> Result<(), SocketError>
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        let rooms = rooms.into_iter().map(Into::into).collect();
        self.nsp.adapter().del_sockets(&self.opts, rooms).await
    }

    /// Disconnect matching sockets; `close` also closes their transport.
    pub async fn disconnect_sockets(&self, close: bool) -> Result<(), SocketError> {
        self.nsp.adapter().disconnect_sockets(&self.opts, close).await
    }

    /// Ids of matching sockets across the cluster.
    pub async fn all_sockets(&self) -> Result<HashSet<SocketId>, SocketError> {
        let details = self.nsp.adapter().fetch_sockets(&self.opts).await?;
        Ok(details.into_iter().map(|d| d.id).collect())
    }
}

/// A socket returned by `fetch_sockets`, possibly connected to another server.
///
/// Operations are addressed to the room named after the socket id, so they
/// reach it wherever it lives.
#[derive(Clone)]
pub struct RemoteSocket {
    nsp: Arc<Namespace>,
    details: SocketDetails,
}

impl fmt::Debug for RemoteSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSocket")
            .field("id", &self.details.id)
            .field("rooms", &self.details.rooms)
            .finish_non_exhaustive()
    }
}

impl RemoteSocket {
    pub fn id(&self) -> &SocketId {
        &self.details.id
    }

    pub fn handshake(&self) -> &Handshake {
        &self.details.handshake
    }

    pub fn rooms(&self) -> &HashSet<Room> {
        &self.details.rooms
    }

    pub fn data(&self) -> &Value {
        &self.details.data
    }

    fn operator(&self) -> BroadcastOperator {
        BroadcastOperator::new(self.nsp.clone()).to([&self.details.id])
    }

    pub async fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), SocketError> {
        self.operator().emit(event, args).await
    }

    /// Emit and wait for this socket's acknowledgement.
    pub async fn emit_with_ack(
        &self,
        event: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>, SocketError> {
        let outcome = self
            .operator()
            .timeout(timeout)
            .expect_single_response()
            .emit_with_ack(event, args)
            .await?;
        let mut responses = outcome.into_result()?;
        match responses.pop() {
            Some(response) => response.result.map_err(SocketError::from),
            None => Err(AckError::Timeout.into()),
        }
    }

    pub async fn join<I, R>(&self, rooms: I) -> Result<(), SocketError>
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.operator().sockets_join(rooms).await
    }

    pub async fn leave<I, R>(&self, rooms: I) -> Result<(), SocketError>
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.operator().sockets_leave(rooms).await
    }

    pub async fn disconnect(&self, close: bool) -> Result<(), SocketError> {
        self.operator().disconnect_sockets(close).await
    }
}
