//! Roomcast
//!
//! Coordination core of a real-time messaging server: namespaces multiplexed
//! over persistent client connections, rooms for selective broadcast,
//! acknowledgement aggregation across local and remote recipients, and
//! connection-state recovery for clients that drop and come back.
//!
//! # Architecture
//!
//! ```text
//! Server
//! ├── Namespace ("/", "/chat", children of ParentNamespace)
//! │   ├── middleware chain, connection listeners
//! │   ├── Socket (one per client per namespace)
//! │   └── Adapter (LocalAdapter | SessionAwareAdapter)
//! │       ├── RoomRegistry
//! │       ├── AckCollector (per ack-bearing broadcast)
//! │       ├── ClusterBridge (sibling servers)
//! │       └── SessionStore (memory | Redis)
//! └── Client (one per transport Connection)
//! ```
//!
//! The transport engine and the cluster transport are external: they plug
//! in through [`transport::Connection`] and [`cluster::ClusterBridge`].
//!
//! # Modules
//!
//! - [`adapter`] - room registry, broadcast, acks and session recovery
//! - [`config`] - configuration from environment
//! - [`errors`] - error types
//! - [`operator`] - chainable broadcast operator
//! - [`store`] - session store backends

pub mod adapter;
pub mod client;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod namespace;
pub mod observability;
pub mod operator;
pub mod packet;
pub mod parent;
pub mod server;
pub mod socket;
pub mod store;
pub mod transport;

pub use adapter::ack::{AckCollector, AckOutcome, AckResponse};
pub use adapter::types::{BroadcastOptions, Handshake, PrivateSessionId, Room, SocketId};
pub use adapter::{Adapter, AdapterBuilder, LocalAdapterBuilder, SessionAwareAdapterBuilder};
pub use client::Client;
pub use errors::{AckError, MiddlewareError, SocketError};
pub use namespace::Namespace;
pub use operator::{BroadcastOperator, RemoteSocket};
pub use packet::{Packet, PacketKind};
pub use parent::ParentNamespace;
pub use server::{Server, ServerOptions};
pub use socket::{AckSender, DisconnectReason, Socket};
