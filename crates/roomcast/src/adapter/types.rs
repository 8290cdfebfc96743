//! Value types shared by adapters, session stores and cluster bridges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::packet::WriteOptions;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Public identifier of a socket, unique within its namespace.
    SocketId
);

string_id!(
    /// Secret identifier used to redeem a recoverable session.
    ///
    /// Only ever sent to the owning client.
    PrivateSessionId
);

string_id!(
    /// A room name. Every socket is also a member of the room named after its id.
    Room
);

impl SocketId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl PrivateSessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl From<&SocketId> for Room {
    fn from(id: &SocketId) -> Self {
        Self(id.0.clone())
    }
}

impl From<SocketId> for Room {
    fn from(id: SocketId) -> Self {
        Self(id.0)
    }
}

/// Delivery flags carried by a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastFlags {
    pub volatile: bool,
    /// Confine delivery and ack counting to this process.
    pub local: bool,
    pub compress: bool,
    /// Hint that the payload carries binary data.
    pub binary: bool,
    /// Complete an ack request on the first response received anywhere.
    pub expect_single_response: bool,
    pub timeout: Option<Duration>,
    /// Relayed from another server; recoverable events already carry their offset.
    #[serde(default)]
    pub forwarded: bool,
}

/// Target description of a broadcast or bulk operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOptions {
    /// Rooms to include. Empty means every socket of the namespace.
    pub rooms: HashSet<Room>,
    /// Rooms whose members are excluded.
    pub except: HashSet<Room>,
    pub flags: BroadcastFlags,
}

impl BroadcastOptions {
    /// Whether a socket holding `rooms` would be targeted.
    pub fn should_reach(&self, rooms: &HashSet<Room>) -> bool {
        let included = self.rooms.is_empty() || self.rooms.iter().any(|r| rooms.contains(r));
        included && !self.except.iter().any(|r| rooms.contains(r))
    }

    /// Options for applying a broadcast received from another server:
    /// delivered locally only and marked as forwarded.
    #[must_use]
    pub fn into_forwarded(mut self) -> Self {
        self.flags.local = true;
        self.flags.forwarded = true;
        self
    }

    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            compress: self.flags.compress,
            volatile: self.flags.volatile,
            binary: self.flags.binary,
        }
    }
}

/// Handshake details captured when a socket is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    /// Auth payload sent with the namespace `CONNECT` packet.
    pub auth: Value,
    pub issued_at: DateTime<Utc>,
    /// Identifier of the underlying transport connection.
    pub connection_id: String,
}

/// Serializable view of a socket, possibly living on another server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketDetails {
    pub id: SocketId,
    pub handshake: Handshake,
    pub rooms: HashSet<Room>,
    pub data: Value,
}

/// State snapshot taken when a recoverable socket disconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionToPersist {
    pub sid: SocketId,
    pub pid: PrivateSessionId,
    pub rooms: HashSet<Room>,
    pub data: Value,
}

/// A broadcast captured for a disconnected session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPacket {
    /// Offset id, also sent to connected clients as the trailing data element.
    pub id: String,
    pub emitted_at: DateTime<Utc>,
    pub data: Vec<Value>,
    pub opts: BroadcastOptions,
}

/// A persisted session waiting to be redeemed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverableSession {
    #[serde(flatten)]
    pub session: SessionToPersist,
    pub disconnected_at: DateTime<Utc>,
    #[serde(default)]
    pub missed: Vec<PersistedPacket>,
}

impl RecoverableSession {
    /// Packets emitted after `offset`; an unknown offset yields every packet.
    pub fn missed_after(&self, offset: &str) -> Vec<PersistedPacket> {
        match self.missed.iter().position(|p| p.id == offset) {
            Some(index) => self.missed.iter().skip(index + 1).cloned().collect(),
            None => self.missed.clone(),
        }
    }
}

/// A session restored during reconnection.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session: SessionToPersist,
    /// Event packet data to replay, in emission order.
    pub missed_packets: Vec<Vec<Value>>,
}
