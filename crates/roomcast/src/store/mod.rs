//! Session persistence for connection-state recovery.
//!
//! A store keeps [`RecoverableSession`]s keyed by private session id until
//! they are redeemed or expire. Deciding which sessions a broadcast would
//! have reached is the adapter's job; the store only appends to the buffer
//! it is told to.

mod lua_scripts;
mod memory;
mod redis;

pub use self::memory::MemorySessionStore;
pub use self::redis::RedisSessionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::adapter::types::{PersistedPacket, PrivateSessionId, RecoverableSession};
use crate::errors::SessionStoreError;

/// Backend holding recoverable sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a session, redeemable for `ttl`.
    async fn save(&self, session: RecoverableSession, ttl: Duration)
        -> Result<(), SessionStoreError>;

    /// Remove and return a session. A session can be taken at most once.
    async fn take(
        &self,
        pid: &PrivateSessionId,
    ) -> Result<Option<RecoverableSession>, SessionStoreError>;

    /// Append a packet to a session's missed buffer. No-op for unknown sessions.
    async fn append_missed(
        &self,
        pid: &PrivateSessionId,
        packet: &PersistedPacket,
    ) -> Result<(), SessionStoreError>;

    /// Drop sessions disconnected before `cutoff`, returning how many were dropped.
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, SessionStoreError>;
}
