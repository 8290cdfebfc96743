//! Redis-backed session store.
//!
//! Lets a client recover its session on any server of the cluster.
//!
//! # Key Patterns
//!
//! - `roomcast:session:{pid}` - Recoverable session (JSON), TTL = max disconnection duration
//! - `roomcast:missed:{pid}` - Missed packets (LIST of JSON), expires with the session
//!
//! Keys are prefixed with the namespace when the store is built per namespace
//! (`roomcast:/chat:session:{pid}`).
//!
//! # Connection Pattern
//!
//! `MultiplexedConnection` is cheap to clone and safe to use concurrently,
//! so every operation clones it instead of locking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

use super::lua_scripts;
use super::SessionStore;
use crate::adapter::types::{PersistedPacket, PrivateSessionId, RecoverableSession};
use crate::errors::SessionStoreError;

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "roomcast";

fn session_key(prefix: &str, pid: &PrivateSessionId) -> String {
    format!("{prefix}:session:{pid}")
}

fn missed_key(prefix: &str, pid: &PrivateSessionId) -> String {
    format!("{prefix}:missed:{pid}")
}

/// Session store persisting to Redis.
#[derive(Clone)]
pub struct RedisSessionStore {
    connection: MultiplexedConnection,
    prefix: String,
    take_script: Script,
    append_script: Script,
}

impl RedisSessionStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `SessionStoreError::Backend` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, SessionStoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Never log the URL: it may carry credentials.
            error!(
                target: "roomcast.session",
                error = %e,
                "Failed to open Redis client"
            );
            SessionStoreError::Backend(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "roomcast.session",
                    error = %e,
                    "Failed to connect to Redis"
                );
                SessionStoreError::Backend(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self::from_connection(connection))
    }

    pub fn from_connection(connection: MultiplexedConnection) -> Self {
        Self {
            connection,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            take_script: Script::new(lua_scripts::TAKE_SESSION),
            append_script: Script::new(lua_scripts::APPEND_MISSED),
        }
    }

    /// Copy of this store writing under `{prefix}:{nsp}`.
    #[must_use]
    pub fn for_namespace(&self, nsp: &str) -> Self {
        Self {
            prefix: format!("{DEFAULT_KEY_PREFIX}:{nsp}"),
            ..self.clone()
        }
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    #[instrument(skip_all, fields(pid = %session.session.pid))]
    async fn save(
        &self,
        session: RecoverableSession,
        ttl: Duration,
    ) -> Result<(), SessionStoreError> {
        let mut conn = self.connection.clone();
        let key = session_key(&self.prefix, &session.session.pid);
        let payload = serde_json::to_string(&session)?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let _: () = redis::cmd("SET")
            .arg(&key)
            .arg(payload)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(
                    target: "roomcast.session",
                    error = %e,
                    "Failed to persist session"
                );
                SessionStoreError::Backend(format!("Failed to persist session: {e}"))
            })?;

        debug!(target: "roomcast.session", ttl_ms, "Persisted session");
        Ok(())
    }

    #[instrument(skip_all, fields(pid = %pid))]
    async fn take(
        &self,
        pid: &PrivateSessionId,
    ) -> Result<Option<RecoverableSession>, SessionStoreError> {
        let mut conn = self.connection.clone();

        let (stored, missed): (Option<String>, Vec<String>) = self
            .take_script
            .key(session_key(&self.prefix, pid))
            .key(missed_key(&self.prefix, pid))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(
                    target: "roomcast.session",
                    error = %e,
                    "Failed to take session"
                );
                SessionStoreError::Backend(format!("Failed to take session: {e}"))
            })?;

        let Some(stored) = stored else {
            return Ok(None);
        };

        let mut session: RecoverableSession = serde_json::from_str(&stored)?;
        session.missed = missed
            .iter()
            .map(|raw| serde_json::from_str(raw))
            .collect::<Result<_, _>>()?;
        Ok(Some(session))
    }

    async fn append_missed(
        &self,
        pid: &PrivateSessionId,
        packet: &PersistedPacket,
    ) -> Result<(), SessionStoreError> {
        let mut conn = self.connection.clone();
        let payload = serde_json::to_string(packet)?;

        let appended: i64 = self
            .append_script
            .key(session_key(&self.prefix, pid))
            .key(missed_key(&self.prefix, pid))
            .arg(payload)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(
                    target: "roomcast.session",
                    error = %e,
                    "Failed to append missed packet"
                );
                SessionStoreError::Backend(format!("Failed to append missed packet: {e}"))
            })?;

        if appended == 0 {
            debug!(target: "roomcast.session", pid = %pid, "Session gone, missed packet dropped");
        }
        Ok(())
    }

    async fn purge_expired(&self, _cutoff: DateTime<Utc>) -> Result<usize, SessionStoreError> {
        // Keys carry their own TTL.
        Ok(0)
    }
}
