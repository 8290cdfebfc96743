//! In-process session store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::SessionStore;
use crate::adapter::types::{PersistedPacket, PrivateSessionId, RecoverableSession};
use crate::errors::SessionStoreError;

/// Sessions kept in a map for the lifetime of the process.
///
/// Expiry is enforced by the owning adapter's purge task and by the
/// expiry check on restore; `ttl` is not tracked here.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<PrivateSessionId, RecoverableSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PrivateSessionId, RecoverableSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(
        &self,
        session: RecoverableSession,
        _ttl: Duration,
    ) -> Result<(), SessionStoreError> {
        self.lock().insert(session.session.pid.clone(), session);
        Ok(())
    }

    async fn take(
        &self,
        pid: &PrivateSessionId,
    ) -> Result<Option<RecoverableSession>, SessionStoreError> {
        Ok(self.lock().remove(pid))
    }

    async fn append_missed(
        &self,
        pid: &PrivateSessionId,
        packet: &PersistedPacket,
    ) -> Result<(), SessionStoreError> {
        if let Some(session) = self.lock().get_mut(pid) {
            session.missed.push(packet.clone());
        }
        Ok(())
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, SessionStoreError> {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.disconnected_at >= cutoff);
        Ok(before - sessions.len())
    }
}
