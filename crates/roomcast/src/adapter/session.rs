//! Session-aware adapter for connection-state recovery.
//!
//! Wraps a [`LocalAdapter`] and adds three things:
//! - every recoverable broadcast gets an offset id appended to its data, so
//!   clients can tell the server the last packet they saw (broadcasts
//!   forwarded by another server keep the offset they arrived with);
//! - the same broadcast is appended to the missed buffer of every
//!   disconnected session it would have reached, at broadcast time;
//! - disconnected sockets are persisted and redeemed through a
//!   [`SessionStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::registry::RoomRegistry;
use super::types::{
    BroadcastOptions, PersistedPacket, PrivateSessionId, RecoverableSession, Room, Session,
    SessionToPersist,
};
use super::{Adapter, AdapterBuilder, AdapterContext, LocalAdapter};
use crate::cluster::{ClusterBridge, SingleNode};
use crate::config::RecoveryConfig;
use crate::errors::SocketError;
use crate::observability::metrics;
use crate::packet::{Packet, PacketKind};
use crate::store::{MemorySessionStore, SessionStore};

/// How often expired sessions are purged from the store.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Wall clock that follows tokio's clock, so paused-time tests see it move.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    origin: tokio::time::Instant,
    wall: DateTime<Utc>,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            wall: Utc::now(),
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }
}

/// Rooms of a disconnected session, used to decide what it missed.
#[derive(Debug, Clone)]
struct PendingSession {
    rooms: HashSet<Room>,
    disconnected_at: DateTime<Utc>,
}

type PendingSessions = Arc<Mutex<HashMap<PrivateSessionId, PendingSession>>>;

fn lock(pending: &PendingSessions) -> MutexGuard<'_, HashMap<PrivateSessionId, PendingSession>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `disconnected_at + window < now`
fn is_expired(disconnected_at: DateTime<Utc>, window: Duration, now: DateTime<Utc>) -> bool {
    match chrono::Duration::from_std(window) {
        Ok(window) => disconnected_at
            .checked_add_signed(window)
            .is_some_and(|deadline| deadline < now),
        Err(_) => false,
    }
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
}

/// Offset appended by the originating server of a forwarded broadcast.
fn forwarded_offset(packet: &Packet, opts: &BroadcastOptions) -> Option<String> {
    if !opts.flags.forwarded {
        return None;
    }
    packet.data.last().and_then(Value::as_str).map(str::to_string)
}

pub struct SessionAwareAdapter {
    inner: LocalAdapter,
    store: Arc<dyn SessionStore>,
    recovery: RecoveryConfig,
    clock: Clock,
    pending: PendingSessions,
    shutdown: CancellationToken,
}

impl SessionAwareAdapter {
    pub fn new(
        ctx: AdapterContext,
        cluster: Arc<dyn ClusterBridge>,
        store: Arc<dyn SessionStore>,
        recovery: RecoveryConfig,
    ) -> Self {
        Self {
            inner: LocalAdapter::new(ctx, cluster),
            store,
            recovery,
            clock: Clock::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    fn next_offset(&self) -> String {
        format!(
            "{}-{}",
            self.clock.now().timestamp_millis(),
            self.inner.context().next_id()
        )
    }

    /// Append `packet` to every live disconnected session it targets.
    async fn buffer_missed(&self, packet: &PersistedPacket) {
        let now = self.clock.now();
        let window = self.recovery.max_disconnection_duration;
        let targets: Vec<PrivateSessionId> = lock(&self.pending)
            .iter()
            .filter(|(_, s)| !is_expired(s.disconnected_at, window, now))
            .filter(|(_, s)| packet.opts.should_reach(&s.rooms))
            .map(|(pid, _)| pid.clone())
            .collect();

        if targets.is_empty() {
            return;
        }

        for pid in &targets {
            if let Err(e) = self.store.append_missed(pid, packet).await {
                metrics::record_session_event("error");
                warn!(
                    target: "roomcast.session",
                    nsp = %self.inner.context().nsp(),
                    error = %e,
                    "Failed to buffer missed packet"
                );
            }
        }
        metrics::record_missed_packets_buffered(targets.len());
    }
}

#[async_trait]
impl Adapter for SessionAwareAdapter {
    fn context(&self) -> &AdapterContext {
        self.inner.context()
    }

    fn registry(&self) -> &RoomRegistry {
        self.inner.registry()
    }

    fn cluster(&self) -> &Arc<dyn ClusterBridge> {
        self.inner.cluster()
    }

    /// Starts the periodic purge of expired sessions when a runtime is available.
    fn init(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }

        let store = self.store.clone();
        let pending = self.pending.clone();
        let clock = self.clock;
        let window = self.recovery.max_disconnection_duration;
        let shutdown = self.shutdown.clone();
        let nsp = self.inner.context().nsp().to_string();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(cutoff) = cutoff(clock.now(), window) else {
                            continue;
                        };
                        lock(&pending).retain(|_, s| s.disconnected_at >= cutoff);
                        match store.purge_expired(cutoff).await {
                            Ok(0) => {}
                            Ok(purged) => {
                                debug!(target: "roomcast.session", nsp = %nsp, purged, "Purged expired sessions");
                            }
                            Err(e) => {
                                warn!(target: "roomcast.session", nsp = %nsp, error = %e, "Session purge failed");
                            }
                        }
                    }
                }
            }
        });
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }

    async fn broadcast(&self, mut packet: Packet, opts: BroadcastOptions) -> Result<(), SocketError> {
        let recoverable =
            packet.kind == PacketKind::Event && packet.id.is_none() && !opts.flags.volatile;

        if recoverable {
            let offset = match forwarded_offset(&packet, &opts) {
                Some(offset) => offset,
                None => {
                    let offset = self.next_offset();
                    packet.data.push(Value::String(offset.clone()));
                    offset
                }
            };
            self.buffer_missed(&PersistedPacket {
                id: offset,
                emitted_at: self.clock.now(),
                data: packet.data.clone(),
                opts: opts.clone(),
            })
            .await;
        }

        self.inner.broadcast(packet, opts).await
    }

    #[instrument(skip_all, fields(nsp = %self.inner.context().nsp(), sid = %session.sid))]
    async fn persist_session(&self, session: SessionToPersist) {
        let disconnected_at = self.clock.now();
        let pid = session.pid.clone();

        lock(&self.pending).insert(
            pid.clone(),
            PendingSession {
                rooms: session.rooms.clone(),
                disconnected_at,
            },
        );

        let stored = RecoverableSession {
            session,
            disconnected_at,
            missed: Vec::new(),
        };
        match self
            .store
            .save(stored, self.recovery.max_disconnection_duration)
            .await
        {
            Ok(()) => {
                metrics::record_session_event("persisted");
                debug!(target: "roomcast.session", "Session persisted");
            }
            Err(e) => {
                lock(&self.pending).remove(&pid);
                metrics::record_session_event("error");
                warn!(target: "roomcast.session", error = %e, "Failed to persist session");
            }
        }
    }

    #[instrument(skip_all, fields(nsp = %self.inner.context().nsp()))]
    async fn restore_session(
        &self,
        pid: &PrivateSessionId,
        offset: &str,
    ) -> Result<Option<Session>, SocketError> {
        let started = tokio::time::Instant::now();
        lock(&self.pending).remove(pid);

        let Some(stored) = self.store.take(pid).await? else {
            metrics::record_session_event("missing");
            debug!(target: "roomcast.session", "No session to restore");
            return Ok(None);
        };

        if is_expired(
            stored.disconnected_at,
            self.recovery.max_disconnection_duration,
            self.clock.now(),
        ) {
            metrics::record_session_event("expired");
            debug!(target: "roomcast.session", sid = %stored.session.sid, "Session expired");
            return Ok(None);
        }

        let missed_packets: Vec<Vec<Value>> = stored
            .missed_after(offset)
            .into_iter()
            .map(|packet| packet.data)
            .collect();

        metrics::record_session_event("restored");
        metrics::record_session_restore_duration(started.elapsed());
        debug!(
            target: "roomcast.session",
            sid = %stored.session.sid,
            missed = missed_packets.len(),
            "Session restored"
        );

        Ok(Some(Session {
            session: stored.session,
            missed_packets,
        }))
    }
}

type StoreFactory = Arc<dyn Fn(&str) -> Arc<dyn SessionStore> + Send + Sync>;

/// Builds [`SessionAwareAdapter`]s, one session store per namespace.
#[derive(Clone)]
pub struct SessionAwareAdapterBuilder {
    recovery: RecoveryConfig,
    cluster: Arc<dyn ClusterBridge>,
    store_factory: StoreFactory,
}

impl SessionAwareAdapterBuilder {
    /// In-memory stores on a single node.
    pub fn new(recovery: RecoveryConfig) -> Self {
        Self {
            recovery,
            cluster: Arc::new(SingleNode),
            store_factory: Arc::new(|_| Arc::new(MemorySessionStore::new())),
        }
    }

    #[must_use]
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterBridge>) -> Self {
        self.cluster = cluster;
        self
    }

    /// Use `factory(nsp)` to create each namespace's store.
    #[must_use]
    pub fn with_store_factory(
        mut self,
        factory: impl Fn(&str) -> Arc<dyn SessionStore> + Send + Sync + 'static,
    ) -> Self {
        self.store_factory = Arc::new(factory);
        self
    }
}

impl AdapterBuilder for SessionAwareAdapterBuilder {
    fn build(&self, ctx: AdapterContext) -> Arc<dyn Adapter> {
        let store = (self.store_factory)(ctx.nsp());
        Arc::new(SessionAwareAdapter::new(
            ctx,
            self.cluster.clone(),
            store,
            self.recovery,
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_is_expired_boundary() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let window = Duration::from_millis(120_000);

        assert!(!is_expired(t0, window, t0 + chrono::Duration::seconds(119)));
        assert!(!is_expired(t0, window, t0 + chrono::Duration::seconds(120)));
        assert!(is_expired(t0, window, t0 + chrono::Duration::seconds(121)));
    }

    #[test]
    fn test_cutoff() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 2, 0).unwrap();
        assert_eq!(
            cutoff(now, Duration::from_secs(120)),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_forwarded_offset_only_for_forwarded_broadcasts() {
        let packet = Packet::event("/", "news", vec![Value::from("p1"), Value::from("1700-0")]);

        assert_eq!(forwarded_offset(&packet, &BroadcastOptions::default()), None);
        assert_eq!(
            forwarded_offset(&packet, &BroadcastOptions::default().into_forwarded()),
            Some("1700-0".to_string())
        );

        let bare = Packet::event("/", "news", vec![Value::from(7)]);
        assert_eq!(
            forwarded_offset(&bare, &BroadcastOptions::default().into_forwarded()),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let clock = Clock::new();
        let before = clock.now();
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.now() - before, chrono::Duration::seconds(90));
    }
}
