//! Session table and reaper
//!
//! A session couples one [`SessionId`] with a live upstream connection and
//! a downstream byte buffer. Sessions are created lazily: the first query
//! naming an unknown id dials the upstream target inside the table's write
//! critical section, so concurrent queries for the same id produce exactly
//! one dial. A dial failure creates no entry.
//!
//! Destruction is centralized in the table: the reaper removes sessions
//! whose `last_seen` is older than the idle timeout and sessions a handler
//! marked broken after a permanent upstream error. Dropping the session's
//! boxed stream closes the socket, which therefore happens exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dial::{BoxedUpstream, UpstreamDialer};
use crate::codec::SessionId;
use crate::error::TunnelResult;

/// Socket and buffer state guarded by the session lock.
///
/// The lock is held for the whole of one query's handling (decode, write
/// upstream, harvest downstream, pack the answer), serializing concurrent
/// queries that address the same session.
#[derive(Debug)]
pub struct SessionIo {
    /// Connection to the upstream target.
    pub stream: BoxedUpstream,
    /// Bytes read from the target but not yet shipped in an answer.
    pub down: BytesMut,
}

/// One live tunnel session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    io: Mutex<SessionIo>,
    last_seen: parking_lot::Mutex<Instant>,
    broken: AtomicBool,
}

impl Session {
    fn new(id: SessionId, stream: BoxedUpstream) -> Self {
        Self {
            id,
            io: Mutex::new(SessionIo {
                stream,
                down: BytesMut::new(),
            }),
            last_seen: parking_lot::Mutex::new(Instant::now()),
            broken: AtomicBool::new(false),
        }
    }

    /// The session's identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Acquire the socket+buffer lock.
    pub async fn lock_io(&self) -> MutexGuard<'_, SessionIo> {
        self.io.lock().await
    }

    /// Refresh the activity timestamp.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// How long this session has been idle.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Flag the session for destruction after a permanent upstream error.
    ///
    /// The handler never removes table entries inline; the reaper collects
    /// broken sessions on its next scan.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Relaxed);
    }

    /// Whether the session has been marked for destruction.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
    }
}

/// Counters for session lifecycle events.
#[derive(Debug, Default)]
pub struct SessionTableStats {
    sessions_opened: AtomicU64,
    dial_failures: AtomicU64,
    sessions_evicted: AtomicU64,
}

impl SessionTableStats {
    /// Sessions created (successful dials).
    #[must_use]
    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    /// Failed dial attempts (no session created).
    #[must_use]
    pub fn dial_failures(&self) -> u64 {
        self.dial_failures.load(Ordering::Relaxed)
    }

    /// Sessions destroyed by the reaper or shutdown.
    #[must_use]
    pub fn sessions_evicted(&self) -> u64 {
        self.sessions_evicted.load(Ordering::Relaxed)
    }
}

/// Mapping from [`SessionId`] to live [`Session`].
///
/// Lookup takes the read lock and never blocks on I/O. Insertion happens
/// only inside the write critical section that also performs the initial
/// dial, which is what makes "at most one session, dialed exactly once"
/// hold under concurrent queries.
pub struct SessionTable {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    dialer: Arc<dyn UpstreamDialer>,
    idle_timeout: Duration,
    stats: SessionTableStats,
}

impl SessionTable {
    /// Create a table whose sessions connect through `dialer` and expire
    /// after `idle_timeout` without queries.
    #[must_use]
    pub fn new(dialer: Arc<dyn UpstreamDialer>, idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            dialer,
            idle_timeout,
            stats: SessionTableStats::default(),
        }
    }

    /// Look up an existing session without creating one.
    pub async fn lookup(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Look up the session for `id`, dialing the upstream target to create
    /// it on first use.
    ///
    /// # Errors
    ///
    /// Propagates the dial error; the table is left without an entry for
    /// `id` so a later query retries the dial.
    pub async fn get_or_dial(&self, id: SessionId) -> TunnelResult<Arc<Session>> {
        if let Some(session) = self.lookup(id).await {
            return Ok(session);
        }

        let mut sessions = self.sessions.write().await;
        // Raced with another query for the same id while waiting for the
        // write lock.
        if let Some(session) = sessions.get(&id) {
            return Ok(Arc::clone(session));
        }

        let stream = match self.dialer.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        info!(session = %id, target = self.dialer.target(), "session opened");
        self.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);

        let session = Arc::new(Session::new(id, stream));
        sessions.insert(id, Arc::clone(&session));
        Ok(session)
    }

    /// Remove one session; returns whether an entry existed.
    pub async fn remove(&self, id: SessionId) -> bool {
        let removed = self.sessions.write().await.remove(&id).is_some();
        if removed {
            self.stats.sessions_evicted.fetch_add(1, Ordering::Relaxed);
            debug!(session = %id, "session removed");
        }
        removed
    }

    /// Destroy sessions that are idle past the timeout or marked broken.
    ///
    /// Returns the number of sessions evicted.
    pub async fn evict_expired(&self) -> usize {
        let expired: Vec<SessionId> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.is_broken() || s.idle_for() > self.idle_timeout)
                .map(|s| s.id())
                .collect()
        };

        if expired.is_empty() {
            return 0;
        }

        let mut sessions = self.sessions.write().await;
        let mut evicted = 0;
        for id in expired {
            // Re-check under the write lock: a query may have touched the
            // session while the candidate list was being built.
            let Some(session) = sessions.get(&id) else {
                continue;
            };
            let broken = session.is_broken();
            if !broken && session.idle_for() <= self.idle_timeout {
                continue;
            }
            sessions.remove(&id);
            evicted += 1;
            self.stats.sessions_evicted.fetch_add(1, Ordering::Relaxed);
            if broken {
                warn!(session = %id, "evicted broken session");
            } else {
                info!(session = %id, "evicted idle session");
            }
        }
        evicted
    }

    /// Destroy every session (server shutdown).
    pub async fn clear(&self) {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        sessions.clear();
        if count > 0 {
            self.stats
                .sessions_evicted
                .fetch_add(count as u64, Ordering::Relaxed);
            info!(count, "evicted all sessions on shutdown");
        }
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the table is empty.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Lifecycle counters.
    #[must_use]
    pub fn stats(&self) -> &SessionTableStats {
        &self.stats
    }
}

/// Spawn the background reaper scanning `table` every `cadence`.
///
/// The task runs until aborted; the server aborts it on shutdown and then
/// clears the table itself.
pub fn spawn_reaper(table: Arc<SessionTable>, cadence: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cadence);
        // The first tick fires immediately; skip it so a freshly started
        // server does not scan an empty table.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = table.evict_expired().await;
            if evicted > 0 {
                debug!(evicted, "reaper pass complete");
            }
        }
    })
}
