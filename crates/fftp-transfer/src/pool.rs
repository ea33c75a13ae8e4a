//! Connection pool keyed by session id.
//!
//! A connection is never shared by two transfers: every [`SessionLease`]
//! holds one connection exclusively until dropped. A session starts with
//! the connection the user opened; with a [`SessionFactory`] the pool may
//! open more, up to the per-session limit, so transfers on one session
//! can run side by side.
//!
//! Taking a connection is two steps: a [`Reservation`] claims one of the
//! session's slots, then [`Reservation::lease`] picks or opens the
//! connection. Every slot handed back bumps the [`SessionPool::releases`]
//! counter so a scheduler waiting on a saturated session can retry.

use async_trait::async_trait;
use fftp_core::{ConnectionConfig, RemoteError, RemoteResult, RemoteSession, SessionId};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{watch, Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore, TryAcquireError};

pub type SharedSession = Arc<Mutex<Box<dyn RemoteSession>>>;

/// Opens additional, not yet connected, sessions for a config.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, config: &ConnectionConfig) -> RemoteResult<Box<dyn RemoteSession>>;
}

struct PoolEntry {
    config: ConnectionConfig,
    permits: Arc<Semaphore>,
    lanes: Mutex<Vec<SharedSession>>,
    factory: Option<Arc<dyn SessionFactory>>,
}

/// Bumps the pool's release counter when dropped.
struct ReleaseSignal(Arc<watch::Sender<u64>>);

impl Drop for ReleaseSignal {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.wrapping_add(1));
    }
}

/// Exclusive use of one connection.
pub struct SessionLease {
    // field order is drop order: connection, then slot, then the signal
    guard: OwnedMutexGuard<Box<dyn RemoteSession>>,
    _permit: OwnedSemaphorePermit,
    _release: ReleaseSignal,
}

impl Deref for SessionLease {
    type Target = dyn RemoteSession;

    fn deref(&self) -> &Self::Target {
        &**self.guard
    }
}

impl DerefMut for SessionLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.guard
    }
}

/// A claimed connection slot of one session, not yet bound to a
/// connection.
pub struct Reservation {
    id: SessionId,
    entry: Arc<PoolEntry>,
    permit: OwnedSemaphorePermit,
    release: ReleaseSignal,
}

impl Reservation {
    pub fn session_id(&self) -> &str {
        &self.id
    }

    /// Take an idle connection of the session, or open one more through
    /// its factory.
    pub async fn lease(self) -> RemoteResult<SessionLease> {
        let Reservation {
            id,
            entry,
            permit,
            release,
        } = self;
        let mut lanes = entry.lanes.lock().await;
        for lane in lanes.iter() {
            if let Ok(guard) = lane.clone().try_lock_owned() {
                return Ok(SessionLease {
                    guard,
                    _permit: permit,
                    _release: release,
                });
            }
        }

        // Holding a permit while every lane is busy means there is room
        // for one more connection.
        let factory = entry
            .factory
            .clone()
            .ok_or_else(|| RemoteError::protocol(format!("No free connection for session {}", id)))?;
        log::debug!("Opening connection #{} for session {}", lanes.len() + 1, id);
        let mut session = factory.open(&entry.config).await?;
        session.connect().await?;
        let lane: SharedSession = Arc::new(Mutex::new(session));
        let guard = lane.clone().lock_owned().await;
        lanes.push(lane);
        Ok(SessionLease {
            guard,
            _permit: permit,
            _release: release,
        })
    }
}

pub struct SessionPool {
    sessions: StdMutex<HashMap<SessionId, Arc<PoolEntry>>>,
    releases: Arc<watch::Sender<u64>>,
}

impl Default for SessionPool {
    fn default() -> Self {
        Self {
            sessions: StdMutex::new(HashMap::new()),
            releases: Arc::new(watch::channel(0).0),
        }
    }
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Changes whenever a slot is handed back or a session goes away.
    pub fn releases(&self) -> watch::Receiver<u64> {
        self.releases.subscribe()
    }

    fn signal(&self) -> ReleaseSignal {
        ReleaseSignal(self.releases.clone())
    }

    fn closed(id: &str) -> RemoteError {
        RemoteError::not_connected().with_context(format!("session {} closed", id))
    }

    /// Register a session with its single connection.
    pub fn insert(&self, id: impl Into<SessionId>, session: Box<dyn RemoteSession>) {
        self.register(id.into(), session, None, 1);
    }

    /// Register a session that may grow to `max_connections` connections
    /// opened through `factory`.
    pub fn insert_with_factory(
        &self,
        id: impl Into<SessionId>,
        session: Box<dyn RemoteSession>,
        factory: Arc<dyn SessionFactory>,
        max_connections: usize,
    ) {
        self.register(id.into(), session, Some(factory), max_connections.max(1));
    }

    fn register(
        &self,
        id: SessionId,
        session: Box<dyn RemoteSession>,
        factory: Option<Arc<dyn SessionFactory>>,
        max_connections: usize,
    ) {
        let entry = Arc::new(PoolEntry {
            config: session.config().clone(),
            permits: Arc::new(Semaphore::new(max_connections)),
            lanes: Mutex::new(vec![Arc::new(Mutex::new(session))]),
            factory,
        });
        if let Ok(mut map) = self.sessions.lock() {
            if map.insert(id.clone(), entry).is_some() {
                log::warn!("Session {} re-registered; the previous connections are dropped", id);
            }
        }
    }

    fn entry(&self, id: &str) -> RemoteResult<Arc<PoolEntry>> {
        self.sessions
            .lock()
            .ok()
            .and_then(|m| m.get(id).cloned())
            .ok_or_else(|| RemoteError::not_connected().with_context(format!("session {}", id)))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entry(id).is_ok()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions
            .lock()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of open connections for `id`.
    pub async fn connection_count(&self, id: &str) -> usize {
        match self.entry(id) {
            Ok(entry) => entry.lanes.lock().await.len(),
            Err(_) => 0,
        }
    }

    /// Claim a slot of session `id` without waiting. `None` means every
    /// slot is taken; an unknown or closed session is an error.
    pub fn try_reserve(&self, id: &str) -> Option<RemoteResult<Reservation>> {
        let entry = match self.entry(id) {
            Ok(entry) => entry,
            Err(e) => return Some(Err(e)),
        };
        match entry.permits.clone().try_acquire_owned() {
            Ok(permit) => Some(Ok(Reservation {
                id: id.to_string(),
                entry,
                permit,
                release: self.signal(),
            })),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => Some(Err(Self::closed(id))),
        }
    }

    /// Wait for a slot of session `id`.
    pub async fn reserve(&self, id: &str) -> RemoteResult<Reservation> {
        let entry = self.entry(id)?;
        let permit = entry
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Self::closed(id))?;
        Ok(Reservation {
            id: id.to_string(),
            entry,
            permit,
            release: self.signal(),
        })
    }

    /// Wait for a free connection of session `id` and take it.
    pub async fn acquire(&self, id: &str) -> RemoteResult<SessionLease> {
        self.reserve(id).await?.lease().await
    }

    /// Drop session `id`, disconnecting each of its connections once any
    /// transfer holding it lets go.
    pub async fn remove(&self, id: &str) -> bool {
        let entry = match self.sessions.lock() {
            Ok(mut map) => map.remove(id),
            Err(_) => None,
        };
        let Some(entry) = entry else {
            return false;
        };
        entry.permits.close();
        self.releases.send_modify(|n| *n = n.wrapping_add(1));
        let lanes: Vec<SharedSession> = entry.lanes.lock().await.drain(..).collect();
        for lane in lanes {
            lane.lock().await.disconnect().await;
        }
        log::info!("Session {} closed", id);
        true
    }

    pub async fn disconnect_all(&self) {
        for id in self.ids() {
            self.remove(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fftp_core::memory::MemoryServer;
    use fftp_core::Protocol;
    use std::time::Duration;

    struct MemoryFactory(MemoryServer);

    #[async_trait]
    impl SessionFactory for MemoryFactory {
        async fn open(&self, config: &ConnectionConfig) -> RemoteResult<Box<dyn RemoteSession>> {
            Ok(Box::new(self.0.session(config.clone())))
        }
    }

    fn cfg() -> ConnectionConfig {
        ConnectionConfig::new(Protocol::Sftp, "memory", "tester")
    }

    #[tokio::test]
    async fn single_connection_is_exclusive() {
        let server = MemoryServer::new();
        let pool = SessionPool::new();
        let mut s = server.session(cfg());
        s.connect().await.unwrap();
        pool.insert("s1", Box::new(s));

        let lease = pool.acquire("s1").await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(50), pool.acquire("s1")).await;
        assert!(second.is_err(), "second lease must wait");
        drop(lease);
        assert!(pool.acquire("s1").await.is_ok());
    }

    #[tokio::test]
    async fn factory_grows_up_to_the_limit() {
        let server = MemoryServer::new();
        let pool = SessionPool::new();
        let mut s = server.session(cfg());
        s.connect().await.unwrap();
        pool.insert_with_factory("s1", Box::new(s), Arc::new(MemoryFactory(server.clone())), 2);

        let a = pool.acquire("s1").await.unwrap();
        let mut b = pool.acquire("s1").await.unwrap();
        assert!(b.is_connected().await);
        assert_eq!(pool.connection_count("s1").await, 2);
        assert_eq!(server.connect_count(), 2);

        let third = tokio::time::timeout(Duration::from_millis(50), pool.acquire("s1")).await;
        assert!(third.is_err());
        drop(a);
        drop(b);
        assert_eq!(pool.connection_count("s1").await, 2);
    }

    #[tokio::test]
    async fn unknown_and_removed_sessions() {
        let server = MemoryServer::new();
        let pool = SessionPool::new();
        assert!(pool.acquire("nope").await.is_err());

        pool.insert("s1", Box::new(server.session(cfg())));
        assert!(pool.contains("s1"));
        assert!(pool.remove("s1").await);
        assert!(!pool.remove("s1").await);
        assert!(pool.acquire("s1").await.is_err());
    }

    #[tokio::test]
    async fn try_reserve_reports_a_saturated_session() {
        let server = MemoryServer::new();
        let pool = SessionPool::new();
        pool.insert("s1", Box::new(server.session(cfg())));
        let mut releases = pool.releases();

        let held = pool.try_reserve("s1").unwrap().unwrap();
        assert_eq!(held.session_id(), "s1");
        assert!(pool.try_reserve("s1").is_none());
        assert!(matches!(pool.try_reserve("nope"), Some(Err(_))));

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), releases.changed())
            .await
            .unwrap()
            .unwrap();
        let lease = pool.try_reserve("s1").unwrap().unwrap().lease().await.unwrap();
        drop(lease);
        assert!(pool.try_reserve("s1").is_some());
    }
}
