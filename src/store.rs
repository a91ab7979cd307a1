use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::session::CallSession;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Opaque handle for one accepted socket. Session logic never sees the
/// transport object itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type SharedSession = Arc<Mutex<CallSession>>;

pub struct InnerSessionStore {
    sessions: RwLock<BTreeMap<ConnectionId, SharedSession>>,
}

/// Registry of live call sessions keyed by connection.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<InnerSessionStore>,
}

impl Debug for SessionStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish()
    }
}

impl Deref for SessionStore {
    type Target = InnerSessionStore;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let inner = InnerSessionStore {
            sessions: RwLock::new(BTreeMap::new()),
        };
        SessionStore { inner: Arc::new(inner) }
    }

    /// Registers `session` for `id`. A connection carries at most one
    /// session, so an occupied slot hands the session back untouched.
    pub async fn insert(
        &self,
        id: ConnectionId,
        session: CallSession,
    ) -> Result<SharedSession, CallSession> {
        let mut map = self.sessions.write().await;
        if map.contains_key(&id) {
            return Err(session);
        }
        let shared = Arc::new(Mutex::new(session));
        map.insert(id, shared.clone());
        Ok(shared)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<SharedSession> {
        let map = self.sessions.read().await;
        map.get(&id).cloned()
    }

    pub async fn remove(&self, id: ConnectionId) -> Option<SharedSession> {
        let mut map = self.sessions.write().await;
        map.remove(&id)
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
