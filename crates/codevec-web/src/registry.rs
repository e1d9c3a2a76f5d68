//! Bookkeeping of which client connections are attached to which session.
//!
//! Delivery never goes through the registry; every connection owns its own
//! subscriber. The registry answers "who is listening" and guarantees no
//! connection outlives its teardown in the books.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use tracing::debug;
use uuid::Uuid;

/// Identity of one client connection.
pub type ConnectionId = Uuid;

/// What the registry remembers about an attached connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Authenticated subject, when the token carried one.
    pub subject: Option<String>,
    pub attached_at: Instant,
}

impl ConnectionInfo {
    pub fn new(subject: Option<String>) -> Self {
        Self {
            subject,
            attached_at: Instant::now(),
        }
    }
}

/// Session to attached-connections map, shared by every connection handler.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    sessions: Mutex<HashMap<String, HashMap<ConnectionId, ConnectionInfo>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, HashMap<ConnectionId, ConnectionInfo>>> {
        // A panic while holding the lock cannot leave the map half-updated:
        // every mutation is a single insert or remove.
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, session_id: &str, connection: ConnectionId, info: ConnectionInfo) {
        let mut sessions = self.sessions();
        let listeners = sessions.entry(session_id.to_string()).or_default();
        listeners.insert(connection, info);
        debug!(
            session_id,
            connection_id = %connection,
            listeners = listeners.len(),
            "Registered connection"
        );
    }

    /// Remove a connection. Returns false when it was not registered, so
    /// calling this twice is harmless.
    pub fn deregister(&self, session_id: &str, connection: ConnectionId) -> bool {
        let mut sessions = self.sessions();
        let Some(listeners) = sessions.get_mut(session_id) else {
            return false;
        };
        let removed = listeners.remove(&connection).is_some();
        let remaining = listeners.len();
        if remaining == 0 {
            sessions.remove(session_id);
        }
        if removed {
            debug!(session_id, connection_id = %connection, remaining, "Deregistered connection");
        }
        removed
    }

    pub fn listener_count(&self, session_id: &str) -> usize {
        self.sessions().get(session_id).map_or(0, HashMap::len)
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    pub fn total_connections(&self) -> usize {
        self.sessions().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Listener counts per session, sorted by session id.
    pub fn snapshot(&self) -> BTreeMap<String, usize> {
        self.sessions()
            .iter()
            .map(|(session, listeners)| (session.clone(), listeners.len()))
            .collect()
    }
}
