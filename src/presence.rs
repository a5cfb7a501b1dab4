use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// In-memory presence table: user id -> live connection ids.
///
/// A user is online iff their set is non-empty. The table lives for the
/// process lifetime only and is rebuilt empty on restart; callers never
/// see the raw map, only the operations below, so a shared-store
/// implementation could be swapped in without touching call sites.
pub struct Presence {
    conns: Mutex<HashMap<String, HashSet<Uuid>>>,
}

impl Presence {
    pub fn new() -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Register a connection for a user.
    pub fn connect(&self, user_id: &str, conn_id: Uuid) {
        let mut guard = self.conns.lock();
        guard.entry(user_id.to_string()).or_default().insert(conn_id);
    }

    /// Deregister a connection; the user entry is removed once its last
    /// connection is gone.
    pub fn disconnect(&self, user_id: &str, conn_id: Uuid) {
        let mut guard = self.conns.lock();
        if let Some(set) = guard.get_mut(user_id) {
            set.remove(&conn_id);
            if set.is_empty() {
                guard.remove(user_id);
            }
        }
    }

    /// Sorted list of user ids currently holding at least one connection.
    pub fn snapshot(&self) -> Vec<String> {
        let guard = self.conns.lock();
        let mut ids: Vec<String> = guard.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.conns.lock().contains_key(user_id)
    }
}

impl Default for Presence {
    fn default() -> Self {
        Self::new()
    }
}
