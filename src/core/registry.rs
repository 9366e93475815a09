use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::RngCore;

use super::session::{Session, SessionId};
use crate::net::peer::PeerHandle;

/// A single entry of `Registry::snapshot()` — mirrors the wire shape of a
/// `poll` response element (§4.6).
pub struct SessionSnapshot {
    pub session_id: String,
    pub connected: bool,
}

/// Process-wide directory of live sessions, keyed by `SessionID`, plus the
/// set of subscribed management peers. Generalizes the teacher's
/// `SessionManager` (`session_manager.rs`), which already uses a
/// `DashMap` for exactly this kind of lock-free-read session directory;
/// here the map holds full `Session` objects rather than status snapshots,
/// and gains a second map for management subscribers.
pub struct Registry {
    sessions: DashMap<SessionId, Arc<Session>>,
    mgmt_subscribers: DashMap<u64, PeerHandle>,
    next_subscriber_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            mgmt_subscribers: DashMap::new(),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Repeatedly samples a fresh 4-byte/8-hex-char SessionID until one is
    /// not already in use.
    pub fn new_session_id(&self) -> SessionId {
        loop {
            let mut bytes = [0u8; 4];
            rand::thread_rng().fill_bytes(&mut bytes);
            let id = hex::encode(bytes);
            if !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn register(&self, session: Arc<Session>) {
        self.sessions.insert(session.id().to_string(), session);
    }

    pub fn unregister(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Returns an opaque token identifying this subscription, to be passed
    /// back to `unsubscribe_mgmt`.
    pub fn subscribe_mgmt(&self, handle: PeerHandle) -> u64 {
        let token = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.mgmt_subscribers.insert(token, handle);
        token
    }

    pub fn unsubscribe_mgmt(&self, token: u64) {
        self.mgmt_subscribers.remove(&token);
    }

    /// Lists every session with `shellOpen=true`. `Session::shell_open`
    /// only goes false once the reaper has already removed the entry from
    /// `sessions` (see `reap` below), so every entry observed here already
    /// satisfies the invariant.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| SessionSnapshot {
                session_id: entry.key().clone(),
                connected: entry.value().peer_attached(),
            })
            .collect()
    }

    /// The `{"response":"poll","result":[...]}` payload shared by both an
    /// on-demand `poll` reply (`ManagementChannel`) and an unsolicited
    /// broadcast — per §5, clients must not rely on distinguishing them.
    pub fn poll_payload(&self) -> String {
        poll_response_json(&self.snapshot())
    }

    /// Sends a poll-shaped message to every management subscriber.
    /// Failures to individual subscribers are swallowed (§4.4) — a dead
    /// subscriber is pruned only when its `ManagementChannel::serve` loop
    /// returns and calls `unsubscribe_mgmt`.
    pub fn broadcast_state_change(&self) {
        let payload = self.poll_payload();
        for entry in self.mgmt_subscribers.iter() {
            let _ = entry.value().send_text(payload.clone());
        }
    }

    /// Invoked exactly once per session by its reaper task: removes the
    /// session from the directory, then broadcasts the resulting state
    /// change, so subscribers never observe a reaped session in a
    /// broadcast (§8).
    pub async fn reap(&self, id: &str) {
        self.sessions.remove(id);
        self.broadcast_state_change();
    }
}

fn poll_response_json(snapshot: &[SessionSnapshot]) -> String {
    let result: Vec<serde_json::Value> = snapshot
        .iter()
        .map(|s| serde_json::json!({"sessionID": s.session_id, "connected": s.connected}))
        .collect();
    serde_json::json!({"response": "poll", "result": result}).to_string()
}
