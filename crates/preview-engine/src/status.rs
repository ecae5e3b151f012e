use preview_proto::protocol::{GroupId, SessionSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// Read-side view of every session, published by the engine loop after each
/// transition.  Readers never touch the sessions themselves.
#[derive(Clone)]
pub struct StatusBoard {
    sessions: Arc<RwLock<HashMap<GroupId, SessionSnapshot>>>,
    rev_tx: Arc<watch::Sender<u64>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (rev_tx, _) = watch::channel(0);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            rev_tx: Arc::new(rev_tx),
        }
    }

    pub async fn publish(&self, snapshot: SessionSnapshot) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(&snapshot.group_id) == Some(&snapshot) {
            return;
        }
        sessions.insert(snapshot.group_id, snapshot);
        self.bump();
    }

    pub async fn remove(&self, group_id: GroupId) {
        if self.sessions.write().await.remove(&group_id).is_some() {
            self.bump();
        }
    }

    pub async fn get(&self, group_id: GroupId) -> Option<SessionSnapshot> {
        self.sessions.read().await.get(&group_id).cloned()
    }

    /// All sessions, ordered by group id.
    pub async fn all(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<_> = self.sessions.read().await.values().cloned().collect();
        all.sort_by_key(|s| s.group_id);
        all
    }

    /// Bumped on every change.
    pub fn rev(&self) -> u64 {
        *self.rev_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.rev_tx.subscribe()
    }

    fn bump(&self) {
        self.rev_tx.send_modify(|rev| *rev += 1);
    }
}
