//! Live connections per user.
//!
//! The registry is the only owner of session state. Other components read it
//! through lookups or push events through it; they never touch the maps.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::models::ServerEvent;

pub type SessionId = Uuid;
pub type EventSender = mpsc::Sender<Arc<ServerEvent>>;

/// Emitted when a user gains their first session or loses their last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: Uuid,
    pub online: bool,
    pub at: DateTime<Utc>,
}

struct SessionHandle {
    sender: EventSender,
    connected_at: DateTime<Utc>,
}

pub struct SessionRegistry {
    by_user: DashMap<Uuid, HashMap<SessionId, SessionHandle>>,
    by_session: DashMap<SessionId, Uuid>,
    presence: mpsc::UnboundedSender<PresenceChange>,
}

impl SessionRegistry {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PresenceChange>) {
        let (presence, rx) = mpsc::unbounded_channel();
        let registry = Self {
            by_user: DashMap::new(),
            by_session: DashMap::new(),
            presence,
        };
        (registry, rx)
    }

    /// Register a new session and return a guard that unregisters it on drop.
    pub fn connect(self: &Arc<Self>, user_id: Uuid, sender: EventSender) -> SessionGuard {
        let session_id = Uuid::new_v4();
        self.register(user_id, session_id, sender);
        SessionGuard {
            registry: self.clone(),
            session_id,
        }
    }

    pub fn register(&self, user_id: Uuid, session_id: SessionId, sender: EventSender) {
        let handle = SessionHandle {
            sender,
            connected_at: Utc::now(),
        };

        // The user's entry stays locked while the edge is detected and emitted,
        // so concurrent register/unregister calls observe each 0↔1 edge once.
        let mut sessions = self.by_user.entry(user_id).or_default();
        let first = sessions.is_empty();
        sessions.insert(session_id, handle);
        self.by_session.insert(session_id, user_id);
        if first {
            self.emit(user_id, true);
        }
        drop(sessions);

        tracing::info!(%user_id, %session_id, "Session registered");
    }

    /// Remove a session. Unknown ids are ignored.
    pub fn unregister(&self, session_id: SessionId) {
        let Some((_, user_id)) = self.by_session.remove(&session_id) else {
            return;
        };

        if let Entry::Occupied(mut sessions) = self.by_user.entry(user_id) {
            sessions.get_mut().remove(&session_id);
            if sessions.get().is_empty() {
                sessions.remove();
                self.emit(user_id, false);
            }
        }

        tracing::info!(%user_id, %session_id, "Session unregistered");
    }

    fn emit(&self, user_id: Uuid, online: bool) {
        let change = PresenceChange {
            user_id,
            online,
            at: Utc::now(),
        };
        if self.presence.send(change).is_err() {
            tracing::warn!(%user_id, online, "Presence tracker is not listening");
        }
    }

    pub fn sessions_for(&self, user_id: Uuid) -> Vec<SessionId> {
        self.by_user
            .get(&user_id)
            .map(|sessions| sessions.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.by_user
            .get(&user_id)
            .map(|sessions| !sessions.is_empty())
            .unwrap_or(false)
    }

    pub fn owner_of(&self, session_id: SessionId) -> Option<Uuid> {
        self.by_session.get(&session_id).map(|user| *user)
    }

    pub fn connected_at(&self, session_id: SessionId) -> Option<DateTime<Utc>> {
        let user_id = self.owner_of(session_id)?;
        let sessions = self.by_user.get(&user_id)?;
        sessions.get(&session_id).map(|handle| handle.connected_at)
    }

    /// Best-effort push to every session of a user. Returns how many sessions
    /// accepted the event; full or closed queues are skipped.
    pub fn send_to_user(&self, user_id: Uuid, event: &Arc<ServerEvent>) -> usize {
        let Some(sessions) = self.by_user.get(&user_id) else {
            return 0;
        };

        sessions
            .iter()
            .filter(|(session_id, handle)| deliver(**session_id, &handle.sender, event))
            .count()
    }

    pub fn send_to_session(&self, session_id: SessionId, event: &Arc<ServerEvent>) -> bool {
        let Some(user_id) = self.owner_of(session_id) else {
            return false;
        };
        self.by_user
            .get(&user_id)
            .and_then(|sessions| {
                sessions
                    .get(&session_id)
                    .map(|handle| deliver(session_id, &handle.sender, event))
            })
            .unwrap_or(false)
    }
}

fn deliver(session_id: SessionId, sender: &EventSender, event: &Arc<ServerEvent>) -> bool {
    match sender.try_send(event.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!(%session_id, event = event.name(), "Session queue full, dropping event");
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(%session_id, event = event.name(), "Session closed, dropping event");
            false
        }
    }
}

/// Keeps a session registered for as long as it is alive.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
}

impl SessionGuard {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (Arc<SessionRegistry>, mpsc::UnboundedReceiver<PresenceChange>) {
        let (registry, rx) = SessionRegistry::new();
        (Arc::new(registry), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PresenceChange>) -> Vec<bool> {
        let mut edges = Vec::new();
        while let Ok(change) = rx.try_recv() {
            edges.push(change.online);
        }
        edges
    }

    #[test]
    fn test_presence_edges_only_on_first_and_last_session() {
        let (registry, mut rx) = registry();
        let user = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(8);

        let phone = registry.connect(user, tx.clone());
        let laptop = registry.connect(user, tx);
        assert!(registry.is_online(user));
        assert_eq!(registry.sessions_for(user).len(), 2);

        drop(phone);
        assert!(registry.is_online(user));
        drop(laptop);
        assert!(!registry.is_online(user));
        assert!(registry.sessions_for(user).is_empty());

        assert_eq!(drain(&mut rx), vec![true, false]);
    }

    #[test]
    fn test_unregister_unknown_session_is_noop() {
        let (registry, mut rx) = registry();
        let user = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(8);
        let session = Uuid::new_v4();

        registry.register(user, session, tx);
        registry.unregister(session);
        registry.unregister(session);
        registry.unregister(Uuid::new_v4());

        assert_eq!(drain(&mut rx), vec![true, false]);
    }

    #[tokio::test]
    async fn test_fan_out_skips_full_queues() {
        let (registry, _presence) = registry();
        let user = Uuid::new_v4();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);

        let _slow = registry.connect(user, slow_tx);
        let _fast = registry.connect(user, fast_tx);

        let event = Arc::new(ServerEvent::Pong);
        assert_eq!(registry.send_to_user(user, &event), 2);
        // The slow session has not drained its single slot.
        assert_eq!(registry.send_to_user(user, &event), 1);

        assert!(fast_rx.recv().await.is_some());
        assert!(fast_rx.recv().await.is_some());
        assert_eq!(registry.send_to_user(Uuid::new_v4(), &event), 0);
    }

    #[tokio::test]
    async fn test_send_to_single_session() {
        let (registry, _presence) = registry();
        let user = Uuid::new_v4();
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);

        let a = registry.connect(user, a_tx);
        let _b = registry.connect(user, b_tx);
        assert_eq!(registry.owner_of(a.session_id()), Some(user));
        assert!(registry.connected_at(a.session_id()).is_some());

        assert!(registry.send_to_session(a.session_id(), &Arc::new(ServerEvent::Pong)));
        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_err());

        let gone = a.session_id();
        drop(a);
        assert!(!registry.send_to_session(gone, &Arc::new(ServerEvent::Pong)));
        assert!(registry.connected_at(gone).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_connects_emit_alternating_edges() {
        let (registry, mut rx) = registry();
        let user = Uuid::new_v4();

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::channel(1);
                let guard = registry.connect(user, tx);
                tokio::task::yield_now().await;
                drop(guard);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let edges = drain(&mut rx);
        assert!(!edges.is_empty());
        assert_eq!(edges.first(), Some(&true));
        assert_eq!(edges.last(), Some(&false));
        assert!(edges.windows(2).all(|pair| pair[0] != pair[1]));
        assert!(!registry.is_online(user));
    }
}
