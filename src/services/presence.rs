use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Map};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    conversations::ConversationStore,
    sessions::{PresenceChange, SessionRegistry},
    typing::TypingCoordinator,
};
use crate::{
    error::AppResult,
    models::{PresenceStatus, ServerEvent, User},
    storage::Store,
};

/// Turns session edges into presence: the in-memory status map, the persisted
/// `isOnline`/`lastSeen` fields, and `user_online`/`user_offline` events to contacts.
pub struct PresenceTracker {
    statuses: DashMap<Uuid, PresenceStatus>,
    sessions: Arc<SessionRegistry>,
    conversations: ConversationStore,
    typing: Arc<TypingCoordinator>,
    store: Store,
}

impl PresenceTracker {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        conversations: ConversationStore,
        typing: Arc<TypingCoordinator>,
        store: Store,
    ) -> Self {
        Self {
            statuses: DashMap::new(),
            sessions,
            conversations,
            typing,
            store,
        }
    }

    /// Consume edges until the registry is dropped. Edges are applied in order.
    pub async fn run(self: Arc<Self>, mut changes: mpsc::UnboundedReceiver<PresenceChange>) {
        while let Some(change) = changes.recv().await {
            self.apply(change).await;
        }
        tracing::info!("Presence tracker stopped");
    }

    pub async fn apply(&self, change: PresenceChange) {
        let PresenceChange { user_id, online, at } = change;

        let status = if online {
            PresenceStatus::online()
        } else {
            self.typing.clear_user(user_id);
            PresenceStatus::offline(Some(at))
        };
        self.statuses.insert(user_id, status);

        let mut fields = Map::new();
        fields.insert("isOnline".to_string(), json!(online));
        if !online {
            fields.insert("lastSeen".to_string(), json!(at));
        }
        if let Err(e) = self.store.patch::<User>(user_id, fields).await {
            tracing::warn!(%user_id, online, error = %e, "Failed to persist presence");
        }

        let event = Arc::new(if online {
            ServerEvent::UserOnline { user_id }
        } else {
            ServerEvent::UserOffline {
                user_id,
                last_seen: at,
            }
        });

        match self.conversations.contacts_of(user_id).await {
            Ok(contacts) => {
                for contact in contacts {
                    self.sessions.send_to_user(contact, &event);
                }
            }
            Err(e) => tracing::warn!(%user_id, error = %e, "Failed to resolve contacts for presence"),
        }

        tracing::info!(%user_id, online, "Presence changed");
    }

    /// Live view first; falls back to the persisted last-seen time.
    pub async fn status_of(&self, user_id: Uuid) -> AppResult<PresenceStatus> {
        if self.sessions.is_online(user_id) {
            return Ok(PresenceStatus::online());
        }
        if let Some(status) = self.statuses.get(&user_id) {
            if !status.online {
                return Ok(*status);
            }
        }
        let last_seen = self
            .store
            .get::<User>(user_id)
            .await?
            .and_then(|user| user.last_seen);
        Ok(PresenceStatus::offline(last_seen))
    }

    pub async fn statuses_of(&self, user_ids: &[Uuid]) -> AppResult<Vec<(Uuid, PresenceStatus)>> {
        let mut statuses = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            statuses.push((*user_id, self.status_of(*user_id).await?));
        }
        Ok(statuses)
    }
}
