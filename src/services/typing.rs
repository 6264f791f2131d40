//! Ephemeral typing indicators with a TTL.
//!
//! Only transitions are broadcast: idle to typing, and typing to idle (explicit
//! stop, expiry, or the user going offline). Repeated "typing" signals just
//! push the deadline out.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::time::Instant;
use uuid::Uuid;

use super::{conversations::ConversationStore, sessions::SessionRegistry};
use crate::{error::AppResult, models::ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingState {
    Idle,
    TypingUntil(Instant),
}

struct TypingEntry {
    until: Instant,
    recipients: Vec<Uuid>,
}

pub struct TypingCoordinator {
    entries: DashMap<(Uuid, Uuid), TypingEntry>,
    conversations: ConversationStore,
    sessions: Arc<SessionRegistry>,
    ttl: Duration,
}

impl TypingCoordinator {
    pub fn new(conversations: ConversationStore, sessions: Arc<SessionRegistry>, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            conversations,
            sessions,
            ttl,
        }
    }

    /// Returns whether the call caused a broadcast.
    pub async fn set_typing(&self, conversation_id: Uuid, user_id: Uuid, is_typing: bool) -> AppResult<bool> {
        let key = (conversation_id, user_id);

        if !is_typing {
            return Ok(match self.entries.entry(key) {
                Entry::Occupied(entry) => {
                    self.broadcast(conversation_id, user_id, &entry.get().recipients, false);
                    entry.remove();
                    true
                }
                Entry::Vacant(_) => false,
            });
        }

        let until = Instant::now() + self.ttl;
        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.until = until;
            return Ok(false);
        }

        let conversation = self
            .conversations
            .get_for_participant(conversation_id, user_id)
            .await?;
        let recipients: Vec<Uuid> = conversation.other_participants(user_id).collect();

        Ok(match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().until = until;
                false
            }
            Entry::Vacant(slot) => {
                self.broadcast(conversation_id, user_id, &recipients, true);
                slot.insert(TypingEntry { until, recipients });
                true
            }
        })
    }

    pub fn state(&self, conversation_id: Uuid, user_id: Uuid) -> TypingState {
        match self.entries.get(&(conversation_id, user_id)) {
            Some(entry) if entry.until > Instant::now() => TypingState::TypingUntil(entry.until),
            _ => TypingState::Idle,
        }
    }

    /// Expire stale indicators, broadcasting a stop for each. Returns how many expired.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(Uuid, Uuid)> = self
            .entries
            .iter()
            .filter(|entry| entry.until <= now)
            .map(|entry| *entry.key())
            .collect();

        expired
            .into_iter()
            .filter(|key| self.stop_if(*key, |entry| entry.until <= now))
            .count()
    }

    /// Stop every indicator of a user, e.g. once their last session is gone.
    pub fn clear_user(&self, user_id: Uuid) -> usize {
        let keys: Vec<(Uuid, Uuid)> = self
            .entries
            .iter()
            .filter(|entry| entry.key().1 == user_id)
            .map(|entry| *entry.key())
            .collect();

        keys.into_iter().filter(|key| self.stop_if(*key, |_| true)).count()
    }

    fn stop_if(&self, key: (Uuid, Uuid), predicate: impl Fn(&TypingEntry) -> bool) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(entry) if predicate(entry.get()) => {
                self.broadcast(key.0, key.1, &entry.get().recipients, false);
                entry.remove();
                true
            }
            _ => false,
        }
    }

    fn broadcast(&self, conversation_id: Uuid, user_id: Uuid, recipients: &[Uuid], is_typing: bool) {
        let event = Arc::new(ServerEvent::Typing {
            conversation_id,
            user_id,
            is_typing,
        });
        for recipient in recipients {
            self.sessions.send_to_user(*recipient, &event);
        }
    }

    pub async fn run_sweeper(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let expired = self.sweep();
            if expired > 0 {
                tracing::debug!(expired, "Typing indicators expired");
            }
        }
    }
}
