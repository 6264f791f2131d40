use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{actors::ConversationActors, sessions::SessionRegistry};
use crate::{
    error::{AppError, AppResult},
    models::{Conversation, Coverage, DeliveryRecord, Message, MessageState, SeenRecord, ServerEvent},
    storage::Store,
};

/// Seen coverage of a message over the participants other than its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    None,
    Partial,
    Full,
}

/// Record a delivery. Returns false if the recipient already had one.
pub fn record_delivery(message: &mut Message, user_id: Uuid, at: DateTime<Utc>) -> bool {
    if message.sender_id == user_id || message.delivered_to.iter().any(|d| d.user_id == user_id) {
        return false;
    }
    message.delivered_to.push(DeliveryRecord {
        user_id,
        delivered_at: at,
    });
    true
}

/// Record a seen receipt, first synthesizing the delivery it implies.
/// Returns `(seen_recorded, delivery_synthesized)`.
pub fn record_seen(message: &mut Message, user_id: Uuid, at: DateTime<Utc>) -> (bool, bool) {
    if message.sender_id == user_id || message.seen_by.iter().any(|s| s.user_id == user_id) {
        return (false, false);
    }
    let delivered = record_delivery(message, user_id, at);
    message.seen_by.push(SeenRecord { user_id, seen_at: at });
    (true, delivered)
}

fn coverage(message: &Message, conversation: &Conversation, has: impl Fn(Uuid) -> bool) -> ReceiptStatus {
    let recipients: Vec<Uuid> = conversation.other_participants(message.sender_id).collect();
    let covered = recipients.iter().filter(|r| has(**r)).count();
    match covered {
        0 => ReceiptStatus::None,
        n if n == recipients.len() => ReceiptStatus::Full,
        _ => ReceiptStatus::Partial,
    }
}

pub fn seen_status(message: &Message, conversation: &Conversation) -> ReceiptStatus {
    coverage(message, conversation, |user| {
        message.seen_by.iter().any(|s| s.user_id == user)
    })
}

pub fn delivery_status(message: &Message, conversation: &Conversation) -> ReceiptStatus {
    coverage(message, conversation, |user| {
        message.delivered_to.iter().any(|d| d.user_id == user)
    })
}

/// Where a persisted message stands in its lifecycle.
pub fn state_of(message: &Message, conversation: &Conversation) -> MessageState {
    let as_coverage = |status: ReceiptStatus| match status {
        ReceiptStatus::Full => Some(Coverage::Full),
        ReceiptStatus::Partial => Some(Coverage::Partial),
        ReceiptStatus::None => None,
    };

    if let Some(c) = as_coverage(seen_status(message, conversation)) {
        return MessageState::Seen(c);
    }
    if let Some(c) = as_coverage(delivery_status(message, conversation)) {
        return MessageState::Delivered(c);
    }
    MessageState::Persisted
}

pub fn delivered_event(message: &Message, user_id: Uuid, at: DateTime<Utc>) -> Arc<ServerEvent> {
    Arc::new(ServerEvent::MessageDelivered {
        message_id: message.id,
        conversation_id: message.conversation_id,
        delivered_to: user_id,
        delivered_at: at,
    })
}

/// Tracks delivered/seen acknowledgements. Receipt events go to the author's
/// sessions only.
#[derive(Clone)]
pub struct ReceiptAggregator {
    store: Store,
    actors: ConversationActors,
    sessions: Arc<SessionRegistry>,
}

impl ReceiptAggregator {
    pub fn new(store: Store, actors: ConversationActors, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            store,
            actors,
            sessions,
        }
    }

    async fn locate(&self, message_id: Uuid) -> AppResult<Uuid> {
        let message: Message = self
            .store
            .get(message_id)
            .await?
            .ok_or(AppError::MessageNotFound)?;
        Ok(message.conversation_id)
    }

    /// Idempotent; returns whether a new record was written.
    pub async fn mark_delivered(&self, message_id: Uuid, user_id: Uuid, at: DateTime<Utc>) -> AppResult<bool> {
        let conversation_id = self.locate(message_id).await?;
        let sessions = self.sessions.clone();

        self.actors
            .run(conversation_id, move |state| {
                Box::pin(async move {
                    if !state.conversation().await?.is_participant(user_id) {
                        return Err(AppError::NotParticipant);
                    }
                    let mut message: Message = state
                        .store()
                        .get(message_id)
                        .await?
                        .ok_or(AppError::MessageNotFound)?;
                    if !record_delivery(&mut message, user_id, at) {
                        return Ok(false);
                    }
                    state.store().put(&message).await?;
                    sessions.send_to_user(message.sender_id, &delivered_event(&message, user_id, at));
                    Ok(true)
                })
            })
            .await
    }

    /// Idempotent; synthesizes the delivery record when it is missing.
    pub async fn mark_seen(&self, message_id: Uuid, user_id: Uuid, at: DateTime<Utc>) -> AppResult<bool> {
        let conversation_id = self.locate(message_id).await?;
        let sessions = self.sessions.clone();

        self.actors
            .run(conversation_id, move |state| {
                Box::pin(async move {
                    if !state.conversation().await?.is_participant(user_id) {
                        return Err(AppError::NotParticipant);
                    }
                    let mut message: Message = state
                        .store()
                        .get(message_id)
                        .await?
                        .ok_or(AppError::MessageNotFound)?;
                    let (seen, delivered) = record_seen(&mut message, user_id, at);
                    if !seen {
                        return Ok(false);
                    }
                    state.store().put(&message).await?;

                    if delivered {
                        sessions.send_to_user(message.sender_id, &delivered_event(&message, user_id, at));
                    }
                    let event = Arc::new(ServerEvent::MessageSeen {
                        message_id,
                        conversation_id: message.conversation_id,
                        seen_by: user_id,
                        seen_at: at,
                    });
                    sessions.send_to_user(message.sender_id, &event);
                    tracing::debug!(%message_id, %user_id, "Message seen");
                    Ok(true)
                })
            })
            .await
    }

    /// Fill in deliveries a reader never acknowledged live, e.g. because they
    /// were offline when the messages were sent. Returns the updated messages.
    pub async fn reconcile(
        &self,
        conversation_id: Uuid,
        reader: Uuid,
        message_ids: Vec<Uuid>,
    ) -> AppResult<Vec<Message>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sessions = self.sessions.clone();

        self.actors
            .run(conversation_id, move |state| {
                Box::pin(async move {
                    let at = Utc::now();
                    let mut updated = Vec::new();
                    for message_id in message_ids {
                        let Some(mut message) = state.store().get::<Message>(message_id).await? else {
                            continue;
                        };
                        if message.conversation_id != conversation_id
                            || !record_delivery(&mut message, reader, at)
                        {
                            continue;
                        }
                        state.store().put(&message).await?;
                        sessions.send_to_user(message.sender_id, &delivered_event(&message, reader, at));
                        updated.push(message);
                    }
                    if !updated.is_empty() {
                        tracing::debug!(%conversation_id, %reader, count = updated.len(), "Reconciled deferred deliveries");
                    }
                    Ok::<_, AppError>(updated)
                })
            })
            .await
    }
}
