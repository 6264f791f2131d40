//! Message lifecycle: validate, sequence, persist, fan out.
//!
//! Every write runs on the conversation's actor, so the order in which messages
//! are persisted is the order in which they are pushed to each session.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use super::{
    actors::{ConversationActors, ConversationState},
    conversations::ConversationStore,
    receipts::{delivered_event, record_delivery, ReceiptAggregator},
    sessions::SessionRegistry,
};
use crate::{
    error::{AppError, AppResult},
    models::{
        validate_emoji, Conversation, ConversationSettings, Message, MessagePage, MessageView,
        NewMessage, ReplyPreview, ServerEvent, MAX_EMOJI_LEN,
    },
    storage::{Filter, Query, Store},
};

pub const MAX_PAGE_SIZE: usize = 100;
const MAX_THEME_LEN: usize = 32;

#[derive(Clone)]
pub struct MessagePipeline {
    store: Store,
    conversations: ConversationStore,
    actors: ConversationActors,
    sessions: Arc<SessionRegistry>,
    receipts: ReceiptAggregator,
    page_size: usize,
}

impl MessagePipeline {
    pub fn new(
        store: Store,
        conversations: ConversationStore,
        actors: ConversationActors,
        sessions: Arc<SessionRegistry>,
        receipts: ReceiptAggregator,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            conversations,
            actors,
            sessions,
            receipts,
            page_size,
        }
    }

    async fn load(&self, message_id: Uuid) -> AppResult<Message> {
        self.store
            .get(message_id)
            .await?
            .ok_or(AppError::MessageNotFound)
    }

    pub async fn submit(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        payload: NewMessage,
    ) -> AppResult<Message> {
        payload.validate()?;

        let sessions = self.sessions.clone();
        let message = self
            .actors
            .run(conversation_id, move |state| {
                Box::pin(submit_job(state, sessions, sender_id, payload))
            })
            .await?;

        tracing::info!(
            message_id = %message.id,
            %conversation_id,
            %sender_id,
            sequence = message.sequence,
            "Message persisted"
        );
        Ok(message)
    }

    /// Soft delete. Repeating it is a successful no-op.
    pub async fn delete(&self, message_id: Uuid, requester: Uuid) -> AppResult<Message> {
        let conversation_id = self.load(message_id).await?.conversation_id;
        let sessions = self.sessions.clone();

        self.actors
            .run(conversation_id, move |state| {
                Box::pin(delete_job(state, sessions, message_id, requester))
            })
            .await
    }

    /// Add or replace the user's reaction. Returns the full reaction set.
    pub async fn react(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> AppResult<Message> {
        validate_emoji(emoji)?;
        self.update_reaction(message_id, user_id, Some(emoji.to_string()))
            .await
    }

    pub async fn unreact(&self, message_id: Uuid, user_id: Uuid) -> AppResult<Message> {
        self.update_reaction(message_id, user_id, None).await
    }

    async fn update_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: Option<String>,
    ) -> AppResult<Message> {
        let conversation_id = self.load(message_id).await?.conversation_id;
        let sessions = self.sessions.clone();

        self.actors
            .run(conversation_id, move |state| {
                Box::pin(reaction_job(state, sessions, message_id, user_id, emoji))
            })
            .await
    }

    /// Copy a message into other conversations of the same user.
    pub async fn forward(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        targets: &[Uuid],
    ) -> AppResult<Vec<Message>> {
        let original = self.load(message_id).await?;
        self.conversations
            .get_for_participant(original.conversation_id, user_id)
            .await?;
        if original.is_deleted {
            return Err(AppError::Validation(
                "Cannot forward a deleted message".to_string(),
            ));
        }

        let targets: BTreeSet<Uuid> = targets.iter().copied().collect();
        if targets.is_empty() {
            return Err(AppError::Validation(
                "Pick at least one conversation".to_string(),
            ));
        }
        for target in &targets {
            self.conversations.get_for_participant(*target, user_id).await?;
        }

        let mut forwarded = Vec::with_capacity(targets.len());
        for target in targets {
            forwarded.push(self.submit(target, user_id, original.forwarded_copy()).await?);
        }
        Ok(forwarded)
    }

    /// One page of history, newest page first and oldest-first within the page.
    /// Deliveries the reader never acknowledged are recorded on the way out.
    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        reader: Uuid,
        page: usize,
        limit: Option<usize>,
    ) -> AppResult<MessagePage> {
        self.conversations
            .get_for_participant(conversation_id, reader)
            .await?;

        let page = page.max(1);
        let limit = limit.unwrap_or(self.page_size).clamp(1, MAX_PAGE_SIZE);
        let query = Query::new()
            .filter(Filter::Eq("conversationId", json!(conversation_id)))
            .sort_desc("sequence")
            .offset((page - 1) * limit)
            .limit(limit + 1);

        let mut messages: Vec<Message> = self.store.query(&query).await?;
        let has_more = messages.len() > limit;
        messages.truncate(limit);
        messages.reverse();

        let undelivered: Vec<Uuid> = messages
            .iter()
            .filter(|m| m.sender_id != reader && !m.delivered_to.iter().any(|d| d.user_id == reader))
            .map(|m| m.id)
            .collect();

        match self.receipts.reconcile(conversation_id, reader, undelivered).await {
            Ok(updated) => {
                for message in updated {
                    if let Some(slot) = messages.iter_mut().find(|m| m.id == message.id) {
                        *slot = message;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(%conversation_id, %reader, error = %e, "Delivery reconciliation failed");
            }
        }

        Ok(MessagePage {
            messages: self.with_replies(messages).await?,
            has_more,
            page,
        })
    }

    /// Resolve reply references into previews. Targets on the same page are
    /// not fetched again.
    async fn with_replies(&self, messages: Vec<Message>) -> AppResult<Vec<MessageView>> {
        let mut previews: HashMap<Uuid, ReplyPreview> = messages
            .iter()
            .map(|m| (m.id, ReplyPreview::from(m)))
            .collect();

        for reply_to in messages.iter().filter_map(|m| m.reply_to) {
            if previews.contains_key(&reply_to) {
                continue;
            }
            if let Some(original) = self.store.get::<Message>(reply_to).await? {
                previews.insert(reply_to, ReplyPreview::from(&original));
            }
        }

        Ok(messages
            .into_iter()
            .map(|message| MessageView {
                reply_preview: message.reply_to.and_then(|id| previews.get(&id).cloned()),
                message,
            })
            .collect())
    }

    pub async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        self.actors
            .run(conversation_id, move |state| {
                Box::pin(async move {
                    let conversation = state.conversation().await?;
                    if !conversation.is_participant(user_id) {
                        return Err(AppError::NotParticipant);
                    }
                    if conversation.mark_read(user_id) {
                        state.save().await?;
                    }
                    Ok(())
                })
            })
            .await
    }

    pub async fn update_settings(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        settings: ConversationSettings,
    ) -> AppResult<Conversation> {
        if let Some(theme) = &settings.theme {
            if theme.chars().count() > MAX_THEME_LEN {
                return Err(AppError::Validation(format!(
                    "Theme must be at most {} characters",
                    MAX_THEME_LEN
                )));
            }
        }
        if let Some(emoji) = &settings.emoji {
            validate_emoji(emoji).map_err(|_| {
                AppError::Validation(format!(
                    "Conversation emoji must be 1-{} characters",
                    MAX_EMOJI_LEN
                ))
            })?;
        }

        self.actors
            .run(conversation_id, move |state| {
                Box::pin(async move {
                    let conversation = state.conversation().await?;
                    if !conversation.is_participant(user_id) {
                        return Err(AppError::NotParticipant);
                    }
                    if let Some(theme) = settings.theme {
                        conversation.theme = Some(theme);
                    }
                    if let Some(emoji) = settings.emoji {
                        conversation.emoji = Some(emoji);
                    }
                    match settings.is_muted {
                        Some(true) if !conversation.muted_by.contains(&user_id) => {
                            conversation.muted_by.push(user_id)
                        }
                        Some(false) => conversation.muted_by.retain(|u| *u != user_id),
                        _ => {}
                    }
                    let updated = conversation.clone();
                    state.save().await?;
                    Ok(updated)
                })
            })
            .await
    }

    /// Hard delete, cascading to every message of the conversation.
    /// Returns the number of messages removed.
    pub async fn delete_conversation(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<u64> {
        let removed = self
            .actors
            .run(conversation_id, move |state| {
                Box::pin(async move {
                    let conversation = state.conversation().await?;
                    if !conversation.is_participant(user_id) {
                        return Err(AppError::NotParticipant);
                    }
                    if !conversation.can_delete(user_id) {
                        return Err(AppError::Forbidden(
                            "Only the group creator can delete this conversation",
                        ));
                    }

                    let removed = state
                        .store()
                        .delete_where::<Message>(&[Filter::Eq("conversationId", json!(conversation_id))])
                        .await?;
                    state.store().delete::<Conversation>(conversation_id).await?;
                    state.forget();
                    Ok(removed)
                })
            })
            .await?;

        tracing::info!(%conversation_id, %user_id, messages = removed, "Conversation deleted");
        Ok(removed)
    }
}

async fn latest_sequence(store: &Store, conversation_id: Uuid) -> AppResult<u64> {
    let query = Query::new()
        .filter(Filter::Eq("conversationId", json!(conversation_id)))
        .sort_desc("sequence")
        .limit(1);
    let latest: Vec<Message> = store.query(&query).await?;
    Ok(latest.first().map(|m| m.sequence).unwrap_or(0))
}

/// Create-if-absent for a fresh message. When a timed-out attempt committed
/// before the store retried, the slot holds this same message and counts as stored.
async fn insert_message(store: &Store, message: &Message) -> AppResult<bool> {
    if store.insert(message).await? {
        return Ok(true);
    }
    let occupant: Option<Message> = store.get(message.id).await?;
    Ok(occupant.is_some_and(|existing| existing.is_same_submission(message)))
}

async fn submit_job(
    state: &mut ConversationState,
    sessions: Arc<SessionRegistry>,
    sender_id: Uuid,
    payload: NewMessage,
) -> AppResult<Message> {
    let conversation_id = state.id();
    let conversation = state.conversation().await?;
    if !conversation.is_participant(sender_id) {
        return Err(AppError::NotParticipant);
    }
    let sequence = conversation.last_sequence + 1;

    let reply_preview = match payload.reply_to {
        Some(reply_to) => match state.store().get::<Message>(reply_to).await? {
            Some(original) if original.conversation_id == conversation_id => {
                Some(ReplyPreview::from(&original))
            }
            _ => {
                return Err(AppError::Validation(
                    "Replied-to message is not in this conversation".to_string(),
                ))
            }
        },
        None => None,
    };

    let mut message = Message::new(conversation_id, sender_id, sequence, payload);
    if !insert_message(state.store(), &message).await? {
        // The slot is taken, so the cached counter is behind the store.
        let latest = latest_sequence(state.store(), conversation_id).await?;
        message.resequence(latest.max(sequence) + 1);
        tracing::warn!(%conversation_id, sequence, retry = message.sequence, "Sequence collision, retrying");
        if !insert_message(state.store(), &message).await? {
            return Err(AppError::Conflict(format!(
                "Sequence {} is already taken in conversation {}",
                message.sequence, conversation_id
            )));
        }
    }

    let conversation = state.conversation().await?;
    conversation.record_message(&message);
    let recipients: Vec<Uuid> = conversation.other_participants(sender_id).collect();
    state.save().await?;

    let event = Arc::new(ServerEvent::NewMessage(Box::new(MessageView {
        message: message.clone(),
        reply_preview,
    })));
    let at = Utc::now();
    let reached: Vec<Uuid> = recipients
        .into_iter()
        .filter(|recipient| sessions.send_to_user(*recipient, &event) > 0)
        .collect();

    if !reached.is_empty() {
        let mut delivered = message.clone();
        for recipient in &reached {
            record_delivery(&mut delivered, *recipient, at);
        }
        // Recipients that miss this write get their delivery recorded on the next fetch.
        match state.store().put(&delivered).await {
            Ok(()) => {
                for recipient in reached {
                    sessions.send_to_user(sender_id, &delivered_event(&delivered, recipient, at));
                }
                message = delivered;
            }
            Err(e) => {
                tracing::warn!(message_id = %message.id, error = %e, "Failed to record live delivery");
            }
        }
    }

    Ok(message)
}

async fn delete_job(
    state: &mut ConversationState,
    sessions: Arc<SessionRegistry>,
    message_id: Uuid,
    requester: Uuid,
) -> AppResult<Message> {
    let mut message: Message = state
        .store()
        .get(message_id)
        .await?
        .ok_or(AppError::MessageNotFound)?;
    if message.sender_id != requester {
        return Err(AppError::Forbidden("Only the sender can delete a message"));
    }
    if !message.soft_delete() {
        return Ok(message);
    }
    state.store().put(&message).await?;

    let event = Arc::new(ServerEvent::MessageDeleted {
        message_id,
        conversation_id: message.conversation_id,
    });
    for participant in &state.conversation().await?.participants {
        sessions.send_to_user(*participant, &event);
    }

    tracing::info!(%message_id, %requester, "Message deleted");
    Ok(message)
}

async fn reaction_job(
    state: &mut ConversationState,
    sessions: Arc<SessionRegistry>,
    message_id: Uuid,
    user_id: Uuid,
    emoji: Option<String>,
) -> AppResult<Message> {
    let conversation = state.conversation().await?;
    if !conversation.is_participant(user_id) {
        return Err(AppError::NotParticipant);
    }
    let participants = conversation.participants.clone();

    let mut message: Message = state
        .store()
        .get(message_id)
        .await?
        .ok_or(AppError::MessageNotFound)?;
    if message.is_deleted {
        return Err(AppError::Validation(
            "Cannot react to a deleted message".to_string(),
        ));
    }

    let changed = match &emoji {
        Some(emoji) => message.set_reaction(user_id, emoji),
        None => message.remove_reaction(user_id),
    };
    if changed {
        message.updated_at = Utc::now();
        state.store().put(&message).await?;

        let event = Arc::new(ServerEvent::MessageReaction {
            message_id,
            conversation_id: message.conversation_id,
            reactions: message.reactions.clone(),
        });
        for participant in participants {
            sessions.send_to_user(participant, &event);
        }
    }

    Ok(message)
}
