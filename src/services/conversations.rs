use std::collections::{BTreeSet, HashMap};

use serde_json::json;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{Conversation, ConversationView, Message, User},
    storage::{Filter, Query, Store},
};

pub const GROUP_NAME_MAX_LEN: usize = 50;

/// Durable conversations: membership, metadata and unread counters.
///
/// Reads go straight to the store. Mutations of an existing conversation are
/// made by its actor (see `services::actors`); only creation happens here.
#[derive(Clone)]
pub struct ConversationStore {
    store: Store,
}

impl ConversationStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn get(&self, conversation_id: Uuid) -> AppResult<Conversation> {
        self.store
            .get(conversation_id)
            .await?
            .ok_or(AppError::ConversationNotFound)
    }

    pub async fn get_for_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Conversation> {
        let conversation = self.get(conversation_id).await?;
        if !conversation.is_participant(user_id) {
            return Err(AppError::NotParticipant);
        }
        Ok(conversation)
    }

    /// Idempotent: the id is derived from the pair, so concurrent calls race on
    /// a create-if-absent and all end up with the same conversation.
    pub async fn get_or_create_direct(&self, initiator: Uuid, other: Uuid) -> AppResult<Conversation> {
        if initiator == other {
            return Err(AppError::Validation(
                "Cannot start a conversation with yourself".to_string(),
            ));
        }

        if let Some(existing) = self.store.get(Conversation::direct_id(initiator, other)).await? {
            return Ok(existing);
        }

        self.ensure_users_exist(&[other]).await?;

        let conversation = Conversation::new_direct(initiator, other);
        if self.store.insert(&conversation).await? {
            tracing::info!(conversation_id = %conversation.id, %initiator, %other, "Direct conversation created");
            return Ok(conversation);
        }

        self.get(conversation.id).await
    }

    pub async fn create_group(
        &self,
        creator: Uuid,
        name: &str,
        members: &[Uuid],
        avatar_url: Option<String>,
    ) -> AppResult<Conversation> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > GROUP_NAME_MAX_LEN {
            return Err(AppError::Validation(format!(
                "Group name must be 1-{} characters",
                GROUP_NAME_MAX_LEN
            )));
        }

        let conversation = Conversation::new_group(creator, name, members, avatar_url);
        if conversation.participants.len() < 2 {
            return Err(AppError::Validation(
                "A group needs at least one other participant".to_string(),
            ));
        }
        let others: Vec<Uuid> = conversation.other_participants(creator).collect();
        self.ensure_users_exist(&others).await?;

        self.store.put(&conversation).await?;
        tracing::info!(
            conversation_id = %conversation.id,
            %creator,
            participants = conversation.participants.len(),
            "Group conversation created"
        );
        Ok(conversation)
    }

    async fn ensure_users_exist(&self, user_ids: &[Uuid]) -> AppResult<()> {
        for user_id in user_ids {
            if self.store.get::<User>(*user_id).await?.is_none() {
                return Err(AppError::UserNotFound);
            }
        }
        Ok(())
    }

    /// Conversations of a user, most recently updated first.
    pub async fn list_for_user(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        let query = Query::new().filter(Filter::Contains("participants", json!(user_id)));
        let mut conversations: Vec<Conversation> = self.store.query(&query).await?;
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    /// Everyone who shares at least one conversation with the user.
    pub async fn contacts_of(&self, user_id: Uuid) -> AppResult<BTreeSet<Uuid>> {
        Ok(self
            .list_for_user(user_id)
            .await?
            .iter()
            .flat_map(|c| c.other_participants(user_id))
            .collect())
    }

    pub async fn view(&self, conversation: &Conversation, viewer: Uuid) -> AppResult<ConversationView> {
        let mut views = self.views(std::slice::from_ref(conversation), viewer).await?;
        views.pop().ok_or(AppError::ConversationNotFound)
    }

    /// Views for a list of conversations, resolving each user once.
    pub async fn views(
        &self,
        conversations: &[Conversation],
        viewer: Uuid,
    ) -> AppResult<Vec<ConversationView>> {
        let mut users: HashMap<Uuid, Option<User>> = HashMap::new();
        let mut views = Vec::with_capacity(conversations.len());

        for conversation in conversations {
            let mut participants = Vec::with_capacity(conversation.participants.len());
            for participant in &conversation.participants {
                if !users.contains_key(participant) {
                    let user = self.store.get::<User>(*participant).await?;
                    users.insert(*participant, user);
                }
                if let Some(Some(user)) = users.get(participant) {
                    participants.push(user.clone());
                }
            }

            let last_message = match conversation.last_message_id {
                Some(id) => self.store.get::<Message>(id).await?,
                None => None,
            };

            views.push(ConversationView::new(conversation, viewer, participants, last_message));
        }

        Ok(views)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (ConversationStore, User, User, User) {
        let store = Store::memory();
        let alice = User::new("alice", "Alice").unwrap();
        let bob = User::new("bob", "Bob").unwrap();
        let carol = User::new("carol", "Carol").unwrap();
        for user in [&alice, &bob, &carol] {
            store.put(user).await.unwrap();
        }
        (ConversationStore::new(store), alice, bob, carol)
    }

    #[tokio::test]
    async fn test_get_or_create_direct_is_idempotent() {
        let (conversations, alice, bob, _) = seeded().await;

        let first = conversations.get_or_create_direct(alice.id, bob.id).await.unwrap();
        let second = conversations.get_or_create_direct(bob.id, alice.id).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(conversations.list_for_user(alice.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one_conversation() {
        let (conversations, alice, bob, _) = seeded().await;

        let mut tasks = Vec::new();
        for i in 0..8 {
            let conversations = conversations.clone();
            let (a, b) = if i % 2 == 0 { (alice.id, bob.id) } else { (bob.id, alice.id) };
            tasks.push(tokio::spawn(async move {
                conversations.get_or_create_direct(a, b).await.unwrap().id
            }));
        }

        let mut ids = BTreeSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(conversations.list_for_user(bob.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_direct_requires_known_other_user() {
        let (conversations, alice, _, _) = seeded().await;

        assert!(matches!(
            conversations.get_or_create_direct(alice.id, alice.id).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            conversations.get_or_create_direct(alice.id, Uuid::new_v4()).await,
            Err(AppError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn test_group_creation_and_contacts() {
        let (conversations, alice, bob, carol) = seeded().await;

        let group = conversations
            .create_group(alice.id, "  Weekend  ", &[bob.id, carol.id], None)
            .await
            .unwrap();
        assert_eq!(group.group.as_ref().unwrap().name, "Weekend");
        assert!(conversations.create_group(alice.id, "", &[bob.id], None).await.is_err());
        assert!(conversations.create_group(alice.id, "solo", &[], None).await.is_err());

        let contacts = conversations.contacts_of(bob.id).await.unwrap();
        assert_eq!(contacts, BTreeSet::from([alice.id, carol.id]));

        assert!(matches!(
            conversations.get_for_participant(group.id, Uuid::new_v4()).await,
            Err(AppError::NotParticipant)
        ));
    }

    #[tokio::test]
    async fn test_view_resolves_participants() {
        let (conversations, alice, bob, _) = seeded().await;
        let direct = conversations.get_or_create_direct(alice.id, bob.id).await.unwrap();

        let view = conversations.view(&direct, alice.id).await.unwrap();
        assert!(!view.is_group);
        assert_eq!(view.participants.len(), 2);
        assert_eq!(view.unread_count, 0);
        assert!(view.last_message.is_none());
    }
}
