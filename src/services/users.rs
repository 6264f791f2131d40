use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{ConversationType, ProfileUpdate, User},
    services::conversations::ConversationStore,
    storage::{extension_for, BlobBucket, BlobStore, Filter, Query, Store},
};

pub const SEARCH_LIMIT: usize = 20;
pub const SUGGESTED_LIMIT: usize = 10;

/// Read access to identity records plus the profile edits users make themselves.
#[derive(Clone)]
pub struct UserDirectory {
    store: Store,
    conversations: ConversationStore,
    blobs: Arc<dyn BlobStore>,
}

impl UserDirectory {
    pub fn new(store: Store, conversations: ConversationStore, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            conversations,
            blobs,
        }
    }

    pub async fn get(&self, user_id: Uuid) -> AppResult<User> {
        self.store.get(user_id).await?.ok_or(AppError::UserNotFound)
    }

    /// Create a user record. Identity normally lives with the auth collaborator;
    /// this exists for seeding and tests.
    pub async fn register(&self, username: &str, display_name: &str) -> AppResult<User> {
        let user = User::new(username, display_name)?;
        if self.find_by_username(username).await?.is_some() {
            return Err(AppError::UserAlreadyExists);
        }
        self.store.put(&user).await?;
        tracing::info!(user_id = %user.id, %username, "User registered");
        Ok(user)
    }

    async fn find_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let query = Query::new()
            .filter(Filter::Eq("username", json!(username)))
            .limit(1);
        Ok(self.store.query::<User>(&query).await?.pop())
    }

    pub async fn search(&self, viewer: Uuid, text: &str) -> AppResult<Vec<User>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::BadRequest("Search query required".to_string()));
        }

        let query = Query::new()
            .filter(Filter::Search(&["username", "displayName"], text.to_string()))
            .limit(SEARCH_LIMIT + 1);
        let mut users: Vec<User> = self.store.query(&query).await?;
        users.retain(|u| u.id != viewer);
        users.truncate(SEARCH_LIMIT);
        Ok(users)
    }

    /// Users the viewer has no direct conversation with yet.
    pub async fn suggested(&self, viewer: Uuid) -> AppResult<Vec<User>> {
        let mut known: HashSet<Uuid> = self
            .conversations
            .list_for_user(viewer)
            .await?
            .iter()
            .filter(|c| c.conversation_type == ConversationType::Direct)
            .flat_map(|c| c.participants.iter().copied())
            .collect();
        known.insert(viewer);

        let mut users: Vec<User> = self.store.query(&Query::new()).await?;
        users.retain(|u| !known.contains(&u.id));
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        users.truncate(SUGGESTED_LIMIT);
        Ok(users)
    }

    pub async fn update_profile(&self, user_id: Uuid, update: ProfileUpdate) -> AppResult<User> {
        if update.is_empty() {
            return Err(AppError::BadRequest("No fields to update".to_string()));
        }
        update.validate()?;

        let mut user = self.get(user_id).await?;
        if let Some(username) = update.username {
            if username != user.username {
                // Best effort: two concurrent renames to the same handle can both pass.
                if self.find_by_username(&username).await?.is_some() {
                    return Err(AppError::UserAlreadyExists);
                }
                user.username = username;
            }
        }
        if let Some(display_name) = update.display_name {
            user.display_name = display_name.trim().to_string();
        }
        if let Some(bio) = update.bio {
            user.bio = bio;
        }
        if let Some(avatar_url) = update.avatar_url {
            user.avatar_url = Some(avatar_url);
        }
        user.updated_at = Utc::now();

        self.store.put(&user).await?;
        Ok(user)
    }

    pub async fn set_avatar(&self, user_id: Uuid, data: Bytes, content_type: &str) -> AppResult<User> {
        if !content_type.starts_with("image/") {
            return Err(AppError::Validation("Avatar must be an image".to_string()));
        }
        if data.is_empty() {
            return Err(AppError::BadRequest("Avatar file required".to_string()));
        }

        let mut user = self.get(user_id).await?;
        let key = format!("{}/{}.{}", user_id, Uuid::new_v4(), extension_for(content_type));
        let url = self
            .blobs
            .upload(BlobBucket::Avatars, &key, data, content_type)
            .await?;

        user.avatar_url = Some(url);
        user.updated_at = Utc::now();
        if let Err(e) = self.store.put(&user).await {
            // Orphaned upload
            if let Err(cleanup) = self.blobs.delete(BlobBucket::Avatars, &key).await {
                tracing::warn!(%user_id, error = %cleanup, "Failed to remove unused avatar");
            }
            return Err(e);
        }

        tracing::info!(%user_id, "Avatar updated");
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;

    fn directory() -> UserDirectory {
        let store = Store::memory();
        UserDirectory::new(
            store.clone(),
            ConversationStore::new(store),
            Arc::new(MemoryBlobStore::new("memory://blobs")),
        )
    }

    #[tokio::test]
    async fn test_search_matches_handle_and_name() {
        let users = directory();
        let alice = users.register("alice", "Alice Liddell").await.unwrap();
        users.register("bob", "Bob Builder").await.unwrap();
        users.register("alfred", "Alfred").await.unwrap();

        let found = users.search(alice.id, "AL").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].username, "alfred");

        let found = users.search(alice.id, "builder").await.unwrap();
        assert_eq!(found[0].username, "bob");

        assert!(users.search(alice.id, "  ").await.is_err());
    }

    #[tokio::test]
    async fn test_suggested_skips_existing_direct_partners() {
        let users = directory();
        let alice = users.register("alice", "Alice").await.unwrap();
        let bob = users.register("bob", "Bob").await.unwrap();
        let carol = users.register("carol", "Carol").await.unwrap();

        users
            .conversations
            .get_or_create_direct(alice.id, bob.id)
            .await
            .unwrap();

        let suggested = users.suggested(alice.id).await.unwrap();
        let ids: Vec<Uuid> = suggested.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![carol.id]);
    }

    #[tokio::test]
    async fn test_profile_update_enforces_unique_handle() {
        let users = directory();
        let alice = users.register("alice", "Alice").await.unwrap();
        users.register("bob", "Bob").await.unwrap();

        let taken = ProfileUpdate {
            username: Some("bob".into()),
            ..Default::default()
        };
        assert!(matches!(
            users.update_profile(alice.id, taken).await,
            Err(AppError::UserAlreadyExists)
        ));

        let update = ProfileUpdate {
            username: Some("alice_w".into()),
            bio: Some("curiouser".into()),
            ..Default::default()
        };
        let updated = users.update_profile(alice.id, update).await.unwrap();
        assert_eq!(updated.username, "alice_w");
        assert_eq!(users.get(alice.id).await.unwrap().bio, "curiouser");

        let too_long = ProfileUpdate {
            bio: Some("x".repeat(151)),
            ..Default::default()
        };
        assert!(matches!(
            users.update_profile(alice.id, too_long).await,
            Err(AppError::Validation(_))
        ));
        assert!(users.update_profile(alice.id, ProfileUpdate::default()).await.is_err());
        assert!(matches!(
            users.register("alice_w", "Again").await,
            Err(AppError::UserAlreadyExists)
        ));
    }

    #[tokio::test]
    async fn test_avatar_upload_sets_url() {
        let users = directory();
        let alice = users.register("alice", "Alice").await.unwrap();

        let updated = users
            .set_avatar(alice.id, Bytes::from_static(b"\x89PNG"), "image/png")
            .await
            .unwrap();
        let url = updated.avatar_url.unwrap();
        assert!(url.starts_with("memory://blobs/avatars/"));
        assert!(url.ends_with(".png"));

        assert!(matches!(
            users.set_avatar(alice.id, Bytes::from_static(b"%PDF"), "application/pdf").await,
            Err(AppError::Validation(_))
        ));
    }
}
