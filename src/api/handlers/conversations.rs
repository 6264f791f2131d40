use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    api::middleware::AuthUser,
    error::AppResult,
    models::{ConversationSettings, ConversationView},
    AppState,
};

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

pub async fn get_conversations(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> AppResult<Json<Vec<ConversationView>>> {
    let conversations = state.conversations.list_for_user(user_id).await?;
    let views = state.conversations.views(&conversations, user_id).await?;

    Ok(Json(views))
}

pub async fn get_or_create_direct(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(other_id): Path<Uuid>,
) -> AppResult<Json<ConversationView>> {
    let conversation = state
        .conversations
        .get_or_create_direct(user_id, other_id)
        .await?;

    Ok(Json(state.conversations.view(&conversation, user_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub participants: Vec<Uuid>,
    pub avatar: Option<String>,
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(req): Json<CreateGroupRequest>,
) -> AppResult<Json<ConversationView>> {
    let conversation = state
        .conversations
        .create_group(user_id, &req.name, &req.participants, req.avatar)
        .await?;

    Ok(Json(state.conversations.view(&conversation, user_id).await?))
}

pub async fn update_conversation(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(conversation_id): Path<Uuid>,
    Json(settings): Json<ConversationSettings>,
) -> AppResult<Json<ConversationView>> {
    let conversation = state
        .pipeline
        .update_settings(conversation_id, user_id, settings)
        .await?;

    Ok(Json(state.conversations.view(&conversation, user_id).await?))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<MessageResponse>> {
    state.pipeline.mark_read(conversation_id, user_id).await?;

    Ok(Json(MessageResponse {
        message: "Marked as read".to_string(),
    }))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<MessageResponse>> {
    state
        .pipeline
        .delete_conversation(conversation_id, user_id)
        .await?;

    Ok(Json(MessageResponse {
        message: "Conversation deleted".to_string(),
    }))
}
