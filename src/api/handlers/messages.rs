use axum::{
    extract::{Multipart, Path, Query, State},
    Extension, Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    api::middleware::AuthUser,
    error::{AppError, AppResult},
    models::{MediaRef, Message, MessagePage, MessageType, NewMessage, Reaction},
    services::media::{UploadKind, UploadedMedia},
    AppState,
};

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    pub limit: Option<usize>,
}

fn default_page() -> usize {
    1
}

pub async fn get_messages(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> AppResult<Json<MessagePage>> {
    let page = state
        .pipeline
        .list_messages(conversation_id, user_id, query.page, query.limit)
        .await?;

    Ok(Json(page))
}

/// Media can arrive as a nested `media` object or as the flat fields
/// (`mediaUrl`, `duration`, ...) that web clients post after an upload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: String,
    #[serde(alias = "type", default)]
    pub message_type: MessageType,
    pub media: Option<MediaRef>,
    pub media_url: Option<String>,
    pub thumbnail: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub duration: Option<f64>,
    pub reply_to: Option<Uuid>,
}

impl From<SendMessageRequest> for NewMessage {
    fn from(req: SendMessageRequest) -> Self {
        let flat = req.media_url.map(|url| MediaRef {
            url,
            thumbnail: req.thumbnail,
            file_name: req.file_name,
            file_size: req.file_size,
            duration: req.duration,
        });

        NewMessage {
            content: req.content,
            message_type: req.message_type,
            media: req.media.or(flat),
            reply_to: req.reply_to,
            forwarded_from: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SentMessage {
    pub message: Message,
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> AppResult<Json<SentMessage>> {
    let message = state
        .pipeline
        .submit(conversation_id, user_id, req.into())
        .await?;

    Ok(Json(SentMessage { message }))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<MessageResponse>> {
    state.pipeline.delete(message_id, user_id).await?;

    Ok(Json(MessageResponse {
        message: "Message deleted".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReactionRequest {
    pub emoji: String,
}

/// The updated message, plus its reaction set at the top level.
#[derive(Debug, Serialize)]
pub struct ReactionsResponse {
    pub reactions: Vec<Reaction>,
    pub message: Message,
}

impl From<Message> for ReactionsResponse {
    fn from(message: Message) -> Self {
        Self {
            reactions: message.reactions.clone(),
            message,
        }
    }
}

pub async fn add_reaction(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(message_id): Path<Uuid>,
    Json(req): Json<ReactionRequest>,
) -> AppResult<Json<ReactionsResponse>> {
    let message = state.pipeline.react(message_id, user_id, &req.emoji).await?;
    Ok(Json(message.into()))
}

pub async fn remove_reaction(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<ReactionsResponse>> {
    let message = state.pipeline.unreact(message_id, user_id).await?;
    Ok(Json(message.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRequest {
    pub conversation_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ForwardResponse {
    pub messages: Vec<Message>,
}

pub async fn forward_message(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(message_id): Path<Uuid>,
    Json(req): Json<ForwardRequest>,
) -> AppResult<Json<ForwardResponse>> {
    let messages = state
        .pipeline
        .forward(message_id, user_id, &req.conversation_ids)
        .await?;

    Ok(Json(ForwardResponse { messages }))
}

pub async fn mark_delivered(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<MessageResponse>> {
    state
        .receipts
        .mark_delivered(message_id, user_id, Utc::now())
        .await?;

    Ok(Json(MessageResponse {
        message: "Marked as delivered".to_string(),
    }))
}

pub async fn mark_seen(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<MessageResponse>> {
    state.receipts.mark_seen(message_id, user_id, Utc::now()).await?;

    Ok(Json(MessageResponse {
        message: "Marked as seen".to_string(),
    }))
}

pub async fn upload_media(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(kind): Path<String>,
    mut multipart: Multipart,
) -> AppResult<Json<UploadedMedia>> {
    let kind: UploadKind = kind.parse()?;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::BadRequest(format!("Failed to read multipart field: {}", e))
    })? {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().map(str::to_string);
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("Failed to read file: {}", e)))?;

        let uploaded = state
            .media
            .upload(user_id, kind, file_name, &content_type, data)
            .await?;
        return Ok(Json(uploaded));
    }

    Err(AppError::BadRequest("File required".to_string()))
}
