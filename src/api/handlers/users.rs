use std::collections::HashMap;

use axum::{
    extract::{Multipart, Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    api::middleware::AuthUser,
    error::{AppError, AppResult},
    models::{PresenceStatus, ProfileUpdate, User},
    AppState,
};

pub async fn get_current_user(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> AppResult<Json<User>> {
    Ok(Json(state.users.get(user_id).await?))
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(_): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<User>> {
    Ok(Json(state.users.get(user_id).await?))
}

pub async fn update_profile(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(update): Json<ProfileUpdate>,
) -> AppResult<Json<User>> {
    Ok(Json(state.users.update_profile(user_id, update).await?))
}

pub async fn upload_avatar(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    mut multipart: Multipart,
) -> AppResult<Json<User>> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::BadRequest(format!("Failed to read multipart field: {}", e))
    })? {
        if !matches!(field.name(), Some("avatar") | Some("file")) {
            continue;
        }

        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("Failed to read file: {}", e)))?;

        let user = state.users.set_avatar(user_id, data, &content_type).await?;
        return Ok(Json(user));
    }

    Err(AppError::BadRequest("Avatar file required".to_string()))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(alias = "q")]
    pub query: String,
}

pub async fn search_users(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Query(query): Query<SearchQuery>,
) -> AppResult<Json<Vec<User>>> {
    Ok(Json(state.users.search(user_id, &query.query).await?))
}

pub async fn suggested_users(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> AppResult<Json<Vec<User>>> {
    Ok(Json(state.users.suggested(user_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineStatusRequest {
    pub user_ids: Vec<Uuid>,
}

pub async fn online_status(
    State(state): State<AppState>,
    Extension(_): Extension<AuthUser>,
    Json(req): Json<OnlineStatusRequest>,
) -> AppResult<Json<HashMap<Uuid, PresenceStatus>>> {
    let statuses = state.presence.statuses_of(&req.user_ids).await?;
    Ok(Json(statuses.into_iter().collect()))
}
