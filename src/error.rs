use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    // Auth errors
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    TokenExpired,
    #[error("Unauthorized")]
    Unauthorized,

    // User errors
    #[error("User not found")]
    UserNotFound,
    #[error("User already exists")]
    UserAlreadyExists,

    // Conversation errors
    #[error("Conversation not found")]
    ConversationNotFound,
    #[error("Not a participant")]
    NotParticipant,

    // Message errors
    #[error("Message not found")]
    MessageNotFound,

    #[error("Forbidden: {0}")]
    Forbidden(&'static str),

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Bad request: {0}")]
    BadRequest(String),

    // Sequence collisions that survived the internal retry
    #[error("Conflict: {0}")]
    Conflict(String),

    // Store errors
    #[error("Store unavailable: {0}")]
    TransientStore(String),
    #[error("Service unavailable")]
    ServiceUnavailable,

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // JWT errors
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    // Serialization of stored documents
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether a store call that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::TransientStore(_) => true,
            AppError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// Whether the error should be surfaced to the caller as an authentication failure.
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            AppError::InvalidToken | AppError::TokenExpired | AppError::Unauthorized | AppError::Jwt(_)
        )
    }

    /// Message suitable for clients; internal details are logged instead.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Validation(msg) | AppError::BadRequest(msg) => msg.clone(),
            AppError::Jwt(_) => "Invalid token".to_string(),
            AppError::TransientStore(_) => "Service unavailable".to_string(),
            AppError::Database(_) => "Database error".to_string(),
            AppError::Serialization(_) | AppError::Internal(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            AppError::InvalidToken
            | AppError::TokenExpired
            | AppError::Unauthorized
            | AppError::Jwt(_) => StatusCode::UNAUTHORIZED,

            // 403 Forbidden
            AppError::NotParticipant | AppError::Forbidden(_) => StatusCode::FORBIDDEN,

            // 404 Not Found
            AppError::UserNotFound
            | AppError::ConversationNotFound
            | AppError::MessageNotFound => StatusCode::NOT_FOUND,

            // 409 Conflict
            AppError::UserAlreadyExists | AppError::Conflict(_) => StatusCode::CONFLICT,

            // 503 Service Unavailable
            AppError::TransientStore(_) | AppError::ServiceUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 500 Internal Server Error
            AppError::Database(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            AppError::Database(e) => tracing::error!("Database error: {}", e),
            AppError::Serialization(e) => tracing::error!("Serialization error: {}", e),
            AppError::Internal(e) => tracing::error!("Internal error: {}", e),
            AppError::TransientStore(e) => tracing::warn!("Store unavailable: {}", e),
            _ => {}
        }

        let body = Json(json!({
            "error": self.public_message()
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
