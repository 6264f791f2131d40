use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use super::{handlers, middleware::auth_middleware, websocket::handle_websocket};
use crate::AppState;

/// The full HTTP application: `/health` plus the authenticated API under `/api/v1`.
pub fn create_router(state: AppState) -> Router {
    let max_upload = state.config.server.max_upload_bytes;

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_routes(state.clone()))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn api_routes(state: AppState) -> Router<AppState> {
    // Conversation routes (protected)
    let conversation_routes = Router::new()
        .route("/", get(handlers::conversations::get_conversations))
        .route("/user/:user_id", get(handlers::conversations::get_or_create_direct))
        .route("/group", post(handlers::conversations::create_group))
        .route(
            "/:id",
            put(handlers::conversations::update_conversation)
                .delete(handlers::conversations::delete_conversation),
        )
        .route("/:id/read", post(handlers::conversations::mark_read))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Message routes (protected). `/:id` is a conversation for GET/POST and a message for DELETE.
    let message_routes = Router::new()
        .route(
            "/:id",
            get(handlers::messages::get_messages)
                .post(handlers::messages::send_message)
                .delete(handlers::messages::delete_message),
        )
        .route(
            "/:id/reaction",
            post(handlers::messages::add_reaction).delete(handlers::messages::remove_reaction),
        )
        .route("/:id/forward", post(handlers::messages::forward_message))
        .route("/:id/delivered", post(handlers::messages::mark_delivered))
        .route("/:id/seen", post(handlers::messages::mark_seen))
        .route("/upload/:kind", post(handlers::messages::upload_media))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // User routes (protected)
    let user_routes = Router::new()
        .route("/me", get(handlers::users::get_current_user))
        .route("/search", get(handlers::users::search_users))
        .route("/suggested", get(handlers::users::suggested_users))
        .route("/profile", put(handlers::users::update_profile))
        .route("/avatar", post(handlers::users::upload_avatar))
        .route("/online-status", post(handlers::users::online_status))
        .route("/:id", get(handlers::users::get_user))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // WebSocket route: authenticates on its own so browsers can pass `?token=`
    let ws_route = Router::new().route("/ws", get(handle_websocket));

    Router::new()
        .nest("/conversations", conversation_routes)
        .nest("/messages", message_routes)
        .nest("/users", user_routes)
        .merge(ws_route)
}
