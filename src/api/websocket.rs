use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::Response,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{ClientEvent, SeenPayload, ServerEvent, Signal, SignalPayload, TypingPayload},
    services::sessions::SessionId,
    AppState,
};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Response, AppError> {
    let token = query
        .token
        .or_else(|| bearer.map(|TypedHeader(Authorization(bearer))| bearer.token().to_string()))
        .ok_or(AppError::Unauthorized)?;
    let user_id = state.verifier.verify(&token).await?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user_id, token)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Uuid, token: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbound queue for this session; fan-out drops events once it is full.
    let (tx, mut rx) = mpsc::channel::<Arc<ServerEvent>>(state.config.messaging.session_buffer);
    let session = state.sessions.connect(user_id, tx);
    let session_id = session.session_id();

    // Drain the session queue into the socket.
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(event.as_ref()) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(%session_id, event = event.name(), "Failed to encode event: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    // Dispatch inbound frames until the client leaves or a fatal error.
    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    let Err(e) = handle_frame(&recv_state, session_id, user_id, &token, &text).await
                    else {
                        continue;
                    };

                    let fatal = e.is_unauthenticated()
                        || e.status_code() == StatusCode::INTERNAL_SERVER_ERROR;
                    if fatal {
                        tracing::warn!(%user_id, %session_id, "Closing session: {}", e);
                    } else {
                        tracing::debug!(%user_id, %session_id, "Rejected client event: {}", e);
                    }
                    recv_state
                        .sessions
                        .send_to_session(session_id, &Arc::new(ServerEvent::error(e.public_message())));
                    if fatal {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => {}
    }

    // Unregistering drops the queue's sender, so the send task drains and exits.
    drop(session);
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }
}

async fn handle_frame(
    state: &AppState,
    session_id: SessionId,
    user_id: Uuid,
    token: &str,
    text: &str,
) -> AppResult<()> {
    // Tokens can expire while the socket stays open.
    if state.verifier.verify(token).await? != user_id {
        return Err(AppError::Unauthorized);
    }

    let event: ClientEvent = serde_json::from_str(text)
        .map_err(|e| AppError::BadRequest(format!("Malformed event: {}", e)))?;
    tracing::debug!(%user_id, %session_id, event = event.name(), "Client event");

    match event {
        ClientEvent::Join(claimed) => {
            if claimed != user_id {
                return Err(AppError::Forbidden("Cannot join as another user"));
            }
            state
                .sessions
                .send_to_session(session_id, &Arc::new(ServerEvent::Joined { user_id }));
        }
        ClientEvent::Typing(TypingPayload {
            conversation_id,
            is_typing,
        }) => {
            state
                .typing
                .set_typing(conversation_id, user_id, is_typing)
                .await?;
        }
        ClientEvent::MessageSeen(SeenPayload { message_id, .. }) => {
            state.receipts.mark_seen(message_id, user_id, Utc::now()).await?;
        }
        ClientEvent::CallOffer(payload) => relay(state, user_id, payload, ServerEvent::CallOffer),
        ClientEvent::CallAnswer(payload) => relay(state, user_id, payload, ServerEvent::CallAnswer),
        ClientEvent::IceCandidate(payload) => {
            relay(state, user_id, payload, ServerEvent::IceCandidate)
        }
        ClientEvent::EndCall(payload) => relay(state, user_id, payload, ServerEvent::EndCall),
        ClientEvent::Ping => {
            state
                .sessions
                .send_to_session(session_id, &Arc::new(ServerEvent::Pong));
        }
    }

    Ok(())
}

/// Forward call signaling to every session of the addressee, stamped with the sender.
fn relay(state: &AppState, from: Uuid, payload: SignalPayload, wrap: fn(Signal) -> ServerEvent) {
    let SignalPayload { to, mut body } = payload;
    // The sender is always the authenticated user.
    body.remove("from");
    let event = Arc::new(wrap(Signal { from, body }));
    let reached = state.sessions.send_to_user(to, &event);
    if reached == 0 {
        tracing::debug!(%from, %to, event = event.name(), "Signal target is offline");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, services::JwtVerifier};
    use serde_json::json;

    struct Client {
        user_id: Uuid,
        token: String,
        session_id: SessionId,
        rx: mpsc::Receiver<Arc<ServerEvent>>,
        _session: crate::services::SessionGuard,
    }

    async fn client(state: &AppState, handle: &str) -> Client {
        let user = state.users.register(handle, handle).await.unwrap();
        let token = JwtVerifier::new(&state.config.jwt).issue_token(user.id).unwrap();
        let (tx, rx) = mpsc::channel(16);
        let session = state.sessions.connect(user.id, tx);
        Client {
            user_id: user.id,
            token,
            session_id: session.session_id(),
            rx,
            _session: session,
        }
    }

    async fn send(state: &AppState, c: &Client, frame: serde_json::Value) -> AppResult<()> {
        handle_frame(state, c.session_id, c.user_id, &c.token, &frame.to_string()).await
    }

    /// Next event name, skipping presence updates from the background tracker.
    fn next_name(rx: &mut mpsc::Receiver<Arc<ServerEvent>>) -> Option<&'static str> {
        while let Ok(event) = rx.try_recv() {
            if !matches!(event.as_ref(), ServerEvent::UserOnline { .. } | ServerEvent::UserOffline { .. }) {
                return Some(event.name());
            }
        }
        None
    }

    #[tokio::test]
    async fn test_join_and_ping() {
        let state = AppState::in_memory(Config::for_tests());
        let mut alice = client(&state, "alice").await;

        send(&state, &alice, json!({"type": "join", "payload": alice.user_id})).await.unwrap();
        assert_eq!(next_name(&mut alice.rx), Some("joined"));

        send(&state, &alice, json!({"type": "ping"})).await.unwrap();
        assert_eq!(next_name(&mut alice.rx), Some("pong"));

        let err = send(&state, &alice, json!({"type": "join", "payload": Uuid::new_v4()}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_malformed_and_unauthenticated_frames() {
        let state = AppState::in_memory(Config::for_tests());
        let alice = client(&state, "alice").await;

        let err = send(&state, &alice, json!({"type": "dance"})).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let err = handle_frame(&state, alice.session_id, alice.user_id, "garbage", "{}")
            .await
            .unwrap_err();
        assert!(err.is_unauthenticated());
    }

    #[tokio::test]
    async fn test_typing_and_call_relay() {
        let state = AppState::in_memory(Config::for_tests());
        let alice = client(&state, "alice").await;
        let mut bob = client(&state, "bob").await;
        let conversation = state
            .conversations
            .get_or_create_direct(alice.user_id, bob.user_id)
            .await
            .unwrap();

        send(
            &state,
            &alice,
            json!({"type": "typing", "payload": {"conversationId": conversation.id, "isTyping": true}}),
        )
        .await
        .unwrap();
        assert_eq!(next_name(&mut bob.rx), Some("typing"));

        send(
            &state,
            &alice,
            json!({"type": "call_offer", "payload": {"to": bob.user_id, "sdp": "v=0", "isVideo": true}}),
        )
        .await
        .unwrap();
        let offer = loop {
            let event = bob.rx.try_recv().unwrap();
            if let ServerEvent::CallOffer(_) = event.as_ref() {
                break event;
            }
        };
        let frame = serde_json::to_value(offer.as_ref()).unwrap();
        assert_eq!(frame["type"], "call_offer");
        assert_eq!(frame["payload"]["from"], json!(alice.user_id));
        assert_eq!(frame["payload"]["sdp"], "v=0");
        assert_eq!(frame["payload"]["isVideo"], true);
    }

    #[tokio::test]
    async fn test_relay_ignores_client_supplied_sender() {
        let state = AppState::in_memory(Config::for_tests());
        let mallory = client(&state, "mallory").await;
        let mut bob = client(&state, "bob").await;
        let forged = Uuid::new_v4();

        send(
            &state,
            &mallory,
            json!({"type": "ice_candidate", "payload": {"to": bob.user_id, "from": forged, "candidate": "c0"}}),
        )
        .await
        .unwrap();
        let relayed = loop {
            let event = bob.rx.try_recv().unwrap();
            if let ServerEvent::IceCandidate(_) = event.as_ref() {
                break event;
            }
        };

        let text = serde_json::to_string(relayed.as_ref()).unwrap();
        assert_eq!(text.matches("\"from\"").count(), 1);
        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["payload"]["from"], json!(mallory.user_id));
        assert_eq!(frame["payload"]["candidate"], "c0");
    }

    #[tokio::test]
    async fn test_seen_frame_records_receipt() {
        let state = AppState::in_memory(Config::for_tests());
        let mut alice = client(&state, "alice").await;
        let bob = client(&state, "bob").await;
        let conversation = state
            .conversations
            .get_or_create_direct(alice.user_id, bob.user_id)
            .await
            .unwrap();
        let message = state
            .pipeline
            .submit(conversation.id, alice.user_id, crate::models::NewMessage::text("hi"))
            .await
            .unwrap();
        assert_eq!(next_name(&mut alice.rx), Some("message_delivered"));

        send(
            &state,
            &bob,
            json!({"type": "message_seen", "payload": {"messageId": message.id, "conversationId": conversation.id}}),
        )
        .await
        .unwrap();
        assert_eq!(next_name(&mut alice.rx), Some("message_seen"));
    }
}
