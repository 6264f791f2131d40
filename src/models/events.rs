//! Live channel protocol.
//!
//! Frames are JSON objects of the form `{"type": "...", "payload": ...}` in
//! both directions. Call signaling payloads are opaque and relayed as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{MessageView, Reaction};

// ── Client → Server ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Sent once after connecting; must name the authenticated user.
    Join(Uuid),
    Typing(TypingPayload),
    MessageSeen(SeenPayload),
    CallOffer(SignalPayload),
    CallAnswer(SignalPayload),
    IceCandidate(SignalPayload),
    EndCall(SignalPayload),
    Ping,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: Uuid,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeenPayload {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
}

/// Call signaling addressed to one user. Everything except `to` is relayed verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalPayload {
    pub to: Uuid,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::Typing(_) => "typing",
            Self::MessageSeen(_) => "message_seen",
            Self::CallOffer(_) => "call_offer",
            Self::CallAnswer(_) => "call_answer",
            Self::IceCandidate(_) => "ice_candidate",
            Self::EndCall(_) => "end_call",
            Self::Ping => "ping",
        }
    }
}

// ── Server → Client ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Joined { user_id: Uuid },

    NewMessage(Box<MessageView>),

    #[serde(rename_all = "camelCase")]
    MessageDeleted {
        message_id: Uuid,
        conversation_id: Uuid,
    },

    /// Always the full reaction set, never a delta.
    #[serde(rename_all = "camelCase")]
    MessageReaction {
        message_id: Uuid,
        conversation_id: Uuid,
        reactions: Vec<Reaction>,
    },

    #[serde(rename_all = "camelCase")]
    MessageDelivered {
        message_id: Uuid,
        conversation_id: Uuid,
        delivered_to: Uuid,
        delivered_at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    MessageSeen {
        message_id: Uuid,
        conversation_id: Uuid,
        seen_by: Uuid,
        seen_at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    Typing {
        conversation_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },

    #[serde(rename_all = "camelCase")]
    UserOnline { user_id: Uuid },

    #[serde(rename_all = "camelCase")]
    UserOffline {
        user_id: Uuid,
        last_seen: DateTime<Utc>,
    },

    CallOffer(Signal),
    CallAnswer(Signal),
    IceCandidate(Signal),
    EndCall(Signal),

    Pong,

    Error { message: String },
}

/// Relayed call signaling, stamped with the sender.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub from: Uuid,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "joined",
            Self::NewMessage(_) => "new_message",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::MessageReaction { .. } => "message_reaction",
            Self::MessageDelivered { .. } => "message_delivered",
            Self::MessageSeen { .. } => "message_seen",
            Self::Typing { .. } => "typing",
            Self::UserOnline { .. } => "user_online",
            Self::UserOffline { .. } => "user_offline",
            Self::CallOffer(_) => "call_offer",
            Self::CallAnswer(_) => "call_answer",
            Self::IceCandidate(_) => "ice_candidate",
            Self::EndCall(_) => "end_call",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
