use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Namespace for message ids derived from (conversation, sequence).
const MESSAGE_NAMESPACE: Uuid = Uuid::from_u128(0x1b7e_4c02_88d9_4f6a_b3c5_70e2_9d14_c8af);

pub const MAX_CONTENT_LEN: usize = 10_000;
pub const MAX_EMOJI_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    /// Per-conversation order key, strictly increasing.
    pub sequence: u64,
    #[serde(default)]
    pub content: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub media: Option<MediaRef>,
    #[serde(default)]
    pub delivered_to: Vec<DeliveryRecord>,
    #[serde(default)]
    pub seen_by: Vec<SeenRecord>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub forwarded_from: Option<Uuid>,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Voice,
    File,
    Gif,
    Call,
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Text
    }
}

impl FromStr for MessageType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "voice" => Ok(Self::Voice),
            "file" => Ok(Self::File),
            "gif" => Ok(Self::Gif),
            "call" => Ok(Self::Call),
            other => Err(AppError::Validation(format!("Unknown message type: {}", other))),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Voice => "voice",
            Self::File => "file",
            Self::Gif => "gif",
            Self::Call => "call",
        };
        f.write_str(name)
    }
}

/// Reference to an uploaded blob; the bytes live in the blob store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub url: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    /// Seconds, for audio, voice and video.
    #[serde(default)]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub user_id: Uuid,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeenRecord {
    pub user_id: Uuid,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub user_id: Uuid,
    pub emoji: String,
}

/// Payload accepted by the pipeline for a new message.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub content: String,
    pub message_type: MessageType,
    pub media: Option<MediaRef>,
    pub reply_to: Option<Uuid>,
    pub forwarded_from: Option<Uuid>,
}

impl NewMessage {
    pub fn text(content: &str) -> Self {
        Self {
            content: content.to_string(),
            ..Default::default()
        }
    }

    pub fn replying_to(mut self, message_id: Uuid) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    /// Shape checks that need no store access.
    pub fn validate(&self) -> AppResult<()> {
        let has_media = self
            .media
            .as_ref()
            .map(|m| !m.url.trim().is_empty())
            .unwrap_or(false);

        if self.content.trim().is_empty() && !has_media {
            return Err(AppError::Validation(
                "Message needs content or a media reference".to_string(),
            ));
        }
        if self.content.chars().count() > MAX_CONTENT_LEN {
            return Err(AppError::Validation(format!(
                "Message content exceeds {} characters",
                MAX_CONTENT_LEN
            )));
        }
        if self.media.is_some() && !has_media {
            return Err(AppError::Validation("Media reference has no url".to_string()));
        }
        Ok(())
    }
}

/// Lifecycle of a message. `Pending` only exists before the first write;
/// deletion is tracked separately by `Message::is_deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "coverage", rename_all = "lowercase")]
pub enum MessageState {
    Pending,
    Persisted,
    Delivered(Coverage),
    Seen(Coverage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Coverage {
    Partial,
    Full,
}

impl Message {
    pub fn id_for(conversation_id: Uuid, sequence: u64) -> Uuid {
        let mut key = [0u8; 24];
        key[..16].copy_from_slice(conversation_id.as_bytes());
        key[16..].copy_from_slice(&sequence.to_be_bytes());
        Uuid::new_v5(&MESSAGE_NAMESPACE, &key)
    }

    pub fn new(conversation_id: Uuid, sender_id: Uuid, sequence: u64, payload: NewMessage) -> Self {
        let now = Utc::now();
        Self {
            id: Self::id_for(conversation_id, sequence),
            conversation_id,
            sender_id,
            sequence,
            content: payload.content,
            message_type: payload.message_type,
            media: payload.media,
            delivered_to: Vec::new(),
            seen_by: Vec::new(),
            reactions: Vec::new(),
            reply_to: payload.reply_to,
            forwarded_from: payload.forwarded_from,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Give the message a new sequence slot, keeping everything else.
    pub fn resequence(&mut self, sequence: u64) {
        self.sequence = sequence;
        self.id = Self::id_for(self.conversation_id, sequence);
    }

    /// Whether `other` is this very submission, as opposed to another message
    /// that landed on the same sequence.
    pub fn is_same_submission(&self, other: &Message) -> bool {
        self.id == other.id
            && self.sender_id == other.sender_id
            && self.created_at == other.created_at
            && self.content == other.content
    }

    /// One reaction per user: a second reaction replaces the first.
    /// Returns whether the reaction set changed.
    pub fn set_reaction(&mut self, user_id: Uuid, emoji: &str) -> bool {
        match self.reactions.iter_mut().find(|r| r.user_id == user_id) {
            Some(existing) if existing.emoji == emoji => false,
            Some(existing) => {
                existing.emoji = emoji.to_string();
                true
            }
            None => {
                self.reactions.push(Reaction {
                    user_id,
                    emoji: emoji.to_string(),
                });
                true
            }
        }
    }

    pub fn remove_reaction(&mut self, user_id: Uuid) -> bool {
        let before = self.reactions.len();
        self.reactions.retain(|r| r.user_id != user_id);
        self.reactions.len() != before
    }

    /// Clear content and media, keeping id, sequence and timestamps.
    /// Returns false when the message was already deleted.
    pub fn soft_delete(&mut self) -> bool {
        if self.is_deleted {
            return false;
        }
        self.is_deleted = true;
        self.content.clear();
        self.media = None;
        true
    }

    pub fn forwarded_copy(&self) -> NewMessage {
        NewMessage {
            content: self.content.clone(),
            message_type: self.message_type,
            media: self.media.clone(),
            reply_to: None,
            forwarded_from: Some(self.sender_id),
        }
    }
}

pub fn validate_emoji(emoji: &str) -> AppResult<()> {
    let len = emoji.chars().count();
    if emoji.trim().is_empty() || len > MAX_EMOJI_LEN {
        return Err(AppError::Validation("Invalid reaction emoji".to_string()));
    }
    Ok(())
}

/// The replied-to message, resolved on read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPreview {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub message_type: MessageType,
    pub is_deleted: bool,
}

impl From<&Message> for ReplyPreview {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            message_type: message.message_type,
            is_deleted: message.is_deleted,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub reply_preview: Option<ReplyPreview>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<MessageView>,
    pub has_more: bool,
    pub page: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message::new(Uuid::new_v4(), Uuid::new_v4(), 1, NewMessage::text("hello"))
    }

    #[test]
    fn test_second_reaction_replaces_first() {
        let mut msg = message();
        let user = Uuid::new_v4();

        assert!(msg.set_reaction(user, "👍"));
        assert!(msg.set_reaction(user, "😂"));
        assert!(!msg.set_reaction(user, "😂"));

        assert_eq!(msg.reactions.len(), 1);
        assert_eq!(msg.reactions[0].emoji, "😂");

        assert!(msg.remove_reaction(user));
        assert!(msg.reactions.is_empty());
    }

    #[test]
    fn test_soft_delete_keeps_identity() {
        let mut msg = message();
        msg.media = Some(MediaRef {
            url: "http://cdn/x.png".to_string(),
            thumbnail: None,
            file_name: None,
            file_size: None,
            duration: None,
        });
        let (id, seq, created, updated) = (msg.id, msg.sequence, msg.created_at, msg.updated_at);

        assert!(msg.soft_delete());
        assert!(!msg.soft_delete());
        assert!(msg.content.is_empty());
        assert!(msg.media.is_none());
        assert_eq!((msg.id, msg.sequence, msg.created_at, msg.updated_at), (id, seq, created, updated));
    }

    #[test]
    fn test_payload_validation() {
        assert!(NewMessage::text("hi").validate().is_ok());
        assert!(NewMessage::text("   ").validate().is_err());

        let media_only = NewMessage {
            message_type: MessageType::Image,
            media: Some(MediaRef {
                url: "http://cdn/p.jpg".to_string(),
                thumbnail: None,
                file_name: None,
                file_size: Some(10),
                duration: None,
            }),
            ..Default::default()
        };
        assert!(media_only.validate().is_ok());
    }

    #[test]
    fn test_message_type_parsing() {
        assert_eq!("voice".parse::<MessageType>().unwrap(), MessageType::Voice);
        assert!("sticker".parse::<MessageType>().is_err());
        assert_eq!(MessageType::Gif.to_string(), "gif");
    }

    #[test]
    fn test_id_follows_sequence() {
        let conv = Uuid::new_v4();
        assert_eq!(Message::id_for(conv, 7), Message::id_for(conv, 7));
        assert_ne!(Message::id_for(conv, 7), Message::id_for(conv, 8));

        let mut msg = Message::new(conv, Uuid::new_v4(), 7, NewMessage::text("x"));
        msg.resequence(9);
        assert_eq!(msg.id, Message::id_for(conv, 9));
    }
}
