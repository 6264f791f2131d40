use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Message, User};

/// Namespace for deterministic direct-conversation ids.
const DIRECT_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_93a2_5e7d_4b0c_9a41_2f8e_d3b6_a015);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    /// Ordered participant ids; two for direct conversations.
    pub participants: Vec<Uuid>,
    #[serde(default)]
    pub group: Option<GroupInfo>,
    #[serde(default)]
    pub unread_counts: HashMap<Uuid, u64>,
    #[serde(default)]
    pub last_message_id: Option<Uuid>,
    /// Highest sequence number assigned in this conversation.
    #[serde(default)]
    pub last_sequence: u64,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub muted_by: Vec<Uuid>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Direct,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Conversation {
    /// Id of the direct conversation between two users, independent of argument order.
    pub fn direct_id(a: Uuid, b: Uuid) -> Uuid {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mut key = [0u8; 32];
        key[..16].copy_from_slice(lo.as_bytes());
        key[16..].copy_from_slice(hi.as_bytes());
        Uuid::new_v5(&DIRECT_NAMESPACE, &key)
    }

    pub fn new_direct(initiator: Uuid, other: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Self::direct_id(initiator, other),
            conversation_type: ConversationType::Direct,
            participants: vec![initiator, other],
            group: None,
            unread_counts: HashMap::from([(initiator, 0), (other, 0)]),
            last_message_id: None,
            last_sequence: 0,
            theme: None,
            emoji: None,
            muted_by: Vec::new(),
            created_by: initiator,
            created_at: now,
            updated_at: now,
        }
    }

    /// Group with the creator first, followed by the distinct remaining members.
    pub fn new_group(creator: Uuid, name: &str, members: &[Uuid], avatar_url: Option<String>) -> Self {
        let mut participants = vec![creator];
        for member in members {
            if !participants.contains(member) {
                participants.push(*member);
            }
        }

        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_type: ConversationType::Group,
            unread_counts: participants.iter().map(|p| (*p, 0)).collect(),
            participants,
            group: Some(GroupInfo {
                name: name.to_string(),
                avatar_url,
            }),
            last_message_id: None,
            last_sequence: 0,
            theme: None,
            emoji: None,
            muted_by: Vec::new(),
            created_by: creator,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_group(&self) -> bool {
        self.conversation_type == ConversationType::Group
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains(&user_id)
    }

    pub fn other_participants(&self, user_id: Uuid) -> impl Iterator<Item = Uuid> + '_ {
        self.participants
            .iter()
            .copied()
            .filter(move |p| *p != user_id)
    }

    pub fn unread_for(&self, user_id: Uuid) -> u64 {
        self.unread_counts.get(&user_id).copied().unwrap_or(0)
    }

    /// Advance the last-message pointer and bump unread for everyone but the sender.
    pub fn record_message(&mut self, message: &Message) {
        self.last_message_id = Some(message.id);
        self.last_sequence = self.last_sequence.max(message.sequence);
        self.updated_at = message.created_at;

        for participant in &self.participants {
            if *participant != message.sender_id {
                *self.unread_counts.entry(*participant).or_insert(0) += 1;
            }
        }
    }

    /// Reset the unread counter of one participant. Returns whether it changed.
    pub fn mark_read(&mut self, user_id: Uuid) -> bool {
        match self.unread_counts.get_mut(&user_id) {
            Some(count) if *count > 0 => {
                *count = 0;
                true
            }
            _ => false,
        }
    }

    /// Direct conversations may be removed by either side, groups only by their creator.
    pub fn can_delete(&self, user_id: Uuid) -> bool {
        match self.conversation_type {
            ConversationType::Direct => self.is_participant(user_id),
            ConversationType::Group => self.created_by == user_id,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSettings {
    pub theme: Option<String>,
    pub emoji: Option<String>,
    pub is_muted: Option<bool>,
}

/// A conversation as presented to one participant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub is_group: bool,
    pub participants: Vec<User>,
    pub group_name: Option<String>,
    pub group_avatar: Option<String>,
    pub unread_count: u64,
    pub last_message: Option<Message>,
    pub theme: Option<String>,
    pub emoji: Option<String>,
    pub is_muted: bool,
    pub updated_at: DateTime<Utc>,
}

impl ConversationView {
    pub fn new(
        conversation: &Conversation,
        viewer: Uuid,
        participants: Vec<User>,
        last_message: Option<Message>,
    ) -> Self {
        Self {
            id: conversation.id,
            conversation_type: conversation.conversation_type,
            is_group: conversation.is_group(),
            participants,
            group_name: conversation.group.as_ref().map(|g| g.name.clone()),
            group_avatar: conversation.group.as_ref().and_then(|g| g.avatar_url.clone()),
            unread_count: conversation.unread_for(viewer),
            last_message,
            theme: conversation.theme.clone(),
            emoji: conversation.emoji.clone(),
            is_muted: conversation.muted_by.contains(&viewer),
            updated_at: conversation.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMessage;

    #[test]
    fn test_direct_id_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(Conversation::direct_id(a, b), Conversation::direct_id(b, a));
        assert_ne!(Conversation::direct_id(a, b), Conversation::direct_id(a, Uuid::new_v4()));
    }

    #[test]
    fn test_group_deduplicates_members() {
        let creator = Uuid::new_v4();
        let member = Uuid::new_v4();
        let conv = Conversation::new_group(creator, "team", &[member, creator, member], None);
        assert_eq!(conv.participants, vec![creator, member]);
        assert!(conv.is_group());
    }

    #[test]
    fn test_record_message_bumps_everyone_but_sender() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let mut conv = Conversation::new_group(a, "trio", &[b, c], None);
        let message = Message::new(conv.id, a, 1, NewMessage::text("hi"));

        conv.record_message(&message);
        assert_eq!(conv.unread_for(a), 0);
        assert_eq!(conv.unread_for(b), 1);
        assert_eq!(conv.unread_for(c), 1);
        assert_eq!(conv.last_message_id, Some(message.id));
        assert_eq!(conv.last_sequence, 1);

        assert!(conv.mark_read(b));
        assert!(!conv.mark_read(b));
        assert_eq!(conv.unread_for(b), 0);
        assert_eq!(conv.unread_for(c), 1);
    }

    #[test]
    fn test_unread_counts_roundtrip_through_json() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut conv = Conversation::new_direct(a, b);
        conv.unread_counts.insert(b, 3);

        let value = serde_json::to_value(&conv).unwrap();
        let back: Conversation = serde_json::from_value(value).unwrap();
        assert_eq!(back.unread_for(b), 3);
        assert_eq!(back.conversation_type, ConversationType::Direct);
    }
}
