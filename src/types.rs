use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Server-assigned identifier of a channel or direct conversation.
    ConversationId
);
string_id!(
    /// Server-assigned message identifier, unique across conversations.
    MessageId
);
string_id!(UserId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Channel,
    Direct,
}

/// A channel or direct conversation. Each one maps to exactly one broadcast room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
}

impl Conversation {
    pub fn channel(id: impl Into<ConversationId>) -> Self {
        Self {
            id: id.into(),
            kind: ConversationKind::Channel,
        }
    }

    pub fn direct(id: impl Into<ConversationId>) -> Self {
        Self {
            id: id.into(),
            kind: ConversationKind::Direct,
        }
    }
}

impl fmt::Display for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConversationKind::Channel => write!(f, "channel:{}", self.id),
            ConversationKind::Direct => write!(f, "dm:{}", self.id),
        }
    }
}

/// Wire form of a conversation reference: exactly one of the two ids is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dm_conversation_id: Option<ConversationId>,
}

impl ConversationRef {
    /// Returns `None` when the reference names no conversation or both kinds at once.
    pub fn resolve(&self) -> Option<Conversation> {
        match (&self.channel_id, &self.dm_conversation_id) {
            (Some(id), None) => Some(Conversation::channel(id.clone())),
            (None, Some(id)) => Some(Conversation::direct(id.clone())),
            _ => None,
        }
    }
}

impl From<&Conversation> for ConversationRef {
    fn from(conversation: &Conversation) -> Self {
        match conversation.kind {
            ConversationKind::Channel => Self {
                channel_id: Some(conversation.id.clone()),
                dm_conversation_id: None,
            },
            ConversationKind::Direct => Self {
                channel_id: None,
                dm_conversation_id: Some(conversation.id.clone()),
            },
        }
    }
}

/// Users who reacted to a message with one emoji.
///
/// `count` always equals the number of users in `user_ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: u32,
    pub user_ids: BTreeSet<UserId>,
}

impl ReactionGroup {
    pub fn new(emoji: impl Into<String>, users: impl IntoIterator<Item = UserId>) -> Self {
        let user_ids: BTreeSet<UserId> = users.into_iter().collect();
        Self {
            emoji: emoji.into(),
            count: user_ids.len() as u32,
            user_ids,
        }
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.user_ids.contains(user_id)
    }
}

/// Re-derives every count from its user set and drops empty groups.
pub fn normalize_reactions(groups: Vec<ReactionGroup>) -> Vec<ReactionGroup> {
    groups
        .into_iter()
        .filter(|group| !group.user_ids.is_empty())
        .map(|mut group| {
            group.count = group.user_ids.len() as u32;
            group
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    #[serde(flatten)]
    pub conversation: ConversationRef,
    pub author_id: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub reactions: Vec<ReactionGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeletion {
    pub id: MessageId,
    #[serde(flatten)]
    pub conversation: ConversationRef,
    #[serde(default = "default_true")]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Add,
    Remove,
}

impl fmt::Display for ReactionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactionAction::Add => f.write_str("add"),
            ReactionAction::Remove => f.write_str("remove"),
        }
    }
}

/// Authoritative reaction list of one message after some user's toggle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionUpdate {
    pub message_id: MessageId,
    pub action: ReactionAction,
    pub reactions: Vec<ReactionGroup>,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountUpdate {
    #[serde(flatten)]
    pub conversation: ConversationRef,
    pub unread_count: u32,
}

/// Opaque bearer credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<REDACTED>)")
    }
}
