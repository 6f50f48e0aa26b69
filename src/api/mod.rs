//! Request/response access to the chat server.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Conversation, ConversationId, MessageId, ReactionGroup, UserId};

pub mod http;

pub use http::HttpServerApi;

#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Toggles `emoji` for `user_id` and returns the message's authoritative reaction list.
    async fn toggle_reaction(
        &self,
        message_id: &MessageId,
        emoji: &str,
        user_id: &UserId,
    ) -> Result<Vec<ReactionGroup>>;

    async fn unread_counts(&self) -> Result<HashMap<ConversationId, u32>>;

    async fn mark_read(&self, conversation: &Conversation) -> Result<()>;
}
