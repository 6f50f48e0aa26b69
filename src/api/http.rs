use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};

use super::ServerApi;
use crate::error::{ChatSyncError, Result};
use crate::types::{
    Conversation, ConversationId, ConversationRef, Credential, MessageId, ReactionGroup, UserId,
};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToggleReactionRequest<'a> {
    emoji: &'a str,
    user_id: &'a UserId,
}

#[derive(Deserialize)]
struct ToggleReactionResponse {
    reactions: Vec<ReactionGroup>,
}

/// [`ServerApi`] over HTTPS with a bearer credential.
#[derive(Clone)]
pub struct HttpServerApi {
    client: Client,
    base_url: Url,
    credential: Credential,
}

impl HttpServerApi {
    pub fn new(base_url: &str, credential: Credential) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| {
            ChatSyncError::Configuration(format!("invalid API base URL {}: {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ChatSyncError::Configuration(format!(
                "API base URL {} cannot be a base",
                base_url
            )));
        }
        Ok(Self {
            client: Client::builder().build()?,
            base_url,
            credential,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChatSyncError::Configuration("API base URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ChatSyncError::PermissionDenied(format!("{}: {}", status, body)))
            }
            _ => Err(ChatSyncError::Api {
                status: status.as_u16(),
                body,
            }),
        }
    }
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn toggle_reaction(
        &self,
        message_id: &MessageId,
        emoji: &str,
        user_id: &UserId,
    ) -> Result<Vec<ReactionGroup>> {
        let url = self.endpoint(&["messages", message_id.as_str(), "reactions"])?;
        tracing::debug!(
            target: "chatsync::api::http::toggle_reaction",
            %message_id,
            emoji,
            "POST reaction toggle"
        );

        let response = self
            .client
            .post(url)
            .bearer_auth(self.credential.expose())
            .json(&ToggleReactionRequest { emoji, user_id })
            .send()
            .await?;
        let body: ToggleReactionResponse = Self::check(response).await?.json().await?;
        Ok(body.reactions)
    }

    async fn unread_counts(&self) -> Result<HashMap<ConversationId, u32>> {
        let url = self.endpoint(&["users", "unread-counts"])?;
        let response = self
            .client
            .get(url)
            .bearer_auth(self.credential.expose())
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn mark_read(&self, conversation: &Conversation) -> Result<()> {
        let url = self.endpoint(&["messages", "read"])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(self.credential.expose())
            .json(&ConversationRef::from(conversation))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

impl fmt::Debug for HttpServerApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServerApi")
            .field("base_url", &self.base_url.as_str())
            .field("credential", &"<REDACTED>")
            .finish()
    }
}
