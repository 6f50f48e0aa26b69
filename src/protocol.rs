//! Wire envelope of the real-time gateway.
//!
//! Every frame is a JSON text `{"event": <name>, "data": <payload>}` with
//! camelCase payload fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{
    Conversation, ConversationId, ConversationKind, ConversationRef, Message, MessageDeletion,
    MessageId, ReactionUpdate, UnreadCountUpdate,
};

pub mod events {
    pub const JOIN_CHANNEL: &str = "join-channel";
    pub const LEAVE_CHANNEL: &str = "leave-channel";
    pub const JOIN_DM: &str = "join-dm";
    pub const LEAVE_DM: &str = "leave-dm";
    pub const MESSAGE_READ: &str = "message-read";

    pub const NEW_MESSAGE: &str = "new-message";
    pub const MESSAGE_UPDATED: &str = "message-updated";
    pub const MESSAGE_DELETED: &str = "message-deleted";
    pub const REACTION_UPDATED: &str = "reaction-updated";
    pub const UNREAD_COUNT_UPDATE: &str = "unread-count-update";
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),

    #[error("invalid `{event}` payload: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Payload of `message-read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub message_ids: Vec<MessageId>,
    #[serde(flatten)]
    pub conversation: ConversationRef,
}

/// Frames the client emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientCommand {
    JoinChannel(ConversationId),
    LeaveChannel(ConversationId),
    JoinDm(ConversationId),
    LeaveDm(ConversationId),
    MessageRead(ReadReceipt),
}

impl ClientCommand {
    pub fn join(conversation: &Conversation) -> Self {
        match conversation.kind {
            ConversationKind::Channel => ClientCommand::JoinChannel(conversation.id.clone()),
            ConversationKind::Direct => ClientCommand::JoinDm(conversation.id.clone()),
        }
    }

    pub fn leave(conversation: &Conversation) -> Self {
        match conversation.kind {
            ConversationKind::Channel => ClientCommand::LeaveChannel(conversation.id.clone()),
            ConversationKind::Direct => ClientCommand::LeaveDm(conversation.id.clone()),
        }
    }

    pub fn message_read(conversation: &Conversation, message_id: MessageId) -> Self {
        ClientCommand::MessageRead(ReadReceipt {
            message_ids: vec![message_id],
            conversation: conversation.into(),
        })
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ClientCommand::JoinChannel(_) => events::JOIN_CHANNEL,
            ClientCommand::LeaveChannel(_) => events::LEAVE_CHANNEL,
            ClientCommand::JoinDm(_) => events::JOIN_DM,
            ClientCommand::LeaveDm(_) => events::LEAVE_DM,
            ClientCommand::MessageRead(_) => events::MESSAGE_READ,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames the server pushes that this crate acts on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    NewMessage(Message),
    MessageUpdated(Message),
    MessageDeleted(MessageDeletion),
    ReactionUpdated(ReactionUpdate),
    UnreadCountUpdate(UnreadCountUpdate),
}

impl ServerEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerEvent::NewMessage(_) => events::NEW_MESSAGE,
            ServerEvent::MessageUpdated(_) => events::MESSAGE_UPDATED,
            ServerEvent::MessageDeleted(_) => events::MESSAGE_DELETED,
            ServerEvent::ReactionUpdated(_) => events::REACTION_UPDATED,
            ServerEvent::UnreadCountUpdate(_) => events::UNREAD_COUNT_UPDATE,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Decodes one inbound frame.
///
/// Returns `Ok(None)` for well-formed frames carrying an event this crate does
/// not handle (typing, presence, ...).
pub fn decode_server_event(frame: &str) -> Result<Option<ServerEvent>, ProtocolError> {
    let Envelope { event, data } = serde_json::from_str(frame)?;

    let payload_error = |source: serde_json::Error| ProtocolError::InvalidPayload {
        event: event.clone(),
        source,
    };

    let decoded = match event.as_str() {
        events::NEW_MESSAGE => {
            ServerEvent::NewMessage(serde_json::from_value(data).map_err(payload_error)?)
        }
        events::MESSAGE_UPDATED => {
            ServerEvent::MessageUpdated(serde_json::from_value(data).map_err(payload_error)?)
        }
        events::MESSAGE_DELETED => {
            ServerEvent::MessageDeleted(serde_json::from_value(data).map_err(payload_error)?)
        }
        events::REACTION_UPDATED => {
            ServerEvent::ReactionUpdated(serde_json::from_value(data).map_err(payload_error)?)
        }
        events::UNREAD_COUNT_UPDATE => {
            ServerEvent::UnreadCountUpdate(serde_json::from_value(data).map_err(payload_error)?)
        }
        _ => return Ok(None),
    };

    Ok(Some(decoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ReactionAction, UserId};
    use serde_json::json;

    #[test]
    fn test_join_and_leave_commands_use_room_kind() {
        let channel = Conversation::channel("c1");
        let dm = Conversation::direct("d1");

        let join_channel: Value =
            serde_json::from_str(&ClientCommand::join(&channel).encode().unwrap()).unwrap();
        assert_eq!(join_channel, json!({"event": "join-channel", "data": "c1"}));

        let leave_dm: Value =
            serde_json::from_str(&ClientCommand::leave(&dm).encode().unwrap()).unwrap();
        assert_eq!(leave_dm, json!({"event": "leave-dm", "data": "d1"}));
    }

    #[test]
    fn test_message_read_payload_shape() {
        let command =
            ClientCommand::message_read(&Conversation::direct("d1"), MessageId::from("m5"));
        let value: Value = serde_json::from_str(&command.encode().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "event": "message-read",
                "data": {"messageIds": ["m5"], "dmConversationId": "d1"}
            })
        );
        assert_eq!(command.event_name(), events::MESSAGE_READ);
    }

    #[test]
    fn test_decode_reaction_updated() {
        let frame = json!({
            "event": "reaction-updated",
            "data": {
                "messageId": "m1",
                "action": "add",
                "userId": "u2",
                "reactions": [{"emoji": "👍", "count": 1, "userIds": ["u2"]}]
            }
        })
        .to_string();

        match decode_server_event(&frame).unwrap() {
            Some(ServerEvent::ReactionUpdated(update)) => {
                assert_eq!(update.action, ReactionAction::Add);
                assert_eq!(update.user_id, UserId::from("u2"));
            }
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_reaction_update_without_user() {
        let frame = json!({
            "event": "reaction-updated",
            "data": {"messageId": "m1", "action": "add", "reactions": []}
        })
        .to_string();

        assert!(matches!(
            decode_server_event(&frame),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_decode_ignores_unhandled_events() {
        let frame = json!({"event": "typing-start", "data": {"channelId": "c1"}}).to_string();
        assert!(decode_server_event(&frame).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_server_event("not json"),
            Err(ProtocolError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_server_event_encoding_matches_decoder() {
        let event = ServerEvent::UnreadCountUpdate(UnreadCountUpdate {
            conversation: ConversationRef::from(&Conversation::channel("c3")),
            unread_count: 4,
        });
        let decoded = decode_server_event(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, Some(event));
    }
}
