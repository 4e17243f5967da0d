//! Inbound frame classification and dispatch.
//!
//! Frames on the inbox topic are conversation updates. Frames on a
//! conversation topic are delete notices when `type == "DELETE"` and chat
//! messages otherwise. Chat messages get `is_mine` here and nowhere else.

use serde_json::Value;
use shopchat_shared::{ChatMessage, ConversationInfo, DeleteNotice, UserId, DELETE_FRAME_TYPE};

use super::callbacks::{ChatCallbacks, MessageDeleted};
use super::subscriptions::Topic;
use crate::error::ChatError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    Message(ChatMessage),
    Delete(MessageDeleted),
    ConversationUpdate(ConversationInfo),
}

/// A decoded frame, tagged with the topic it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub topic: Topic,
    pub kind: InboundKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRouter {
    local_user_id: UserId,
}

impl FrameRouter {
    pub fn new(local_user_id: UserId) -> Self {
        Self { local_user_id }
    }

    pub fn local_user_id(&self) -> UserId {
        self.local_user_id
    }

    /// Set `is_mine` from the sender id. Also used for history fetched over HTTP.
    pub fn tag(&self, mut message: ChatMessage) -> ChatMessage {
        message.is_mine = message.sender_id() == self.local_user_id;
        message
    }

    pub fn classify(&self, topic: &Topic, body: &str) -> Result<InboundEvent, ChatError> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| ChatError::MalformedFrame(format!("{topic}: {e}")))?;

        let kind = match topic {
            Topic::UserInbox(_) => InboundKind::ConversationUpdate(decode(topic, value)?),
            Topic::Conversation(conversation_id) => {
                let is_delete =
                    value.get("type").and_then(Value::as_str) == Some(DELETE_FRAME_TYPE);
                if is_delete {
                    let notice: DeleteNotice = decode(topic, value)?;
                    InboundKind::Delete(MessageDeleted {
                        message_id: notice.message_id,
                        conversation_id: conversation_id.clone(),
                    })
                } else {
                    InboundKind::Message(self.tag(decode(topic, value)?))
                }
            }
        };

        Ok(InboundEvent {
            topic: topic.clone(),
            kind,
        })
    }

    pub fn dispatch(&self, event: InboundEvent, callbacks: &ChatCallbacks) {
        match event.kind {
            InboundKind::Message(message) => callbacks.emit_message(message),
            InboundKind::Delete(deleted) => callbacks.emit_message_deleted(deleted),
            InboundKind::ConversationUpdate(info) => callbacks.emit_conversation_update(info),
        }
    }

    /// Classify and dispatch. Malformed payloads are logged and dropped.
    pub fn route(&self, topic: &Topic, body: &str, callbacks: &ChatCallbacks) -> bool {
        match self.classify(topic, body) {
            Ok(event) => {
                self.dispatch(event, callbacks);
                true
            }
            Err(e) => {
                crate::log_warn!("Dropping inbound frame: {}", e);
                false
            }
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(topic: &Topic, value: Value) -> Result<T, ChatError> {
    serde_json::from_value(value).map_err(|e| ChatError::MalformedFrame(format!("{topic}: {e}")))
}
