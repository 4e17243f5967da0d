//! Outbound actions and the FIFO queue that holds them while offline.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use shopchat_shared::{
    ConversationType, CreateConversationBody, DeleteMessageBody, Frame, SendMessageBody, UserId,
    CREATE_CONVERSATION_DESTINATION, DELETE_MESSAGE_DESTINATION, SEND_MESSAGE_DESTINATION,
};

use super::transport::FrameSink;
use crate::error::ChatError;

/// An action the client publishes to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum OutboundCommand {
    #[serde(rename_all = "camelCase")]
    SendMessage {
        conversation_id: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    DeleteMessage { message_id: String },
    #[serde(rename_all = "camelCase")]
    CreateConversation {
        conversation_type: ConversationType,
        participant_ids: Vec<UserId>,
    },
}

impl OutboundCommand {
    pub fn destination(&self) -> &'static str {
        match self {
            OutboundCommand::SendMessage { .. } => SEND_MESSAGE_DESTINATION,
            OutboundCommand::DeleteMessage { .. } => DELETE_MESSAGE_DESTINATION,
            OutboundCommand::CreateConversation { .. } => CREATE_CONVERSATION_DESTINATION,
        }
    }

    /// Validate and build the SEND frame.
    pub fn to_frame(&self) -> Result<Frame, ChatError> {
        let body = match self {
            OutboundCommand::SendMessage {
                conversation_id,
                message,
            } => {
                if conversation_id.is_empty() {
                    return Err(ChatError::QueuedAction("send-message without conversation id".into()));
                }
                if message.trim().is_empty() {
                    return Err(ChatError::QueuedAction("send-message with empty body".into()));
                }
                serde_json::to_string(&SendMessageBody {
                    conversation_id: conversation_id.clone(),
                    message: message.clone(),
                })
            }
            OutboundCommand::DeleteMessage { message_id } => {
                if message_id.is_empty() {
                    return Err(ChatError::QueuedAction("delete-message without message id".into()));
                }
                serde_json::to_string(&DeleteMessageBody {
                    message_id: message_id.clone(),
                })
            }
            OutboundCommand::CreateConversation {
                conversation_type,
                participant_ids,
            } => {
                if participant_ids.is_empty() {
                    return Err(ChatError::QueuedAction(
                        "create-conversation without participants".into(),
                    ));
                }
                serde_json::to_string(&CreateConversationBody {
                    conversation_type: *conversation_type,
                    participant_ids: participant_ids.clone(),
                })
            }
        }
        .map_err(|e| ChatError::QueuedAction(format!("serialize failed: {e}")))?;

        Ok(Frame::send_json(self.destination(), body))
    }
}

impl fmt::Display for OutboundCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboundCommand::SendMessage { conversation_id, .. } => {
                write!(f, "send-message to {conversation_id}")
            }
            OutboundCommand::DeleteMessage { message_id } => write!(f, "delete-message {message_id}"),
            OutboundCommand::CreateConversation {
                conversation_type,
                participant_ids,
            } => write!(f, "create-conversation {conversation_type:?} with {participant_ids:?}"),
        }
    }
}

/// Publish one action on a live link.
///
/// `QueuedAction` means the action itself is bad; `Transport` means the link
/// is gone and the action should wait for the next one.
pub fn apply(link: &FrameSink, command: &OutboundCommand) -> Result<(), ChatError> {
    let frame = command.to_frame()?;
    link.unbounded_send(frame)
        .map_err(|_| ChatError::Transport("link closed".to_string()))
}

/// Actions waiting for a live link, in submission order.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    pending: VecDeque<OutboundCommand>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: OutboundCommand) {
        self.pending.push_back(command);
    }

    /// Publish everything in FIFO order. A bad action is logged and dropped
    /// without stopping the rest; a dead link stops the flush and leaves the
    /// remainder queued. Returns how many were sent.
    pub fn flush(&mut self, link: &FrameSink) -> usize {
        let mut sent = 0;
        while let Some(command) = self.pending.pop_front() {
            match apply(link, &command) {
                Ok(()) => sent += 1,
                Err(ChatError::Transport(e)) => {
                    crate::log_warn!("Flush interrupted ({}), {} action(s) stay queued", e, self.pending.len() + 1);
                    self.pending.push_front(command);
                    break;
                }
                Err(e) => crate::log_warn!("Dropping queued {}: {}", command, e),
            }
        }
        sent
    }

    /// Remove and return everything.
    pub fn drain(&mut self) -> Vec<OutboundCommand> {
        self.pending.drain(..).collect()
    }

    pub fn snapshot(&self) -> Vec<OutboundCommand> {
        self.pending.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_channel::mpsc::unbounded;
    use proptest::prelude::*;
    use shopchat_shared::HEADER_DESTINATION;

    fn send(conversation_id: &str, message: &str) -> OutboundCommand {
        OutboundCommand::SendMessage {
            conversation_id: conversation_id.into(),
            message: message.into(),
        }
    }

    #[test]
    fn flush_preserves_order_and_skips_bad_actions() {
        let (tx, mut rx) = unbounded();
        let mut queue = OutboundQueue::new();
        queue.push(send("c1", "A"));
        queue.push(send("c1", "   "));
        queue.push(send("c1", "B"));
        queue.push(OutboundCommand::DeleteMessage { message_id: "m9".into() });

        assert_eq!(queue.flush(&tx), 3);
        assert!(queue.is_empty());

        let mut bodies = Vec::new();
        while let Ok(Some(frame)) = rx.try_next() {
            bodies.push(frame.body);
        }
        assert_eq!(
            bodies,
            vec![
                r#"{"conversationId":"c1","message":"A"}"#,
                r#"{"conversationId":"c1","message":"B"}"#,
                r#"{"messageId":"m9"}"#,
            ]
        );
    }

    #[test]
    fn flush_on_closed_link_keeps_everything() {
        let (tx, rx) = unbounded::<Frame>();
        drop(rx);
        let mut queue = OutboundQueue::new();
        queue.push(send("c1", "A"));
        queue.push(send("c1", "B"));

        assert_eq!(queue.flush(&tx), 0);
        assert_eq!(queue.snapshot(), vec![send("c1", "A"), send("c1", "B")]);
    }

    #[test]
    fn frames_target_their_destination() {
        let create = OutboundCommand::CreateConversation {
            conversation_type: ConversationType::Direct,
            participant_ids: vec![7],
        };
        let frame = create.to_frame().unwrap();
        assert_eq!(frame.get(HEADER_DESTINATION), Some(CREATE_CONVERSATION_DESTINATION));
        assert_eq!(frame.body, r#"{"type":"DIRECT","participantIds":[7]}"#);

        let empty = OutboundCommand::CreateConversation {
            conversation_type: ConversationType::Group,
            participant_ids: vec![],
        };
        assert!(matches!(empty.to_frame(), Err(ChatError::QueuedAction(_))));
    }

    #[test]
    fn commands_serialize_as_tagged_variants() {
        let json = serde_json::to_value(send("c1", "hi")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "sendMessage", "payload": {"conversationId": "c1", "message": "hi"}})
        );
        let back: OutboundCommand = serde_json::from_value(json).unwrap();
        assert_eq!(back, send("c1", "hi"));
    }

    proptest! {
        #[test]
        fn flush_publishes_valid_actions_in_submission_order(
            messages in proptest::collection::vec("[a-z ]{0,6}", 0..20)
        ) {
            let (tx, mut rx) = unbounded();
            let mut queue = OutboundQueue::new();
            for m in &messages {
                queue.push(send("c1", m));
            }
            queue.flush(&tx);

            let mut published = Vec::new();
            while let Ok(Some(frame)) = rx.try_next() {
                let body: SendMessageBody = serde_json::from_str(&frame.body).unwrap();
                published.push(body.message);
            }
            let expected: Vec<String> = messages
                .into_iter()
                .filter(|m| !m.trim().is_empty())
                .collect();
            prop_assert_eq!(published, expected);
        }
    }
}
