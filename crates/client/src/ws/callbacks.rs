//! Connection lifecycle and inbound event callbacks.
//!
//! [`ChatCallbacks`] is an immutable record. The connection manager keeps it
//! behind a [`CallbackCell`]; `update_callbacks` swaps the whole record, and each
//! dispatch works from one snapshot, so a handler never sees a half-updated set.
//!
//! # Example
//!
//! ```rust,no_run
//! use shopchat_client::ws::ChatCallbacks;
//!
//! let callbacks = ChatCallbacks::new()
//!     .on_connect(|| tracing::info!("connected"))
//!     .on_disconnect(|reason| tracing::info!("disconnected: {reason}"))
//!     .on_message(|msg| tracing::info!("{}: {}", msg.sender.name, msg.message));
//! ```

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use shopchat_shared::{ChatMessage, ConversationInfo};

use crate::error::ChatError;

/// Why the connection went down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub message: String,
    /// True when the application called `disconnect()`; no reconnect follows.
    pub requested: bool,
}

impl DisconnectReason {
    pub fn requested() -> Self {
        Self {
            message: "client disconnect".to_string(),
            requested: true,
        }
    }

    pub fn dropped(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            requested: false,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// A delete notice, resolved to the conversation whose topic carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDeleted {
    pub message_id: String,
    pub conversation_id: String,
}

pub type OnConnectCallback = Arc<dyn Fn() + Send + Sync>;
pub type OnDisconnectCallback = Arc<dyn Fn(DisconnectReason) + Send + Sync>;
pub type OnErrorCallback = Arc<dyn Fn(ChatError) + Send + Sync>;
pub type OnMessageCallback = Arc<dyn Fn(ChatMessage) + Send + Sync>;
pub type OnMessageDeletedCallback = Arc<dyn Fn(MessageDeleted) + Send + Sync>;
pub type OnConversationUpdateCallback = Arc<dyn Fn(ConversationInfo) + Send + Sync>;

/// Handlers for connection lifecycle and inbound events. All optional.
#[derive(Clone, Default)]
pub struct ChatCallbacks {
    on_connect: Option<OnConnectCallback>,
    on_disconnect: Option<OnDisconnectCallback>,
    on_error: Option<OnErrorCallback>,
    on_message: Option<OnMessageCallback>,
    on_message_deleted: Option<OnMessageDeletedCallback>,
    on_conversation_update: Option<OnConversationUpdateCallback>,
}

impl ChatCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fired once per successful (re)connect, after the inbox topic is subscribed.
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    pub fn on_disconnect(mut self, f: impl Fn(DisconnectReason) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(ChatError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(ChatMessage) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_message_deleted(mut self, f: impl Fn(MessageDeleted) + Send + Sync + 'static) -> Self {
        self.on_message_deleted = Some(Arc::new(f));
        self
    }

    pub fn on_conversation_update(
        mut self,
        f: impl Fn(ConversationInfo) + Send + Sync + 'static,
    ) -> Self {
        self.on_conversation_update = Some(Arc::new(f));
        self
    }

    pub(crate) fn emit_connect(&self) {
        if let Some(f) = &self.on_connect {
            f();
        }
    }

    pub(crate) fn emit_disconnect(&self, reason: DisconnectReason) {
        if let Some(f) = &self.on_disconnect {
            f(reason);
        }
    }

    pub(crate) fn emit_error(&self, error: ChatError) {
        if let Some(f) = &self.on_error {
            f(error);
        }
    }

    pub(crate) fn emit_message(&self, message: ChatMessage) {
        if let Some(f) = &self.on_message {
            f(message);
        }
    }

    pub(crate) fn emit_message_deleted(&self, deleted: MessageDeleted) {
        if let Some(f) = &self.on_message_deleted {
            f(deleted);
        }
    }

    pub(crate) fn emit_conversation_update(&self, info: ConversationInfo) {
        if let Some(f) = &self.on_conversation_update {
            f(info);
        }
    }
}

impl fmt::Debug for ChatCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatCallbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_message_deleted", &self.on_message_deleted.is_some())
            .field("on_conversation_update", &self.on_conversation_update.is_some())
            .finish()
    }
}

/// Single indirection holding the current callback record.
#[derive(Default)]
pub(crate) struct CallbackCell {
    current: RwLock<Arc<ChatCallbacks>>,
}

impl CallbackCell {
    pub(crate) fn snapshot(&self) -> Arc<ChatCallbacks> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn replace(&self, callbacks: ChatCallbacks) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(callbacks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn snapshot_is_unaffected_by_later_replace() {
        let hits = Arc::new(AtomicUsize::new(0));
        let cell = CallbackCell::default();

        let h = hits.clone();
        cell.replace(ChatCallbacks::new().on_connect(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let before = cell.snapshot();

        cell.replace(ChatCallbacks::new());
        before.emit_connect();
        cell.snapshot().emit_connect();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
