//! Client error taxonomy.
//!
//! Only a failed `connect()` surfaces one of these to a caller directly; every
//! other failure is logged and/or delivered to the `on_error` callback.

use shopchat_shared::{ApiError, FrameError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Socket-level failure. Triggers reconnection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Broker sent an ERROR frame or violated the frame protocol. Triggers reconnection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A single outbound action could not be sent; the rest of the queue continues.
    #[error("queued action failed: {0}")]
    QueuedAction(String),

    /// An inbound payload could not be understood; it was dropped.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Backoff gave up. Call `connect()` again to start over.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("a non-empty bearer credential is required")]
    MissingCredential,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The attempt was superseded by `disconnect()` or a newer `connect()`.
    #[error("connection attempt cancelled")]
    Cancelled,

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl ChatError {
    /// Whether the connection manager should schedule a reconnect after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ChatError::Transport(_) | ChatError::Protocol(_))
    }
}

impl From<FrameError> for ChatError {
    fn from(e: FrameError) -> Self {
        ChatError::MalformedFrame(e.to_string())
    }
}
