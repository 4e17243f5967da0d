//! Real-time transport: one STOMP-over-WebSocket session to the chat broker.
//!
//! This module provides:
//! - Connection management with auto-reconnect and exponential backoff
//! - A subscription registry (user inbox plus per-conversation topics)
//! - An outbound queue that holds actions while offline
//! - Frame routing into typed callbacks
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  ChatConnection                     │
//! │   (state, backoff, offline queue, subscriptions)    │
//! └─────────────────────────────────────────────────────┘
//!             │ Connector::connect         ▲ TransportEvent
//!             ▼                            │
//!   ┌──────────────────┐         ┌──────────────────┐
//!   │   write task     │         │    read task     │
//!   │ (frames, beats)  │         │  (STOMP decode)  │
//!   └──────────────────┘         └──────────────────┘
//!             │                            ▲
//!             └────────── WebSocket ───────┘
//!                                          │
//!                              ┌─────────────────────┐
//!                              │    FrameRouter      │
//!                              │ (classify, is_mine) │
//!                              └─────────────────────┘
//!                                          │
//!                                          ▼
//!                              ┌─────────────────────┐
//!                              │   ChatCallbacks     │
//!                              │ (e.g. ChatStore)    │
//!                              └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use shopchat_client::config::{ConnectionConfig, ReconnectConfig};
//! use shopchat_client::ws::{ChatCallbacks, ChatConnection};
//!
//! # async fn run() -> Result<(), shopchat_client::ChatError> {
//! let connection = ChatConnection::with_stomp(ReconnectConfig::default());
//! let config = ConnectionConfig::new("https://shop.example.com", "token", 42);
//!
//! connection
//!     .connect(config, ChatCallbacks::new().on_message(|m| println!("{}", m.message)))
//!     .await?;
//! connection.subscribe_conversation("17");
//! connection.send_message("17", "hello");
//! # Ok(())
//! # }
//! ```

mod callbacks;
mod connection;
mod queue;
mod router;
mod subscriptions;
mod transport;

pub use callbacks::{ChatCallbacks, DisconnectReason, MessageDeleted};
pub use connection::{ChatConnection, ConnectionState};
pub use queue::{apply, OutboundCommand, OutboundQueue};
pub use router::{FrameRouter, InboundEvent, InboundKind};
pub use subscriptions::{Subscription, SubscriptionRegistry, Topic};
pub use transport::{Connector, FrameSink, StompConnector, TransportEvent, TransportLink};
