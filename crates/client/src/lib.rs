//! Shopchat client - real-time chat transport and cache sync
//!
//! This crate contains the STOMP-over-WebSocket connection to the storefront's
//! chat broker, the cache that live frames reconcile into, and a small demo
//! binary that drives both from stdin.

pub mod api_client;
pub mod config;
pub mod error;
pub mod logging;
pub mod stores;
pub mod ws;

pub use api_client::{ApiClient, ChatApi};
pub use config::{ChatConfig, ConnectionConfig, DisconnectPolicy, ReconnectConfig, SweepConfig};
pub use error::ChatError;
pub use stores::{ChatStore, SharedStore};
pub use ws::{ChatCallbacks, ChatConnection, ConnectionState};
