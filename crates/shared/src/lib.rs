//! Wire-level types for the shopchat broker: STOMP frames, chat payloads and
//! REST error envelopes.

pub mod error;
pub mod models;
pub mod protocol;

pub use error::*;
pub use models::*;
pub use protocol::*;
