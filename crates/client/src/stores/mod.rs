//! Client-side cache kept in sync with the broker.

pub mod messages;
pub mod sweep;

pub use messages::{
    lock_store, reconciling_callbacks, ChatStore, ConversationMessages, MessageApplied,
    ResyncOutcome, SharedStore,
};
pub use sweep::{spawn_staleness_sweep, sweep_once};
