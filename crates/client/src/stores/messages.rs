//! Conversation cache: the single source of truth the UI reads from.
//!
//! Messages are organized by conversation id. Each conversation tracks whether
//! its history has been loaded, whether it is stale, when it was last known
//! fresh, and an epoch that moves on every mutation so a slow history fetch
//! can tell it raced with live traffic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use shopchat_shared::{ChatMessage, ConversationInfo};
use tokio::time::Instant;

use crate::ws::{ChatCallbacks, MessageDeleted};

/// Messages for a single conversation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConversationMessages {
    /// All messages in this conversation, sorted by created_date ascending.
    pub messages: Vec<ChatMessage>,
    /// Whether the history has been fetched from the REST API.
    pub is_loaded: bool,
    /// Live traffic arrived while the conversation was not open, or a
    /// resync was discarded; the next sweep refetches it.
    pub is_stale: bool,
    pub last_refreshed: Option<Instant>,
    pub epoch: u64,
}

impl ConversationMessages {
    /// Add a message, maintaining sort order by created_date.
    /// Returns false if a message with the same ID already exists (deduplication).
    pub fn add_message(&mut self, msg: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == msg.id) {
            return false;
        }

        // Equal timestamps keep arrival order
        let pos = self
            .messages
            .partition_point(|m| m.created_date <= msg.created_date);

        self.messages.insert(pos, msg);
        self.epoch += 1;
        true
    }

    /// Returns false if no such message was cached.
    pub fn remove_message(&mut self, message_id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != message_id);
        let removed = self.messages.len() != before;
        if removed {
            self.epoch += 1;
        }
        removed
    }

    /// Replace the full history (from REST API fetch) and mark it fresh.
    pub fn set_history(&mut self, mut messages: Vec<ChatMessage>, now: Instant) {
        messages.sort_by(|a, b| a.created_date.cmp(&b.created_date));
        messages.dedup_by(|a, b| a.id == b.id);
        self.messages = messages;
        self.is_loaded = true;
        self.is_stale = false;
        self.last_refreshed = Some(now);
        self.epoch += 1;
    }

    fn is_stale_at(&self, now: Instant, stale_after: Duration) -> bool {
        !self.is_loaded
            || self.is_stale
            || self
                .last_refreshed
                .map_or(true, |t| now.saturating_duration_since(t) > stale_after)
    }
}

/// What [`ChatStore::apply_message`] did with an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageApplied {
    Appended,
    Duplicate,
    /// The conversation is not open; it was flagged for refetch instead.
    MarkedStale,
}

/// Outcome of a history refetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncOutcome {
    Applied,
    /// Live traffic changed the conversation while the fetch was in flight.
    Discarded,
}

#[derive(Debug, Default)]
pub struct ChatStore {
    conversations: HashMap<String, ConversationInfo>,
    messages: HashMap<String, ConversationMessages>,
    open: Option<String>,
}

impl ChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_conversation(&mut self, conversation_id: &str) {
        self.open = Some(conversation_id.to_string());
    }

    pub fn close_conversation(&mut self) {
        self.open = None;
    }

    pub fn open_conversation_id(&self) -> Option<&str> {
        self.open.as_deref()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<&ConversationInfo> {
        self.conversations.get(conversation_id)
    }

    pub fn conversations(&self) -> impl Iterator<Item = &ConversationInfo> {
        self.conversations.values()
    }

    pub fn messages(&self, conversation_id: &str) -> Option<&ConversationMessages> {
        self.messages.get(conversation_id)
    }

    /// Append to the open conversation (deduplicated by id); for any other
    /// conversation just flag it stale. Live traffic only counts as a refresh
    /// once the history is loaded.
    pub fn apply_message(&mut self, message: ChatMessage, now: Instant) -> MessageApplied {
        let is_open = self.open.as_deref() == Some(message.conversation_id.as_str());
        let entry = self
            .messages
            .entry(message.conversation_id.clone())
            .or_default();

        if !is_open {
            entry.is_stale = true;
            entry.epoch += 1;
            return MessageApplied::MarkedStale;
        }

        if entry.add_message(message) {
            if entry.is_loaded {
                entry.last_refreshed = Some(now);
            }
            MessageApplied::Appended
        } else {
            MessageApplied::Duplicate
        }
    }

    /// Remove a message wherever it is cached. A no-op when absent.
    pub fn apply_delete(&mut self, deleted: &MessageDeleted) -> bool {
        if let Some(entry) = self.messages.get_mut(&deleted.conversation_id) {
            if entry.remove_message(&deleted.message_id) {
                return true;
            }
        }
        self.messages
            .values_mut()
            .any(|entry| entry.remove_message(&deleted.message_id))
    }

    /// Insert or replace conversation metadata. Returns true for a
    /// conversation not seen before.
    pub fn upsert_conversation(&mut self, info: ConversationInfo) -> bool {
        self.conversations.insert(info.id.clone(), info).is_none()
    }

    /// Epoch to hand back to [`ChatStore::finish_resync`].
    pub fn begin_resync(&mut self, conversation_id: &str) -> u64 {
        self.messages
            .entry(conversation_id.to_string())
            .or_default()
            .epoch
    }

    /// Install fetched history unless the conversation moved on since
    /// `begin_resync`. A discarded result leaves it stale for the next sweep.
    pub fn finish_resync(
        &mut self,
        conversation_id: &str,
        epoch: u64,
        history: Vec<ChatMessage>,
        now: Instant,
    ) -> ResyncOutcome {
        let entry = self
            .messages
            .entry(conversation_id.to_string())
            .or_default();
        if entry.epoch != epoch {
            entry.is_stale = true;
            return ResyncOutcome::Discarded;
        }
        entry.set_history(history, now);
        ResyncOutcome::Applied
    }

    /// Subscribed conversations that need a refetch: flagged stale, never
    /// loaded, or not refreshed within `stale_after`.
    pub fn stale_conversations(
        &self,
        subscribed: &[String],
        now: Instant,
        stale_after: Duration,
    ) -> Vec<String> {
        subscribed
            .iter()
            .filter(|id| {
                self.messages
                    .get(id.as_str())
                    .map_or(true, |entry| entry.is_stale_at(now, stale_after))
            })
            .cloned()
            .collect()
    }
}

pub type SharedStore = Arc<Mutex<ChatStore>>;

pub fn lock_store(store: &SharedStore) -> MutexGuard<'_, ChatStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Callbacks that patch `store` from live traffic. `on_new_conversation`
/// fires for a conversation the store had not seen; chain further handlers
/// (`on_connect`, `on_error`, …) onto the returned record.
pub fn reconciling_callbacks(
    store: SharedStore,
    on_new_conversation: impl Fn(&ConversationInfo) + Send + Sync + 'static,
) -> ChatCallbacks {
    let for_messages = store.clone();
    let for_deletes = store.clone();

    ChatCallbacks::new()
        .on_message(move |message| {
            let id = message.id.clone();
            match lock_store(&for_messages).apply_message(message, Instant::now()) {
                MessageApplied::Duplicate => crate::log_debug!("Ignoring duplicate message {}", id),
                MessageApplied::MarkedStale => {
                    crate::log_debug!("Message {} for a background conversation", id)
                }
                MessageApplied::Appended => {}
            }
        })
        .on_message_deleted(move |deleted| {
            if !lock_store(&for_deletes).apply_delete(&deleted) {
                crate::log_debug!("Delete for uncached message {}", deleted.message_id);
            }
        })
        .on_conversation_update(move |info| {
            let is_new = lock_store(&store).upsert_conversation(info.clone());
            if is_new {
                on_new_conversation(&info);
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use shopchat_shared::SenderRef;

    fn msg(id: &str, conversation_id: &str, secs: i64) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            conversation_id: conversation_id.into(),
            sender: SenderRef {
                user_id: 7,
                name: "u".into(),
                avatar_url: None,
            },
            message: format!("body {id}"),
            created_date: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            kind: None,
            is_mine: false,
        }
    }

    #[test]
    fn duplicate_message_is_kept_once() {
        let mut store = ChatStore::new();
        store.open_conversation("c1");
        let now = Instant::now();

        assert_eq!(store.apply_message(msg("m1", "c1", 0), now), MessageApplied::Appended);
        assert_eq!(store.apply_message(msg("m1", "c1", 0), now), MessageApplied::Duplicate);
        assert_eq!(store.messages("c1").unwrap().messages.len(), 1);
    }

    #[test]
    fn messages_stay_sorted_by_timestamp() {
        let mut entry = ConversationMessages::default();
        entry.add_message(msg("b", "c1", 20));
        entry.add_message(msg("a", "c1", 10));
        entry.add_message(msg("c", "c1", 20));
        let ids: Vec<_> = entry.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn background_conversation_is_marked_stale() {
        let mut store = ChatStore::new();
        store.open_conversation("c1");
        let applied = store.apply_message(msg("m1", "c2", 0), Instant::now());
        assert_eq!(applied, MessageApplied::MarkedStale);

        let entry = store.messages("c2").unwrap();
        assert!(entry.is_stale);
        assert!(entry.messages.is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let mut store = ChatStore::new();
        store.open_conversation("c1");
        store.apply_message(msg("m1", "c1", 0), Instant::now());

        let deleted = MessageDeleted {
            message_id: "m1".into(),
            conversation_id: "c1".into(),
        };
        assert!(store.apply_delete(&deleted));
        assert!(!store.apply_delete(&deleted));
        assert!(store.messages("c1").unwrap().messages.is_empty());
    }

    #[test]
    fn upsert_reports_only_first_sighting() {
        let mut store = ChatStore::new();
        let info = ConversationInfo {
            id: "c1".into(),
            conversation_type: None,
            name: Some("Orders".into()),
            participants: vec![],
        };
        assert!(store.upsert_conversation(info.clone()));
        assert!(!store.upsert_conversation(ConversationInfo {
            name: Some("Renamed".into()),
            ..info
        }));
        assert_eq!(store.conversation("c1").unwrap().name.as_deref(), Some("Renamed"));
    }

    #[test]
    fn resync_racing_live_traffic_is_discarded() {
        let mut store = ChatStore::new();
        store.open_conversation("c1");
        let now = Instant::now();

        let epoch = store.begin_resync("c1");
        store.apply_message(msg("live", "c1", 5), now);
        let outcome = store.finish_resync("c1", epoch, vec![msg("old", "c1", 1)], now);

        assert_eq!(outcome, ResyncOutcome::Discarded);
        let entry = store.messages("c1").unwrap();
        assert!(entry.is_stale);
        assert_eq!(entry.messages.len(), 1);

        let epoch = store.begin_resync("c1");
        let outcome = store.finish_resync(
            "c1",
            epoch,
            vec![msg("old", "c1", 1), msg("live", "c1", 5)],
            now,
        );
        assert_eq!(outcome, ResyncOutcome::Applied);
        assert!(!store.messages("c1").unwrap().is_stale);
    }

    #[test]
    fn live_message_before_history_keeps_conversation_stale() {
        let mut store = ChatStore::new();
        store.open_conversation("c1");
        let t0 = Instant::now();

        assert_eq!(store.apply_message(msg("m1", "c1", 0), t0), MessageApplied::Appended);
        let entry = store.messages("c1").unwrap();
        assert!(!entry.is_loaded);
        assert_eq!(entry.last_refreshed, None);

        let subscribed = vec!["c1".to_string()];
        let stale_after = Duration::from_secs(60);
        assert_eq!(
            store.stale_conversations(&subscribed, t0 + Duration::from_secs(1), stale_after),
            subscribed
        );

        let epoch = store.begin_resync("c1");
        store.finish_resync("c1", epoch, vec![msg("m1", "c1", 0)], t0);
        store.apply_message(msg("m2", "c1", 5), t0 + Duration::from_secs(50));
        assert!(store
            .stale_conversations(&subscribed, t0 + Duration::from_secs(100), stale_after)
            .is_empty());
    }

    #[test]
    fn staleness_threshold() {
        let mut store = ChatStore::new();
        let t0 = Instant::now();
        let epoch = store.begin_resync("c1");
        store.finish_resync("c1", epoch, vec![], t0);

        let subscribed = vec!["c1".to_string(), "never-loaded".to_string()];
        let stale_after = Duration::from_secs(60);

        assert_eq!(
            store.stale_conversations(&subscribed, t0 + Duration::from_secs(30), stale_after),
            vec!["never-loaded".to_string()]
        );
        assert_eq!(
            store.stale_conversations(&subscribed, t0 + Duration::from_secs(61), stale_after),
            subscribed
        );
    }
}
