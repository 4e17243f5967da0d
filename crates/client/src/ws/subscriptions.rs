//! Subscription registry: at most one live subscription per topic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use shopchat_shared::{conversation_id_from_topic, conversation_topic, user_topic, Frame, UserId};

use super::transport::FrameSink;

/// A broker destination the client listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Per-user inbox carrying conversation updates.
    UserInbox(UserId),
    /// Per-conversation feed carrying messages and delete notices.
    Conversation(String),
}

impl Topic {
    pub fn conversation(conversation_id: impl Into<String>) -> Self {
        Topic::Conversation(conversation_id.into())
    }

    pub fn destination(&self) -> String {
        match self {
            Topic::UserInbox(user_id) => user_topic(*user_id),
            Topic::Conversation(id) => conversation_topic(id),
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Topic::Conversation(id) => Some(id),
            Topic::UserInbox(_) => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.destination())
    }
}

/// A live subscription and the STOMP id it was registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: Topic,
    pub id: String,
}

/// Topic → live subscription, plus the topics waiting for a link to come back.
///
/// Every mutating call takes the link it should speak on, so the registry can
/// never hold an entry that was not actually sent to the broker.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    active: BTreeMap<Topic, Subscription>,
    /// Conversation topics that were live when the link dropped.
    suspended: BTreeSet<Topic>,
    /// Topics between the two halves of a refresh.
    refreshing: BTreeSet<Topic>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe unless already subscribed. Returns true when a SUBSCRIBE was sent.
    pub fn subscribe(&mut self, link: &FrameSink, topic: Topic) -> bool {
        if self.active.contains_key(&topic) {
            crate::log_debug!("Already subscribed to {}", topic);
            return false;
        }

        self.next_id += 1;
        let id = format!("sub-{}", self.next_id);
        if let Err(e) = link.unbounded_send(Frame::subscribe(&id, &topic.destination())) {
            crate::log_warn!("Failed to subscribe to {}: {}", topic, e);
            return false;
        }

        crate::log_debug!("Subscribed to {} as {}", topic, id);
        self.suspended.remove(&topic);
        self.active.insert(topic.clone(), Subscription { topic, id });
        true
    }

    /// Unsubscribe if subscribed. Also cancels a pending refresh of `topic`.
    pub fn unsubscribe(&mut self, link: &FrameSink, topic: &Topic) -> bool {
        self.refreshing.remove(topic);
        self.suspended.remove(topic);
        let Some(sub) = self.active.remove(topic) else {
            return false;
        };
        if let Err(e) = link.unbounded_send(Frame::unsubscribe(&sub.id)) {
            crate::log_warn!("Failed to unsubscribe from {}: {}", topic, e);
        }
        crate::log_debug!("Unsubscribed from {}", topic);
        true
    }

    /// Offline unsubscribe: make sure the topic is not restored on reconnect.
    pub fn forget(&mut self, topic: &Topic) -> bool {
        let was_suspended = self.suspended.remove(topic);
        let was_refreshing = self.refreshing.remove(topic);
        was_suspended || was_refreshing
    }

    /// First half of a refresh: unsubscribe and remember the topic.
    pub fn begin_refresh(&mut self, link: &FrameSink, topic: &Topic) -> bool {
        if !self.unsubscribe(link, topic) {
            return false;
        }
        self.refreshing.insert(topic.clone());
        true
    }

    /// Second half of a refresh. A no-op if the topic was explicitly
    /// unsubscribed in between.
    pub fn finish_refresh(&mut self, link: &FrameSink, topic: &Topic) -> bool {
        if !self.refreshing.remove(topic) {
            return false;
        }
        self.subscribe(link, topic.clone())
    }

    /// Send UNSUBSCRIBE for everything and forget all state.
    pub fn unsubscribe_all(&mut self, link: &FrameSink) {
        for sub in self.active.values() {
            let _ = link.unbounded_send(Frame::unsubscribe(&sub.id));
        }
        self.clear();
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.suspended.clear();
        self.refreshing.clear();
    }

    /// The link dropped: broker-side subscriptions are gone. Conversation
    /// topics are kept for re-subscription; the inbox is re-added on connect.
    pub fn suspend(&mut self) {
        let topics = std::mem::take(&mut self.active).into_keys();
        self.suspended.extend(
            topics
                .chain(std::mem::take(&mut self.refreshing))
                .filter(|t| matches!(t, Topic::Conversation(_))),
        );
    }

    pub fn take_suspended(&mut self) -> Vec<Topic> {
        std::mem::take(&mut self.suspended).into_iter().collect()
    }

    /// Resolve an inbound MESSAGE to a live topic, by subscription id and
    /// falling back to the destination header.
    pub fn resolve(&self, subscription_id: Option<&str>, destination: Option<&str>) -> Option<Topic> {
        if let Some(id) = subscription_id {
            if let Some(sub) = self.active.values().find(|s| s.id == id) {
                return Some(sub.topic.clone());
            }
        }
        let destination = destination?;
        self.active
            .keys()
            .find(|t| match t {
                Topic::Conversation(id) => conversation_id_from_topic(destination) == Some(id.as_str()),
                Topic::UserInbox(_) => t.destination() == destination,
            })
            .cloned()
    }

    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        self.active.contains_key(topic)
    }

    /// Conversations with a live subscription.
    pub fn conversation_ids(&self) -> Vec<String> {
        self.active
            .keys()
            .filter_map(|t| t.conversation_id().map(str::to_string))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_channel::mpsc::{unbounded, UnboundedReceiver};
    use shopchat_shared::{Command, HEADER_DESTINATION, HEADER_ID};

    fn drain(rx: &mut UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Ok(Some(frame)) = rx.try_next() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn subscribe_twice_sends_one_frame() {
        let (tx, mut rx) = unbounded();
        let mut reg = SubscriptionRegistry::new();

        assert!(reg.subscribe(&tx, Topic::conversation("c1")));
        assert!(!reg.subscribe(&tx, Topic::conversation("c1")));

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, Command::Subscribe);
        assert_eq!(frames[0].get(HEADER_DESTINATION), Some("/topic/conversation.c1"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unsubscribe_unknown_is_noop() {
        let (tx, mut rx) = unbounded();
        let mut reg = SubscriptionRegistry::new();
        assert!(!reg.unsubscribe(&tx, &Topic::conversation("nope")));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn refresh_cancelled_by_explicit_unsubscribe() {
        let (tx, mut rx) = unbounded();
        let mut reg = SubscriptionRegistry::new();
        let topic = Topic::conversation("c1");

        reg.subscribe(&tx, topic.clone());
        assert!(reg.begin_refresh(&tx, &topic));
        reg.unsubscribe(&tx, &topic);
        assert!(!reg.finish_refresh(&tx, &topic));
        assert!(!reg.is_subscribed(&topic));

        let commands: Vec<_> = drain(&mut rx).into_iter().map(|f| f.command).collect();
        assert_eq!(commands, vec![Command::Subscribe, Command::Unsubscribe]);
    }

    #[test]
    fn suspend_keeps_conversations_only() {
        let (tx, _rx) = unbounded();
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe(&tx, Topic::UserInbox(42));
        reg.subscribe(&tx, Topic::conversation("c1"));
        reg.subscribe(&tx, Topic::conversation("c2"));

        reg.suspend();
        assert!(reg.is_empty());
        assert_eq!(
            reg.take_suspended(),
            vec![Topic::conversation("c1"), Topic::conversation("c2")]
        );
    }

    #[test]
    fn resolve_by_id_then_destination() {
        let (tx, mut rx) = unbounded();
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe(&tx, Topic::conversation("c1"));
        let id = drain(&mut rx)[0].get(HEADER_ID).unwrap().to_string();

        assert_eq!(reg.resolve(Some(&id), None), Some(Topic::conversation("c1")));
        assert_eq!(
            reg.resolve(Some("sub-999"), Some("/topic/conversation.c1")),
            Some(Topic::conversation("c1"))
        );
        assert_eq!(reg.resolve(None, Some("/topic/conversation.c2")), None);
    }
}
