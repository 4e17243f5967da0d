//! In-process broker double for connection tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_channel::mpsc::{unbounded, UnboundedReceiver};
use shopchat_client::config::{ConnectionConfig, ReconnectConfig};
use shopchat_client::ws::{
    ChatCallbacks, Connector, DisconnectReason, TransportEvent, TransportLink,
};
use shopchat_client::ChatError;
use shopchat_shared::{
    ChatMessage, Command, Frame, HEADER_DESTINATION, HEADER_ID, HEADER_MESSAGE,
    HEADER_SUBSCRIPTION,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const LOCAL_USER: i64 = 42;

pub fn config() -> ConnectionConfig {
    ConnectionConfig::new("http://broker.test", "token-42", LOCAL_USER)
}

/// Let spawned tasks run to quiescence.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

struct LinkEnds {
    frames: UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct BrokerState {
    activations: Vec<Instant>,
    failing: bool,
    delay: Option<Duration>,
    links: Vec<LinkEnds>,
    published: Vec<Frame>,
}

/// Counts activations, records every frame the client publishes, and lets a
/// test push frames or kill the current link.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    pub fn activations(&self) -> usize {
        self.lock().activations.len()
    }

    pub fn activation_times(&self) -> Vec<Instant> {
        self.lock().activations.clone()
    }

    /// Every frame published so far, across all links.
    pub fn published(&self) -> Vec<Frame> {
        let mut state = self.lock();
        let mut drained = Vec::new();
        for link in &mut state.links {
            while let Ok(Some(frame)) = link.frames.try_next() {
                drained.push(frame);
            }
        }
        state.published.extend(drained);
        state.published.clone()
    }

    pub fn published_commands(&self, command: Command) -> Vec<Frame> {
        self.published()
            .into_iter()
            .filter(|f| f.command == command)
            .collect()
    }

    pub fn subscriptions_to(&self, destination: &str) -> usize {
        self.published_commands(Command::Subscribe)
            .iter()
            .filter(|f| f.get(HEADER_DESTINATION) == Some(destination))
            .count()
    }

    /// SEND bodies in publish order.
    pub fn sent_bodies(&self) -> Vec<String> {
        self.published_commands(Command::Send)
            .into_iter()
            .map(|f| f.body)
            .collect()
    }

    fn subscription_id(&self, destination: &str) -> Option<String> {
        self.published_commands(Command::Subscribe)
            .iter()
            .rev()
            .find(|f| f.get(HEADER_DESTINATION) == Some(destination))
            .and_then(|f| f.get(HEADER_ID).map(str::to_string))
    }

    fn emit(&self, event: TransportEvent) {
        let state = self.lock();
        if let Some(link) = state.links.last() {
            let _ = link.events.send(event);
        }
    }

    /// Deliver a MESSAGE frame on `destination` over the current link.
    pub fn push(&self, destination: &str, body: &str) {
        let subscription = self
            .subscription_id(destination)
            .unwrap_or_else(|| "sub-unknown".to_string());
        let frame = Frame::new(Command::Message)
            .header(HEADER_SUBSCRIPTION, subscription)
            .header(HEADER_DESTINATION, destination)
            .body(body);
        self.emit(TransportEvent::Frame(frame));
    }

    pub fn push_error(&self, message: &str) {
        self.emit(TransportEvent::Frame(
            Frame::new(Command::Error).header(HEADER_MESSAGE, message),
        ));
    }

    pub fn drop_link(&self) {
        self.emit(TransportEvent::Closed("connection reset by test".to_string()));
    }
}

#[async_trait]
impl Connector for MockBroker {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<TransportLink, ChatError> {
        let delay = {
            let mut state = self.lock();
            state.activations.push(Instant::now());
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.lock().failing {
            return Err(ChatError::Transport("broker unavailable".to_string()));
        }

        let (outbound, frames) = unbounded();
        let (events, inbound) = mpsc::unbounded_channel();
        self.lock().links.push(LinkEnds { frames, events });
        Ok(TransportLink { outbound, inbound })
    }
}

/// Chat message JSON as the broker sends it.
pub fn message_json(id: &str, conversation_id: &str, sender: i64) -> String {
    format!(
        r#"{{"id":"{id}","conversationId":"{conversation_id}","sender":{{"userId":{sender},"name":"user{sender}"}},"message":"text {id}","createdDate":"2024-05-01T10:00:00Z"}}"#
    )
}

pub fn delete_json(message_id: &str) -> String {
    format!(r#"{{"type":"DELETE","messageId":"{message_id}"}}"#)
}

/// Collects everything the callbacks report.
#[derive(Clone, Default)]
pub struct Recorder {
    connects: Arc<Mutex<usize>>,
    disconnects: Arc<Mutex<Vec<DisconnectReason>>>,
    errors: Arc<Mutex<Vec<ChatError>>>,
    messages: Arc<Mutex<Vec<ChatMessage>>>,
}

impl Recorder {
    pub fn callbacks(&self) -> ChatCallbacks {
        let connects = self.connects.clone();
        let disconnects = self.disconnects.clone();
        let errors = self.errors.clone();
        let messages = self.messages.clone();
        ChatCallbacks::new()
            .on_connect(move || *connects.lock().unwrap() += 1)
            .on_disconnect(move |reason| disconnects.lock().unwrap().push(reason))
            .on_error(move |e| errors.lock().unwrap().push(e))
            .on_message(move |m| messages.lock().unwrap().push(m))
    }

    pub fn connects(&self) -> usize {
        *self.connects.lock().unwrap()
    }

    pub fn disconnects(&self) -> Vec<DisconnectReason> {
        self.disconnects.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<ChatError> {
        self.errors.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().unwrap().clone()
    }
}

/// Short delays so paused-clock tests stay readable.
pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        max_attempts: 5,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(60),
        refresh_delay: Duration::from_millis(50),
        ..Default::default()
    }
}
