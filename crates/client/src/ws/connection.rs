//! Connection manager with state tracking and auto-reconnect.
//!
//! [`ChatConnection`] owns the one broker session a client has. `connect()` is
//! idempotent: concurrent callers join the same attempt, and a caller with the
//! same identity gets an immediate `Ok` while connected. A dropped link goes
//! through exponential backoff until it reconnects or gives up. Actions sent
//! while offline wait in a FIFO queue that flushes on the next connect.
//!
//! All mutable state sits behind one mutex. Callbacks are collected while it is
//! held and fired after it is released, so a handler can call straight back
//! into the connection.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use shopchat_shared::{
    Command, ConversationType, Frame, UserId, HEADER_DESTINATION, HEADER_MESSAGE,
    HEADER_SUBSCRIPTION,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::callbacks::{CallbackCell, ChatCallbacks, DisconnectReason};
use super::queue::{self, OutboundCommand, OutboundQueue};
use super::router::FrameRouter;
use super::subscriptions::{SubscriptionRegistry, Topic};
use super::transport::{Connector, FrameSink, StompConnector, TransportEvent, TransportLink};
use crate::config::{ConnectionConfig, DisconnectPolicy, ReconnectConfig};
use crate::error::ChatError;

/// Connection state for the broker session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), ChatError>>>;

/// Handle to the broker session. Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct ChatConnection {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    reconnect: ReconnectConfig,
    callbacks: CallbackCell,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Session>,
}

#[derive(Default)]
struct Session {
    config: Option<ConnectionConfig>,
    /// Bumped whenever a link is attached, lost or released. Tasks capture it
    /// and go quiet once it moves on.
    generation: u64,
    attempt: u32,
    /// Set by `disconnect()`; cleared by `connect()`.
    stopped: bool,
    in_flight: Option<ConnectAttempt>,
    link: Option<FrameSink>,
    pump: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    registry: SubscriptionRegistry,
    queue: OutboundQueue,
}

enum Notice {
    Connected,
    Disconnected(DisconnectReason),
    Error(ChatError),
}

impl ChatConnection {
    pub fn new(connector: Arc<dyn Connector>, reconnect: ReconnectConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                reconnect,
                callbacks: CallbackCell::default(),
                state,
                session: Mutex::new(Session::default()),
            }),
        }
    }

    /// Connection over the real STOMP/WebSocket transport.
    pub fn with_stomp(reconnect: ReconnectConfig) -> Self {
        Self::new(Arc::new(StompConnector::new(&reconnect)), reconnect)
    }

    /// Open the session, or join the attempt already in progress.
    ///
    /// Resolves once the inbox topic is subscribed and the offline queue is
    /// flushed. On failure the error is also reported to `on_error` and a
    /// reconnect is scheduled when the error is recoverable.
    pub async fn connect(
        &self,
        config: ConnectionConfig,
        callbacks: ChatCallbacks,
    ) -> Result<(), ChatError> {
        config.validate()?;
        self.inner.callbacks.replace(callbacks);

        let attempt = {
            let mut session = self.inner.lock();
            let same_identity = session.config.as_ref() == Some(&config);

            if same_identity && session.link.is_some() {
                crate::log_debug!("Already connected as user {}", config.user_id);
                return Ok(());
            }

            let joinable = if same_identity {
                session.in_flight.clone()
            } else {
                None
            };

            match joinable {
                Some(in_flight) => in_flight,
                None => {
                    if !same_identity {
                        if session.config.is_some() {
                            crate::log_info!("Identity changed, releasing previous session");
                            let dropped = session.queue.drain();
                            if !dropped.is_empty() {
                                crate::log_warn!(
                                    "Dropping {} action(s) queued by the previous identity",
                                    dropped.len()
                                );
                            }
                        }
                        self.inner.release(&mut session);
                        session.config = Some(config.clone());
                    } else if let Some(retry) = session.retry.take() {
                        retry.abort();
                    }
                    session.stopped = false;
                    session.attempt = 0;
                    self.inner.start_attempt(&mut session, config)
                }
            }
        };

        attempt.await
    }

    /// Tear the session down. Never reconnects on its own afterwards.
    ///
    /// Returns the actions that were still queued. With
    /// [`DisconnectPolicy::Discard`] they are gone from the queue; with
    /// [`DisconnectPolicy::Preserve`] they stay and flush on the next connect.
    pub fn disconnect(&self) -> Vec<OutboundCommand> {
        let mut notices = Vec::new();
        let pending = {
            let mut session = self.inner.lock();
            session.stopped = true;
            session.attempt = 0;
            if self.inner.release(&mut session) {
                crate::log_info!("Disconnected");
                notices.push(Notice::Disconnected(DisconnectReason::requested()));
            }

            let pending = match self.inner.reconnect.disconnect_policy {
                DisconnectPolicy::Discard => session.queue.drain(),
                DisconnectPolicy::Preserve => session.queue.snapshot(),
            };
            if !pending.is_empty() {
                crate::log_info!(
                    "{} queued action(s) at disconnect ({:?})",
                    pending.len(),
                    self.inner.reconnect.disconnect_policy
                );
            }
            self.inner.set_state(ConnectionState::Disconnected);
            pending
        };
        self.inner.fire(notices);
        pending
    }

    /// Swap the callback record without touching the connection.
    pub fn update_callbacks(&self, callbacks: ChatCallbacks) {
        self.inner.callbacks.replace(callbacks);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().link.is_some()
    }

    /// Identity-tagging router for the configured user.
    pub fn router(&self) -> Option<FrameRouter> {
        self.inner
            .lock()
            .config
            .as_ref()
            .map(|c| FrameRouter::new(c.user_id))
    }

    pub fn local_user_id(&self) -> Option<UserId> {
        self.inner.lock().config.as_ref().map(|c| c.user_id)
    }

    // --- Subscriptions ---

    /// Subscribe to a conversation topic. Ignored while disconnected.
    pub fn subscribe_conversation(&self, conversation_id: &str) -> bool {
        let mut session = self.inner.lock();
        let Some(link) = session.link.clone() else {
            crate::log_debug!(
                "Not connected, ignoring subscribe to conversation {}",
                conversation_id
            );
            return false;
        };
        session
            .registry
            .subscribe(&link, Topic::conversation(conversation_id))
    }

    pub fn unsubscribe_conversation(&self, conversation_id: &str) -> bool {
        let topic = Topic::conversation(conversation_id);
        let mut session = self.inner.lock();
        match session.link.clone() {
            Some(link) => session.registry.unsubscribe(&link, &topic),
            None => session.registry.forget(&topic),
        }
    }

    /// Unsubscribe, then re-subscribe after `refresh_delay`. The broker
    /// replays nothing, so callers refetch history over HTTP once the
    /// returned handle resolves to `true`. `None` when there was nothing to
    /// refresh.
    pub fn refresh(&self, topic: Topic) -> Option<JoinHandle<bool>> {
        let generation = {
            let mut session = self.inner.lock();
            let Some(link) = session.link.clone() else {
                crate::log_debug!("Not connected, skipping refresh of {}", topic);
                return None;
            };
            if !session.registry.begin_refresh(&link, &topic) {
                crate::log_debug!("Not subscribed to {}, nothing to refresh", topic);
                return None;
            }
            session.generation
        };

        let inner = Arc::clone(&self.inner);
        let delay = self.inner.reconnect.refresh_delay;
        Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut session = inner.lock();
            if session.generation != generation {
                return false;
            }
            match session.link.clone() {
                Some(link) => session.registry.finish_refresh(&link, &topic),
                None => false,
            }
        }))
    }

    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        self.inner.lock().registry.is_subscribed(topic)
    }

    pub fn subscribed_conversations(&self) -> Vec<String> {
        self.inner.lock().registry.conversation_ids()
    }

    // --- Outbound actions ---

    /// Publish now if connected, otherwise queue and kick off a connect.
    ///
    /// This also applies after the connection gave up: once the state is
    /// [`ConnectionState::Failed`] (including after
    /// [`ChatError::ReconnectExhausted`]), submitting starts a fresh connect
    /// cycle with the retry counter reset, using the config from the last
    /// [`ChatConnection::connect`]. Only [`ChatConnection::disconnect`] stops
    /// this; afterwards actions are queued until the next `connect`.
    pub fn submit(&self, command: OutboundCommand) {
        let mut session = self.inner.lock();
        if let Some(link) = &session.link {
            match queue::apply(link, &command) {
                Ok(()) => return,
                // Link is going away; the drop handler reconnects.
                Err(ChatError::Transport(_)) => {}
                Err(e) => {
                    crate::log_warn!("Dropping {}: {}", command, e);
                    return;
                }
            }
        }

        crate::log_debug!("Queueing {} until connected", command);
        session.queue.push(command);

        let idle = session.link.is_none()
            && session.in_flight.is_none()
            && session.retry.is_none()
            && !session.stopped;
        if let (true, Some(config)) = (idle, session.config.clone()) {
            session.attempt = 0;
            // The attempt runs on its own task; nothing here needs its result.
            let _ = self.inner.start_attempt(&mut session, config);
        }
    }

    pub fn send_message(&self, conversation_id: &str, message: &str) {
        self.submit(OutboundCommand::SendMessage {
            conversation_id: conversation_id.to_string(),
            message: message.to_string(),
        });
    }

    pub fn delete_message(&self, message_id: &str) {
        self.submit(OutboundCommand::DeleteMessage {
            message_id: message_id.to_string(),
        });
    }

    pub fn create_conversation(&self, conversation_type: ConversationType, participant_ids: Vec<UserId>) {
        self.submit(OutboundCommand::CreateConversation {
            conversation_type,
            participant_ids,
        });
    }

    /// Actions waiting for a link, oldest first.
    pub fn queued(&self) -> Vec<OutboundCommand> {
        self.inner.lock().queue.snapshot()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state.clone());
        if previous != state {
            crate::log_info!("Connection state {:?} -> {:?}", previous, state);
        }
    }

    fn fire(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let callbacks = self.callbacks.snapshot();
        for notice in notices {
            match notice {
                Notice::Connected => callbacks.emit_connect(),
                Notice::Disconnected(reason) => callbacks.emit_disconnect(reason),
                Notice::Error(error) => callbacks.emit_error(error),
            }
        }
    }

    /// Invalidate everything tied to the current link. Returns true if a
    /// live link was closed.
    fn release(&self, session: &mut Session) -> bool {
        session.generation += 1;
        session.in_flight = None;
        if let Some(retry) = session.retry.take() {
            retry.abort();
        }
        if let Some(pump) = session.pump.take() {
            pump.abort();
        }
        match session.link.take() {
            Some(link) => {
                session.registry.unsubscribe_all(&link);
                let receipt = format!("disconnect-{}", uuid::Uuid::new_v4());
                let _ = link.unbounded_send(Frame::disconnect(&receipt));
                true
            }
            None => {
                session.registry.clear();
                false
            }
        }
    }

    fn start_attempt(self: &Arc<Self>, session: &mut Session, config: ConnectionConfig) -> ConnectAttempt {
        self.set_state(if session.attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting {
                attempt: session.attempt,
            }
        });

        let task = tokio::spawn(Arc::clone(self).establish(session.generation, config));
        let attempt = async move {
            task.await
                .unwrap_or_else(|e| Err(ChatError::Transport(format!("connect task failed: {e}"))))
        }
        .boxed()
        .shared();

        session.in_flight = Some(attempt.clone());
        attempt
    }

    async fn establish(self: Arc<Self>, generation: u64, config: ConnectionConfig) -> Result<(), ChatError> {
        let result = self.connector.connect(&config).await;

        let mut notices = Vec::new();
        let outcome = {
            let mut session = self.lock();
            if session.generation != generation {
                crate::log_debug!("Discarding superseded connection attempt");
                Err(ChatError::Cancelled)
            } else {
                session.in_flight = None;
                match result {
                    Ok(link) => {
                        self.attach(&mut session, link, &config, &mut notices);
                        Ok(())
                    }
                    Err(e) => {
                        crate::log_error!("Connection to {} failed: {}", config.endpoint, e);
                        self.set_state(ConnectionState::Disconnected);
                        notices.push(Notice::Error(e.clone()));
                        if e.is_recoverable() {
                            self.schedule_reconnect(&mut session, &mut notices);
                        }
                        Err(e)
                    }
                }
            }
        };

        self.fire(notices);
        outcome
    }

    /// Inbox first, then topics that survived a drop, then the queue.
    fn attach(
        self: &Arc<Self>,
        session: &mut Session,
        link: TransportLink,
        config: &ConnectionConfig,
        notices: &mut Vec<Notice>,
    ) {
        let TransportLink { outbound, inbound } = link;
        session.generation += 1;
        session.attempt = 0;

        session
            .registry
            .subscribe(&outbound, Topic::UserInbox(config.user_id));
        for topic in session.registry.take_suspended() {
            session.registry.subscribe(&outbound, topic);
        }

        let flushed = session.queue.flush(&outbound);
        if flushed > 0 {
            crate::log_info!("Flushed {} queued action(s)", flushed);
        }

        let router = FrameRouter::new(config.user_id);
        session.pump = Some(tokio::spawn(Arc::clone(self).pump(
            session.generation,
            inbound,
            router,
        )));
        session.link = Some(outbound);

        crate::log_info!("Connected to {} as user {}", config.endpoint, config.user_id);
        self.set_state(ConnectionState::Connected);
        notices.push(Notice::Connected);
    }

    async fn pump(
        self: Arc<Self>,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
        router: FrameRouter,
    ) {
        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Frame(frame) => match frame.command {
                    Command::Message => self.deliver(generation, &router, &frame),
                    Command::Error => {
                        let reason = frame
                            .get(HEADER_MESSAGE)
                            .unwrap_or(frame.body.as_str())
                            .to_string();
                        crate::log_error!("Broker sent ERROR: {}", reason);
                        self.link_lost(generation, Some(ChatError::Protocol(reason.clone())), reason);
                        return;
                    }
                    other => crate::log_debug!("Ignoring inbound {} frame", other),
                },
                TransportEvent::Closed(reason) => {
                    self.link_lost(generation, None, reason);
                    return;
                }
                TransportEvent::Failed(error) => {
                    let reason = error.to_string();
                    self.link_lost(generation, Some(error), reason);
                    return;
                }
            }
        }
        self.link_lost(generation, None, "transport ended".to_string());
    }

    fn deliver(&self, generation: u64, router: &FrameRouter, frame: &Frame) {
        let topic = {
            let session = self.lock();
            if session.generation != generation {
                return;
            }
            session
                .registry
                .resolve(frame.get(HEADER_SUBSCRIPTION), frame.get(HEADER_DESTINATION))
        };

        match topic {
            Some(topic) => {
                router.route(&topic, &frame.body, &self.callbacks.snapshot());
            }
            None => crate::log_debug!(
                "Dropping frame for inactive subscription {:?}",
                frame.get(HEADER_SUBSCRIPTION)
            ),
        }
    }

    fn link_lost(self: &Arc<Self>, generation: u64, error: Option<ChatError>, reason: String) {
        let mut notices = Vec::new();
        {
            let mut session = self.lock();
            if session.generation != generation {
                return;
            }
            crate::log_warn!("Connection lost: {}", reason);
            session.generation += 1;
            session.link = None;
            session.pump = None;
            session.registry.suspend();
            self.set_state(ConnectionState::Disconnected);

            if let Some(error) = error {
                notices.push(Notice::Error(error));
            }
            notices.push(Notice::Disconnected(DisconnectReason::dropped(reason)));
            self.schedule_reconnect(&mut session, &mut notices);
        }
        self.fire(notices);
    }

    /// Next backoff step, or `Failed` once `max_attempts` is used up.
    fn schedule_reconnect(self: &Arc<Self>, session: &mut Session, notices: &mut Vec<Notice>) {
        session.attempt += 1;
        let attempt = session.attempt;
        let max = self.reconnect.max_attempts;

        if attempt > max {
            let error = ChatError::ReconnectExhausted { attempts: max };
            crate::log_warn!("{}", error);
            self.set_state(ConnectionState::Failed {
                reason: error.to_string(),
            });
            notices.push(Notice::Error(error));
            return;
        }

        let delay = self.reconnect.delay_for_attempt(attempt);
        crate::log_info!("Reconnecting in {:?} (attempt {}/{})", delay, attempt, max);
        self.set_state(ConnectionState::Reconnecting { attempt });

        let generation = session.generation;
        let inner = Arc::clone(self);
        session.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let attempt = {
                let mut session = inner.lock();
                if session.generation != generation
                    || session.link.is_some()
                    || session.in_flight.is_some()
                {
                    return;
                }
                session.retry = None;
                let Some(config) = session.config.clone() else {
                    return;
                };
                inner.start_attempt(&mut session, config)
            };
            let _ = attempt.await;
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_predicates() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Reconnecting { attempt: 2 }.is_connecting());
        assert!(!ConnectionState::Failed { reason: "x".into() }.is_connecting());
    }
}
