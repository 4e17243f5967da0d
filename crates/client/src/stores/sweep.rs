//! Periodic staleness sweep.
//!
//! Live delivery can stop without the socket reporting it (missed heart-beats,
//! a suspended laptop). While connected, each tick looks for subscribed
//! conversations whose cache has gone stale, refreshes their subscription and,
//! once re-subscribed, refetches their history.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::messages::{lock_store, ResyncOutcome, SharedStore};
use crate::api_client::ChatApi;
use crate::config::SweepConfig;
use crate::ws::{ChatConnection, Topic};

/// Run [`sweep_once`] every `config.interval` until the handle is aborted.
pub fn spawn_staleness_sweep(
    connection: ChatConnection,
    store: SharedStore,
    api: Arc<dyn ChatApi>,
    config: SweepConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep_once(&connection, &store, api.as_ref(), &config).await;
        }
    })
}

/// One sweep pass. History is fetched only after the topic is subscribed
/// again, so nothing published during the refresh gap is missed. Returns the
/// conversations whose history was installed.
pub async fn sweep_once(
    connection: &ChatConnection,
    store: &SharedStore,
    api: &dyn ChatApi,
    config: &SweepConfig,
) -> Vec<String> {
    if !connection.is_connected() {
        return Vec::new();
    }

    let subscribed = connection.subscribed_conversations();
    let stale = lock_store(store).stale_conversations(&subscribed, Instant::now(), config.stale_after);
    if stale.is_empty() {
        return stale;
    }
    crate::log_debug!("Resyncing {} stale conversation(s)", stale.len());

    let router = connection.router();
    let mut resynced = Vec::new();
    for conversation_id in &stale {
        let resubscribed = match connection.refresh(Topic::conversation(conversation_id.clone())) {
            Some(handle) => handle.await.unwrap_or(false),
            None => false,
        };
        if !resubscribed {
            crate::log_debug!(
                "Conversation {} was not re-subscribed, leaving it stale",
                conversation_id
            );
            continue;
        }

        let epoch = lock_store(store).begin_resync(conversation_id);
        match api.fetch_messages(conversation_id).await {
            Ok(history) => {
                let history = match router {
                    Some(router) => history.into_iter().map(|m| router.tag(m)).collect(),
                    None => history,
                };
                let outcome =
                    lock_store(store).finish_resync(conversation_id, epoch, history, Instant::now());
                match outcome {
                    ResyncOutcome::Applied => resynced.push(conversation_id.clone()),
                    ResyncOutcome::Discarded => crate::log_debug!(
                        "History for {} raced live traffic, retrying next sweep",
                        conversation_id
                    ),
                }
            }
            Err(e) => crate::log_warn!(
                "Resync of conversation {} failed: {}",
                conversation_id,
                e.user_message()
            ),
        }
    }
    resynced
}
