//! Shopchat Client - demo entry point
//!
//! Connects to the chat broker with credentials from the environment and
//! drives the connection from stdin:
//!
//! ```text
//! /list                 list conversations
//! /open <id>            open a conversation (subscribe + load history)
//! /close                close the open conversation
//! /send <text>          send to the open conversation
//! /delete <message-id>  delete a message
//! /new <id>[,<id>...]   create a conversation with the given users
//! /search <text>        search messages
//! /quit                 disconnect and exit
//! ```

use std::sync::{Arc, Mutex};

use anyhow::Context;
use shopchat_client::stores::{lock_store, reconciling_callbacks, spawn_staleness_sweep, MessageApplied};
use shopchat_client::{ApiClient, ChatApi, ChatConfig, ChatConnection, ChatStore, SharedStore};
use shopchat_shared::{ConversationType, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("shopchat_client=debug")),
        )
        .init();

    let config = ChatConfig::from_env().context("reading SHOPCHAT_* configuration")?;
    let api: Arc<dyn ChatApi> = Arc::new(
        ApiClient::new()
            .with_base_url(&config.api_base)
            .with_token(&config.connection.credential),
    );
    let store: SharedStore = Arc::new(Mutex::new(ChatStore::new()));
    let connection = ChatConnection::with_stomp(config.reconnect.clone());

    let callbacks = reconciling_callbacks(store.clone(), |info| {
        tracing::info!(
            "New conversation {} ({})",
            info.id,
            info.name.as_deref().unwrap_or("unnamed")
        );
    })
    .on_connect(|| tracing::info!("Connected"))
    .on_disconnect(|reason| tracing::info!("Disconnected: {}", reason))
    .on_error(|e| tracing::warn!("Chat error: {}", e));

    // Replaces the store's message handler so new messages are echoed too.
    let echo_store = store.clone();
    let callbacks = callbacks.on_message(move |message| {
        let line = format!(
            "[{}] {}: {}",
            message.id,
            if message.is_mine { "me" } else { message.sender.name.as_str() },
            message.message
        );
        if lock_store(&echo_store).apply_message(message, Instant::now()) == MessageApplied::Appended {
            println!("{line}");
        }
    });

    connection
        .connect(config.connection.clone(), callbacks)
        .await
        .context("connecting to chat broker")?;

    let sweep = spawn_staleness_sweep(connection.clone(), store.clone(), api.clone(), config.sweep.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
        let arg = arg.trim();

        match command {
            "/list" => match api.fetch_conversations().await {
                Ok(conversations) => {
                    let mut store = lock_store(&store);
                    for info in conversations {
                        println!("{}  {}", info.id, info.name.as_deref().unwrap_or("-"));
                        store.upsert_conversation(info);
                    }
                }
                Err(e) => eprintln!("{}", e.user_message()),
            },
            "/open" if !arg.is_empty() => {
                let previous = lock_store(&store).open_conversation_id().map(str::to_string);
                if let Some(previous) = previous {
                    connection.unsubscribe_conversation(&previous);
                }
                let epoch = {
                    let mut store = lock_store(&store);
                    store.open_conversation(arg);
                    store.begin_resync(arg)
                };
                connection.subscribe_conversation(arg);
                match api.fetch_messages(arg).await {
                    Ok(history) => {
                        let history: Vec<_> = match connection.router() {
                            Some(router) => history.into_iter().map(|m| router.tag(m)).collect(),
                            None => history,
                        };
                        for m in &history {
                            let who = if m.is_mine { "me" } else { m.sender.name.as_str() };
                            println!("[{}] {}: {}", m.id, who, m.message);
                        }
                        lock_store(&store).finish_resync(arg, epoch, history, Instant::now());
                    }
                    Err(e) => eprintln!("{}", e.user_message()),
                }
            }
            "/close" => {
                let open = lock_store(&store).open_conversation_id().map(str::to_string);
                if let Some(id) = open {
                    connection.unsubscribe_conversation(&id);
                    lock_store(&store).close_conversation();
                }
            }
            "/send" if !arg.is_empty() => {
                let open = lock_store(&store).open_conversation_id().map(str::to_string);
                match open {
                    Some(id) => connection.send_message(&id, arg),
                    None => eprintln!("open a conversation first"),
                }
            }
            "/delete" if !arg.is_empty() => connection.delete_message(arg),
            "/new" if !arg.is_empty() => match parse_participants(arg) {
                Ok(ids) => {
                    let kind = if ids.len() == 1 {
                        ConversationType::Direct
                    } else {
                        ConversationType::Group
                    };
                    connection.create_conversation(kind, ids);
                }
                Err(e) => eprintln!("{e}"),
            },
            "/search" if !arg.is_empty() => match api.search_messages(arg).await {
                Ok(results) => {
                    for m in results {
                        println!("[{}] #{} {}: {}", m.id, m.conversation_id, m.sender.name, m.message);
                    }
                }
                Err(e) => eprintln!("{}", e.user_message()),
            },
            "/quit" => break,
            "" => {}
            _ => eprintln!("unknown command: {line}"),
        }
    }

    sweep.abort();
    let dropped = connection.disconnect();
    if !dropped.is_empty() {
        tracing::warn!("{} action(s) were still unsent at exit", dropped.len());
    }
    Ok(())
}

fn parse_participants(arg: &str) -> anyhow::Result<Vec<UserId>> {
    arg.split(',')
        .map(|id| {
            id.trim()
                .parse::<UserId>()
                .with_context(|| format!("not a user id: {id}"))
        })
        .collect()
}
