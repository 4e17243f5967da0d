//! Client configuration: connection identity, reconnect policy, sweep timing.

use std::time::Duration;

use shopchat_shared::{HeartBeat, UserId, WS_PATH};
use url::Url;

use crate::error::ChatError;

/// Identity and address for one connection attempt. Immutable once handed
/// to [`crate::ws::ChatConnection::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Broker base URL, `http(s)://` or `ws(s)://`.
    pub endpoint: String,
    /// Bearer token presented on the WebSocket upgrade and the STOMP CONNECT.
    pub credential: String,
    /// The signed-in user; selects the inbox topic and drives `is_mine`.
    pub user_id: UserId,
}

impl ConnectionConfig {
    pub fn new(endpoint: impl Into<String>, credential: impl Into<String>, user_id: UserId) -> Self {
        Self {
            endpoint: endpoint.into(),
            credential: credential.into(),
            user_id,
        }
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        if self.credential.trim().is_empty() {
            return Err(ChatError::MissingCredential);
        }
        Ok(())
    }

    /// WebSocket URL: `{endpoint}/ws` with the scheme mapped to `ws`/`wss`.
    pub fn ws_url(&self) -> Result<Url, ChatError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| ChatError::InvalidConfig(format!("bad endpoint '{}': {e}", self.endpoint)))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ChatError::InvalidConfig(format!(
                    "unsupported endpoint scheme: {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ChatError::InvalidConfig(format!("cannot use scheme {scheme}")))?;

        let path = format!("{}{}", url.path().trim_end_matches('/'), WS_PATH);
        url.set_path(&path);
        Ok(url)
    }

    /// Value for the STOMP `host` header.
    pub fn host(&self) -> String {
        Url::parse(&self.endpoint)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// What explicit `disconnect()` does with actions still waiting in the queue.
/// Either way the discarded or retained commands are returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectPolicy {
    /// Drop them; a later `connect()` starts with an empty queue.
    #[default]
    Discard,
    /// Keep them; they flush on the next successful `connect()`.
    Preserve,
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts after a drop (0 = never retry)
    pub max_attempts: u32,
    /// Delay before the first reconnect attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Bound on the WebSocket upgrade plus the STOMP CONNECTED handshake
    pub connect_timeout: Duration,
    /// Heart-beat interval offered to the broker (zero disables)
    pub heartbeat: Duration,
    /// Pause between the unsubscribe and re-subscribe halves of a refresh
    pub refresh_delay: Duration,
    pub disconnect_policy: DisconnectPolicy,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            heartbeat: Duration::from_secs(10),
            refresh_delay: Duration::from_millis(250),
            disconnect_policy: DisconnectPolicy::Discard,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (1-based): `base × 2^(attempt−1)`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn heart_beat(&self) -> HeartBeat {
        let ms = self.heartbeat.as_millis() as u64;
        HeartBeat::new(ms, ms)
    }
}

/// Staleness sweep timing.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Time between sweep ticks
    pub interval: Duration,
    /// A subscribed conversation not refreshed for longer than this is resynced
    pub stale_after: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
        }
    }
}

/// Full client configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub connection: ConnectionConfig,
    /// Base URL for the read APIs; defaults to the broker endpoint.
    pub api_base: String,
    pub reconnect: ReconnectConfig,
    pub sweep: SweepConfig,
}

impl ChatConfig {
    /// Parse client configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SHOPCHAT_ENDPOINT`: broker base URL (default: "http://localhost:8080")
    /// - `SHOPCHAT_TOKEN`: bearer credential (required)
    /// - `SHOPCHAT_USER_ID`: numeric id of the signed-in user (required)
    /// - `SHOPCHAT_API_BASE`: read API base URL (default: the endpoint)
    /// - `SHOPCHAT_MAX_RECONNECT_ATTEMPTS` (default: 5)
    /// - `SHOPCHAT_RECONNECT_BASE_MS` (default: 1000)
    /// - `SHOPCHAT_SWEEP_INTERVAL_SECS` (default: 30)
    /// - `SHOPCHAT_STALE_AFTER_SECS` (default: 60)
    pub fn from_env() -> Result<Self, ChatError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ChatConfig::from_env`] over an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ChatError> {
        let endpoint =
            lookup("SHOPCHAT_ENDPOINT").unwrap_or_else(|| "http://localhost:8080".to_string());
        let credential = lookup("SHOPCHAT_TOKEN").ok_or(ChatError::MissingCredential)?;
        let user_id = lookup("SHOPCHAT_USER_ID")
            .ok_or_else(|| ChatError::InvalidConfig("SHOPCHAT_USER_ID is not set".to_string()))?
            .trim()
            .parse::<UserId>()
            .map_err(|e| ChatError::InvalidConfig(format!("SHOPCHAT_USER_ID: {e}")))?;
        let api_base = lookup("SHOPCHAT_API_BASE").unwrap_or_else(|| endpoint.clone());

        let mut reconnect = ReconnectConfig::default();
        if let Some(n) = parse_var::<u32>(&lookup, "SHOPCHAT_MAX_RECONNECT_ATTEMPTS")? {
            reconnect.max_attempts = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "SHOPCHAT_RECONNECT_BASE_MS")? {
            reconnect.base_delay = Duration::from_millis(ms);
        }

        let mut sweep = SweepConfig::default();
        if let Some(secs) = parse_var::<u64>(&lookup, "SHOPCHAT_SWEEP_INTERVAL_SECS")? {
            sweep.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "SHOPCHAT_STALE_AFTER_SECS")? {
            sweep.stale_after = Duration::from_secs(secs);
        }

        let connection = ConnectionConfig::new(endpoint, credential, user_id);
        connection.validate()?;
        connection.ws_url()?;

        Ok(Self {
            connection,
            api_base,
            reconnect,
            sweep,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ChatError>
where
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ChatError::InvalidConfig(format!("{key}: {e}")))
        })
        .transpose()
}
