use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::chatsync::dispatcher::DEFAULT_DELIVERED_CAPACITY;
use crate::chatsync::retry::{JoinRetryPolicy, LinearRetryPolicy, ReconnectPolicy};
use crate::error::{ChatSyncError, Result};
use crate::types::ConversationId;

const DEFAULT_READ_DEBOUNCE: Duration = Duration::from_millis(500);
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 500;

#[derive(Clone, Debug)]
pub struct ChatSyncConfig {
    /// Base URL of the REST API.
    /// Env: `CHATSYNC_API_URL`
    pub api_base_url: String,

    /// WebSocket URL of the real-time gateway.
    /// Env: `CHATSYNC_GATEWAY_URL`
    pub gateway_url: String,

    /// Directory for rolling log files. Logging is left to the host when unset.
    /// Env: `CHATSYNC_LOGS_DIR`
    pub logs_dir: Option<PathBuf>,

    /// Env: `CHATSYNC_RECONNECT_MAX_ATTEMPTS`, `CHATSYNC_RECONNECT_BASE_DELAY_MS`,
    /// `CHATSYNC_RECONNECT_MAX_DELAY_MS`, `CHATSYNC_HANDSHAKE_TIMEOUT_MS`
    pub reconnect: ReconnectPolicy,

    /// Env: `CHATSYNC_JOIN_MAX_RETRIES`, `CHATSYNC_JOIN_RETRY_DELAY_MS`
    pub join_retry: JoinRetryPolicy,

    /// Retry policy for read receipts and unread count fetches.
    /// Env: `CHATSYNC_BEST_EFFORT_MAX_RETRIES`, `CHATSYNC_BEST_EFFORT_STEP_MS`
    pub best_effort_retry: LinearRetryPolicy,

    /// Env: `CHATSYNC_DELIVERED_CACHE_CAPACITY`
    pub delivered_cache_capacity: usize,

    /// Env: `CHATSYNC_READ_DEBOUNCE_MS`
    pub read_debounce: Duration,

    /// Buffer between the transport and the event processing loop.
    /// Env: `CHATSYNC_EVENT_CHANNEL_CAPACITY`
    pub event_channel_capacity: usize,

    /// Conversations muted when the session starts.
    /// Env: `CHATSYNC_MUTED` (comma separated ids)
    pub muted_conversations: Vec<ConversationId>,
}

impl ChatSyncConfig {
    pub fn new(api_base_url: impl Into<String>, gateway_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            gateway_url: gateway_url.into(),
            logs_dir: None,
            reconnect: ReconnectPolicy::default(),
            join_retry: JoinRetryPolicy::default(),
            best_effort_retry: LinearRetryPolicy::default(),
            delivered_cache_capacity: DEFAULT_DELIVERED_CAPACITY,
            read_debounce: DEFAULT_READ_DEBOUNCE,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            muted_conversations: Vec::new(),
        }
    }

    pub fn with_logs_dir(mut self, logs_dir: &Path) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };
        self.logs_dir = Some(logs_dir.join(env_suffix));
        self
    }

    /// Loads `.env` (if present) and reads `CHATSYNC_*` variables.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(ChatSyncError::Configuration(format!(
                    "failed to load .env: {}",
                    e
                )));
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| ChatSyncError::Configuration(format!("{} is not set", key)))
        };

        let mut config =
            Self::new(required("CHATSYNC_API_URL")?, required("CHATSYNC_GATEWAY_URL")?);

        if let Some(dir) = lookup("CHATSYNC_LOGS_DIR") {
            config.logs_dir = Some(PathBuf::from(dir));
        }

        if let Some(value) = parse(&lookup, "CHATSYNC_RECONNECT_MAX_ATTEMPTS")? {
            config.reconnect.max_attempts = value;
        }
        if let Some(ms) = parse(&lookup, "CHATSYNC_RECONNECT_BASE_DELAY_MS")? {
            config.reconnect.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "CHATSYNC_RECONNECT_MAX_DELAY_MS")? {
            config.reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "CHATSYNC_HANDSHAKE_TIMEOUT_MS")? {
            config.reconnect.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(value) = parse(&lookup, "CHATSYNC_JOIN_MAX_RETRIES")? {
            config.join_retry.max_retries = value;
        }
        if let Some(ms) = parse(&lookup, "CHATSYNC_JOIN_RETRY_DELAY_MS")? {
            config.join_retry.delay = Duration::from_millis(ms);
        }
        if let Some(value) = parse(&lookup, "CHATSYNC_BEST_EFFORT_MAX_RETRIES")? {
            config.best_effort_retry.max_retries = value;
        }
        if let Some(ms) = parse(&lookup, "CHATSYNC_BEST_EFFORT_STEP_MS")? {
            config.best_effort_retry.step = Duration::from_millis(ms);
        }
        if let Some(value) = parse(&lookup, "CHATSYNC_DELIVERED_CACHE_CAPACITY")? {
            config.delivered_cache_capacity = value;
        }
        if let Some(ms) = parse(&lookup, "CHATSYNC_READ_DEBOUNCE_MS")? {
            config.read_debounce = Duration::from_millis(ms);
        }
        if let Some(value) = parse(&lookup, "CHATSYNC_EVENT_CHANNEL_CAPACITY")? {
            config.event_channel_capacity = value;
        }
        if let Some(muted) = lookup("CHATSYNC_MUTED") {
            config.muted_conversations = muted
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(ConversationId::from)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(ChatSyncError::Configuration("API base URL is empty".to_string()));
        }
        if !(self.gateway_url.starts_with("ws://") || self.gateway_url.starts_with("wss://")) {
            return Err(ChatSyncError::Configuration(format!(
                "gateway URL must use ws:// or wss://, got {}",
                self.gateway_url
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(ChatSyncError::Configuration(
                "event channel capacity must be positive".to_string(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ChatSyncError::Configuration(
                "reconnect max attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            ChatSyncError::Configuration(format!("invalid value for {}: {} ({})", key, raw, e))
        }),
    }
}
