//! Configuration system for the chat client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/alife-chat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use alife_chat_proto::destination::Destinations;
use alife_chat_proto::frame::HeartBeat;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    broker: BrokerFileConfig,
    api: ApiFileConfig,
    chat: ChatFileConfig,
}

/// `[broker]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BrokerFileConfig {
    url: Option<String>,
    heartbeat_outgoing_ms: Option<u64>,
    heartbeat_incoming_ms: Option<u64>,
    connect_timeout_secs: Option<u64>,
    reconnect: Option<bool>,
    reconnect_attempts: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    send_destination: Option<String>,
    start_destination: Option<String>,
    broadcast_topic: Option<String>,
    conversation_topic_prefix: Option<String>,
}

/// `[api]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ApiFileConfig {
    url: Option<String>,
    identity_stale_secs: Option<u64>,
    history_stale_secs: Option<u64>,
    identity_retries: Option<u32>,
    history_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    user_id: Option<String>,
    event_buffer: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Automatic reconnection policy for the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Whether unexpected drops schedule a reconnect at all.
    pub enabled: bool,
    /// Number of consecutive reconnects attempted before giving up.
    pub max_attempts: u32,
    /// Delay before the first reconnect; doubles on every further attempt.
    pub base_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect number `attempt` (1-based):
    /// `base_delay × 2^(attempt-1)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Settings for the broker connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Broker WebSocket URL (`ws://` or `wss://`).
    pub url: String,
    /// Heart-beat intervals offered on CONNECT.
    pub heart_beat: HeartBeat,
    /// Timeout for the WebSocket + STOMP handshake.
    pub connect_timeout: Duration,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
    /// Destinations published and subscribed to.
    pub destinations: Destinations,
    /// Capacity of the connection event channel.
    pub event_buffer: usize,
}

/// Default capacity of the connection event channel.
const DEFAULT_EVENT_BUFFER: usize = 256;

impl ConnectionConfig {
    /// Creates a connection config for `url` with default settings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heart_beat: HeartBeat::new(4000, 4000),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            destinations: Destinations::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Bounded retry policy for backend requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure.
    pub retries: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub base_delay: Duration,
    /// Upper bound for any single retry delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Settings for the conversation identity resolver.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// How long a cached lookup stays fresh.
    pub stale_after: Duration,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5 * 60),
            retry: RetryPolicy {
                retries: 2,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
            },
        }
    }
}

/// Settings for the history loader.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// How long a fetched history stays fresh.
    pub stale_after: Duration,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            retry: RetryPolicy {
                retries: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
            },
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Broker --
    /// Broker WebSocket URL.
    pub broker_url: Option<String>,
    /// Heart-beat intervals offered on CONNECT.
    pub heart_beat: HeartBeat,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
    /// Broker destinations.
    pub destinations: Destinations,

    // -- API --
    /// REST backend base URL.
    pub api_url: Option<String>,
    /// Identity resolver settings.
    pub resolver: ResolverConfig,
    /// History loader settings.
    pub history: HistoryConfig,

    // -- Session / conversation --
    /// Bearer token (normally supplied by the auth collaborator).
    pub access_token: Option<String>,
    /// Own user id.
    pub user_id: Option<String>,
    /// Item the conversation is about.
    pub item_id: Option<String>,
    /// The other participant.
    pub counterpart_id: Option<String>,
    /// Explicit conversation id, skipping resolution.
    pub chat_id: Option<String>,
    /// Capacity of the connection event channel.
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let connection = ConnectionConfig::new(String::new());
        Self {
            broker_url: None,
            heart_beat: connection.heart_beat,
            connect_timeout: connection.connect_timeout,
            reconnect: connection.reconnect,
            destinations: connection.destinations,
            api_url: None,
            resolver: ResolverConfig::default(),
            history: HistoryConfig::default(),
            access_token: None,
            user_id: None,
            item_id: None,
            counterpart_id: None,
            chat_id: None,
            event_buffer: connection.event_buffer,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path
    /// (`~/.config/alife-chat/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let broker = &file.broker;
        let api = &file.api;

        let retry_delay = api
            .retry_delay_ms
            .map(Duration::from_millis);

        Self {
            broker_url: cli.broker_url.clone().or_else(|| broker.url.clone()),
            heart_beat: HeartBeat::new(
                broker
                    .heartbeat_outgoing_ms
                    .unwrap_or(defaults.heart_beat.outgoing_ms),
                broker
                    .heartbeat_incoming_ms
                    .unwrap_or(defaults.heart_beat.incoming_ms),
            ),
            connect_timeout: broker
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            reconnect: ReconnectConfig {
                enabled: broker.reconnect.unwrap_or(defaults.reconnect.enabled),
                max_attempts: broker
                    .reconnect_attempts
                    .unwrap_or(defaults.reconnect.max_attempts),
                base_delay: broker
                    .reconnect_delay_ms
                    .map_or(defaults.reconnect.base_delay, Duration::from_millis),
            },
            destinations: Destinations {
                send: broker
                    .send_destination
                    .clone()
                    .unwrap_or(defaults.destinations.send),
                start_conversation: broker
                    .start_destination
                    .clone()
                    .unwrap_or(defaults.destinations.start_conversation),
                broadcast: broker
                    .broadcast_topic
                    .clone()
                    .unwrap_or(defaults.destinations.broadcast),
                conversation_prefix: broker
                    .conversation_topic_prefix
                    .clone()
                    .unwrap_or(defaults.destinations.conversation_prefix),
            },
            api_url: cli.api_url.clone().or_else(|| api.url.clone()),
            resolver: ResolverConfig {
                stale_after: api
                    .identity_stale_secs
                    .map_or(defaults.resolver.stale_after, Duration::from_secs),
                retry: RetryPolicy {
                    retries: api
                        .identity_retries
                        .unwrap_or(defaults.resolver.retry.retries),
                    base_delay: retry_delay.unwrap_or(defaults.resolver.retry.base_delay),
                    max_delay: defaults.resolver.retry.max_delay,
                },
            },
            history: HistoryConfig {
                stale_after: api
                    .history_stale_secs
                    .map_or(defaults.history.stale_after, Duration::from_secs),
                retry: RetryPolicy {
                    retries: api
                        .history_retries
                        .unwrap_or(defaults.history.retry.retries),
                    base_delay: retry_delay.unwrap_or(defaults.history.retry.base_delay),
                    max_delay: defaults.history.retry.max_delay,
                },
            },
            access_token: cli.access_token.clone(),
            user_id: cli.user_id.clone().or_else(|| file.chat.user_id.clone()),
            item_id: cli.item.clone(),
            counterpart_id: cli.counterpart.clone(),
            chat_id: cli.chat_id.clone(),
            event_buffer: file.chat.event_buffer.unwrap_or(defaults.event_buffer),
        }
    }

    /// Build a [`ConnectionConfig`] from this configuration.
    ///
    /// Returns `None` if no broker URL is configured.
    #[must_use]
    pub fn to_connection_config(&self) -> Option<ConnectionConfig> {
        let url = self.broker_url.clone().filter(|u| !u.is_empty())?;
        Some(ConnectionConfig {
            url,
            heart_beat: self.heart_beat,
            connect_timeout: self.connect_timeout,
            reconnect: self.reconnect.clone(),
            destinations: self.destinations.clone(),
            event_buffer: self.event_buffer,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Additional Life private chat client")]
pub struct CliArgs {
    /// WebSocket URL of the messaging broker.
    #[arg(long, env = "ALIFE_BROKER_URL")]
    pub broker_url: Option<String>,

    /// Base URL of the REST backend.
    #[arg(long, env = "ALIFE_API_URL")]
    pub api_url: Option<String>,

    /// Bearer token issued by the auth provider.
    #[arg(long, env = "ALIFE_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Your user id.
    #[arg(long, env = "ALIFE_USER_ID")]
    pub user_id: Option<String>,

    /// Item the conversation is about.
    #[arg(long)]
    pub item: Option<String>,

    /// The user to chat with.
    #[arg(long)]
    pub counterpart: Option<String>,

    /// Known conversation id (skips identity resolution).
    #[arg(long)]
    pub chat_id: Option<String>,

    /// Path to config file (default: `~/.config/alife-chat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "ALIFE_CHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/alife-chat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("alife-chat").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
