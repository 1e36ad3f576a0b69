//! Client configuration module
//!
//! Loads process configuration from environment variables and derives the
//! settings structs the library components take. Library users can skip the
//! environment entirely and build [`SessionSettings`], [`ManagerSettings`]
//! and [`RestSettings`] directly.

use crate::codec::{Compression, IdentifyProperties};
use crate::error::GatewayError;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default gateway API version
pub const API_VERSION: u8 = 10;

/// Default number of shards per pool (one process owns one pool)
pub const SHARDS_PER_POOL: u32 = 25;

/// Gateway intent bits used by this client
pub mod intents {
    pub const GUILDS: u64 = 1 << 0;
    pub const GUILD_MEMBERS: u64 = 1 << 1;
    pub const GUILD_MESSAGES: u64 = 1 << 9;
    pub const MESSAGE_CONTENT: u64 = 1 << 15;

    /// GUILDS for guild lifecycle, GUILD_MEMBERS for member events (privileged)
    pub const DEFAULT: u64 = GUILDS | GUILD_MEMBERS;
}

/// Bot token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// `Authorization` header value for REST calls
    pub fn authorization(&self) -> String {
        format!("Bot {}", self.0)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

/// Per-shard session settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub token: Token,
    pub intents: u64,
    /// Base gateway URL (from the gateway info hint or an override)
    pub gateway_url: String,
    pub api_version: u8,
    pub compression: Compression,
    pub large_threshold: u32,
    pub properties: IdentifyProperties,
    /// How long to wait for HELLO after connecting
    pub handshake_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// A session that stays RUNNING this long resets the backoff
    pub backoff_reset_after: Duration,
    /// Fixed first-heartbeat jitter fraction; random when unset
    pub heartbeat_jitter: Option<f64>,
}

impl SessionSettings {
    pub fn new(token: Token, gateway_url: impl Into<String>) -> Self {
        Self {
            token,
            intents: intents::DEFAULT,
            gateway_url: gateway_url.into(),
            api_version: API_VERSION,
            compression: Compression::None,
            large_threshold: 250,
            properties: IdentifyProperties::default(),
            handshake_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            backoff_reset_after: Duration::from_secs(300),
            heartbeat_jitter: None,
        }
    }
}

/// Shard manager settings
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Pool owned by this process
    pub pool_id: u32,
    pub shards_per_pool: u32,
    /// Total shards across the cluster, fixed for the manager's lifetime
    pub total_shards: u32,
    /// IDENTIFY slots per window
    pub max_concurrency: u32,
    pub identify_window: Duration,
    /// Delay between starting consecutive shards
    pub startup_stagger: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            pool_id: 0,
            shards_per_pool: SHARDS_PER_POOL,
            total_shards: 1,
            max_concurrency: 1,
            identify_window: crate::shard::DEFAULT_IDENTIFY_WINDOW,
            startup_stagger: Duration::ZERO,
        }
    }
}

impl ManagerSettings {
    /// Shards owned by this pool: `[pool_id * per_pool, min(start + per_pool, total))`
    pub fn shard_range(&self) -> std::ops::Range<u32> {
        let start = self.pool_id.saturating_mul(self.shards_per_pool);
        let end = start.saturating_add(self.shards_per_pool).min(self.total_shards);
        start.min(end)..end
    }
}

/// REST executor settings
#[derive(Debug, Clone)]
pub struct RestSettings {
    pub base_url: String,
    pub user_agent: String,
    pub request_timeout: Duration,
    /// Attempts for transport failures and 5xx, including the first
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Requests per second allowed by the global limit
    pub global_rate_limit: u32,
    /// Longest rate-limit wait accepted before failing with `RateLimited`
    pub max_rate_limit: Duration,
    /// 429s tolerated for one request before giving up
    pub max_rate_limit_retries: u32,
    /// Buckets kept before idle ones are evicted
    pub bucket_capacity: usize,
    pub gc_period: Duration,
    /// Idle time after a bucket's window before it is collected
    pub gc_expire_after: Duration,
}

impl Default for RestSettings {
    fn default() -> Self {
        Self {
            base_url: format!("https://discord.com/api/v{API_VERSION}"),
            user_agent: format!(
                "DiscordBot ({}, {})",
                env!("CARGO_PKG_REPOSITORY"),
                env!("CARGO_PKG_VERSION")
            ),
            request_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(8),
            global_rate_limit: 50,
            max_rate_limit: Duration::from_secs(300),
            max_rate_limit_retries: 5,
            bucket_capacity: 4_096,
            gc_period: Duration::from_secs(20),
            gc_expire_after: Duration::from_secs(10),
        }
    }
}

/// Process configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Discord bot token
    pub token: Token,

    /// Pool ID for this process (0-indexed)
    /// Each pool manages SHARDS_PER_POOL shards
    pub pool_id: u32,

    /// Total shards; `None` uses the gateway info hint
    pub total_shards: Option<u32>,

    /// Gateway URL override; `None` uses the gateway info hint
    pub gateway_url: Option<String>,

    pub intents: u64,
    pub compression: Compression,
    pub handshake_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_reset_after: Duration,

    /// Bounded sink capacity; full sink applies backpressure to shards
    pub event_buffer: usize,

    pub rest: RestSettings,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();

        let token = env::var("DISCORD_TOKEN")
            .or_else(|_| env::var("DISCORD_BOT_TOKEN"))
            .map(Token::new)
            .map_err(|_| {
                GatewayError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string())
            })?;

        let pool_id = parse_var(
            "POOL_ID",
            env::var("POOL_ID").or_else(|_| env::var("SHARD_ID")).ok(),
            0,
        )?;
        let total_shards = parse_optional("TOTAL_SHARDS", env::var("TOTAL_SHARDS").ok())?;
        if total_shards == Some(0) {
            return Err(GatewayError::Config("TOTAL_SHARDS must be at least 1".to_string()));
        }

        let gateway_url = env::var("GATEWAY_URL").ok().filter(|url| !url.is_empty());
        let intents = parse_var("GATEWAY_INTENTS", env::var("GATEWAY_INTENTS").ok(), intents::DEFAULT)?;
        let compression = parse_var(
            "GATEWAY_COMPRESSION",
            env::var("GATEWAY_COMPRESSION").ok(),
            Compression::None,
        )?;

        let handshake_timeout = millis("HANDSHAKE_TIMEOUT_MS", 30_000)?;
        let backoff_base = millis("BACKOFF_BASE_MS", 1_000)?;
        let backoff_max = millis("BACKOFF_MAX_MS", 60_000)?;
        let backoff_reset_after = Duration::from_secs(parse_var(
            "BACKOFF_RESET_AFTER_SECS",
            env::var("BACKOFF_RESET_AFTER_SECS").ok(),
            300,
        )?);

        let event_buffer: usize = parse_var("EVENT_BUFFER", env::var("EVENT_BUFFER").ok(), 1_024)?;
        if event_buffer == 0 {
            return Err(GatewayError::Config("EVENT_BUFFER must be at least 1".to_string()));
        }

        let defaults = RestSettings::default();
        let rest = RestSettings {
            base_url: env::var("REST_BASE_URL").unwrap_or(defaults.base_url),
            max_attempts: parse_var(
                "REST_MAX_ATTEMPTS",
                env::var("REST_MAX_ATTEMPTS").ok(),
                defaults.max_attempts,
            )?
            .max(1),
            global_rate_limit: parse_var(
                "GLOBAL_RATE_LIMIT",
                env::var("GLOBAL_RATE_LIMIT").ok(),
                defaults.global_rate_limit,
            )?,
            max_rate_limit: Duration::from_secs(parse_var(
                "MAX_RATE_LIMIT_SECS",
                env::var("MAX_RATE_LIMIT_SECS").ok(),
                defaults.max_rate_limit.as_secs(),
            )?),
            ..defaults
        };

        let http_port = parse_var(
            "HTTP_PORT",
            env::var("HTTP_PORT").or_else(|_| env::var("METRICS_PORT")).ok(),
            9090,
        )?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            token,
            pool_id,
            total_shards,
            gateway_url,
            intents,
            compression,
            handshake_timeout,
            backoff_base,
            backoff_max,
            backoff_reset_after,
            event_buffer,
            rest,
            http_port,
            log_level,
        })
    }

    /// Session settings for the resolved gateway URL
    pub fn session_settings(&self, gateway_url: String) -> SessionSettings {
        SessionSettings {
            intents: self.intents,
            compression: self.compression,
            handshake_timeout: self.handshake_timeout,
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
            backoff_reset_after: self.backoff_reset_after,
            ..SessionSettings::new(self.token.clone(), gateway_url)
        }
    }

    /// Manager settings for the resolved shard count and identify concurrency
    pub fn manager_settings(&self, total_shards: u32, max_concurrency: u32) -> ManagerSettings {
        ManagerSettings {
            pool_id: self.pool_id,
            total_shards,
            max_concurrency,
            ..ManagerSettings::default()
        }
    }
}

fn millis(name: &str, default: u64) -> Result<Duration, GatewayError> {
    parse_var(name, env::var(name).ok(), default).map(Duration::from_millis)
}

fn parse_var<T>(name: &str, raw: Option<String>, default: T) -> Result<T, GatewayError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| GatewayError::Config(format!("{name} must be valid: {e}"))),
        None => Ok(default),
    }
}

fn parse_optional<T>(name: &str, raw: Option<String>) -> Result<Option<T>, GatewayError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw.filter(|value| !value.trim().is_empty()) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| GatewayError::Config(format!("{name} must be valid: {e}"))),
        None => Ok(None),
    }
}
