//! Hub configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use crate::actors::{RetryPolicy, RoomSettings};
use crate::turn::TurnSettings;

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default bind address for the REST control plane and WebSocket upgrades.
pub const DEFAULT_HTTP_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

pub const DEFAULT_MAX_PARTICIPANTS_PER_ROOM: usize = 50;

pub const DEFAULT_ROOM_GRACE_PERIOD_SECONDS: u64 = 180;

pub const DEFAULT_HEARTBEAT_TIMEOUT_SECONDS: u64 = 60;

/// Idle limit for peers joined through the control plane (10 minutes).
pub const DEFAULT_PEER_IDLE_TIMEOUT_SECONDS: u64 = 600;

pub const DEFAULT_TYPING_EXPIRY_MILLIS: u64 = 3000;

pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub const DEFAULT_TURN_SERVER: &str = "127.0.0.1";

/// 24 hours.
pub const DEFAULT_TURN_TTL_SECONDS: u64 = 86_400;

pub const DEFAULT_TURN_CACHE_TTL_SECONDS: u64 = 300;

pub const DEFAULT_PERSIST_MAX_ATTEMPTS: u32 = 3;

pub const DEFAULT_PERSIST_BACKOFF_MILLIS: u64 = 100;

/// Default hub instance ID prefix.
pub const DEFAULT_HUB_ID_PREFIX: &str = "hub";

/// Hub configuration.
///
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Redis URL for chat persistence. In-memory storage when unset.
    pub redis_url: Option<SecretString>,

    /// REST and WebSocket bind address (default: "0.0.0.0:8080").
    pub http_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this hub instance.
    pub hub_id: String,

    pub max_participants_per_room: usize,

    /// How long an empty room is kept before eviction.
    pub room_grace_period_seconds: u64,

    pub heartbeat_timeout_seconds: u64,

    /// Idle limit for peers without a WebSocket.
    pub peer_idle_timeout_seconds: u64,

    pub typing_expiry_millis: u64,

    /// Per-peer outbound queue capacity.
    pub outbound_queue_capacity: usize,

    /// Shared secret with the TURN server.
    pub turn_secret: SecretString,

    pub turn_server: String,

    pub turn_default_ttl_seconds: u64,

    pub turn_max_ttl_seconds: u64,

    pub turn_cache_ttl_seconds: u64,

    pub persist_max_attempts: u32,

    pub persist_backoff_millis: u64,

    /// Emit logs as JSON.
    pub log_json: bool,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("http_bind_address", &self.http_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("hub_id", &self.hub_id)
            .field("max_participants_per_room", &self.max_participants_per_room)
            .field("room_grace_period_seconds", &self.room_grace_period_seconds)
            .field("heartbeat_timeout_seconds", &self.heartbeat_timeout_seconds)
            .field("peer_idle_timeout_seconds", &self.peer_idle_timeout_seconds)
            .field("typing_expiry_millis", &self.typing_expiry_millis)
            .field("outbound_queue_capacity", &self.outbound_queue_capacity)
            .field("turn_secret", &"[REDACTED]")
            .field("turn_server", &self.turn_server)
            .field("turn_default_ttl_seconds", &self.turn_default_ttl_seconds)
            .field("turn_max_ttl_seconds", &self.turn_max_ttl_seconds)
            .field("turn_cache_ttl_seconds", &self.turn_cache_ttl_seconds)
            .field("persist_max_attempts", &self.persist_max_attempts)
            .field("persist_backoff_millis", &self.persist_backoff_millis)
            .field("log_json", &self.log_json)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional variable, keeping `default` only when it is absent.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
    }
}

/// Like [`parse_var`], rejecting zero.
fn parse_positive<T: FromStr + Default + PartialEq>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    let value = parse_var(vars, name, default)?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue(format!("{name} must be positive")));
    }
    Ok(value)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// See [`Config::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// `MissingEnvVar` if `HUB_TURN_SECRET` is absent, `InvalidValue` for any
    /// value that does not parse.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let turn_secret = vars
            .get("HUB_TURN_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("HUB_TURN_SECRET".to_string()))?;
        let turn_secret = SecretString::from(turn_secret.clone());

        let redis_url = vars
            .get("REDIS_URL")
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::from(s.clone()));

        let http_bind_address = vars
            .get("HUB_HTTP_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HTTP_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("HUB_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let turn_server = vars
            .get("HUB_TURN_SERVER")
            .cloned()
            .unwrap_or_else(|| DEFAULT_TURN_SERVER.to_string());

        let max_participants_per_room = parse_positive(
            vars,
            "HUB_MAX_PARTICIPANTS_PER_ROOM",
            DEFAULT_MAX_PARTICIPANTS_PER_ROOM,
        )?;
        let room_grace_period_seconds = parse_var(
            vars,
            "HUB_ROOM_GRACE_PERIOD_SECONDS",
            DEFAULT_ROOM_GRACE_PERIOD_SECONDS,
        )?;
        let heartbeat_timeout_seconds = parse_positive(
            vars,
            "HUB_HEARTBEAT_TIMEOUT_SECONDS",
            DEFAULT_HEARTBEAT_TIMEOUT_SECONDS,
        )?;
        let peer_idle_timeout_seconds = parse_positive(
            vars,
            "HUB_PEER_IDLE_TIMEOUT_SECONDS",
            DEFAULT_PEER_IDLE_TIMEOUT_SECONDS,
        )?;
        let typing_expiry_millis =
            parse_positive(vars, "HUB_TYPING_EXPIRY_MILLIS", DEFAULT_TYPING_EXPIRY_MILLIS)?;
        let outbound_queue_capacity = parse_positive(
            vars,
            "HUB_OUTBOUND_QUEUE_CAPACITY",
            DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        )?;
        let turn_default_ttl_seconds = parse_positive(
            vars,
            "HUB_TURN_DEFAULT_TTL_SECONDS",
            DEFAULT_TURN_TTL_SECONDS,
        )?;
        let turn_max_ttl_seconds =
            parse_positive(vars, "HUB_TURN_MAX_TTL_SECONDS", DEFAULT_TURN_TTL_SECONDS)?;
        let turn_cache_ttl_seconds = parse_var(
            vars,
            "HUB_TURN_CACHE_TTL_SECONDS",
            DEFAULT_TURN_CACHE_TTL_SECONDS,
        )?;
        let persist_max_attempts =
            parse_positive(vars, "HUB_PERSIST_MAX_ATTEMPTS", DEFAULT_PERSIST_MAX_ATTEMPTS)?;
        let persist_backoff_millis = parse_var(
            vars,
            "HUB_PERSIST_BACKOFF_MILLIS",
            DEFAULT_PERSIST_BACKOFF_MILLIS,
        )?;
        let log_json = parse_var(vars, "HUB_LOG_JSON", false)?;

        // Generate hub instance ID
        let hub_id = vars.get("HUB_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().simple().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_HUB_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            redis_url,
            http_bind_address,
            health_bind_address,
            hub_id,
            max_participants_per_room,
            room_grace_period_seconds,
            heartbeat_timeout_seconds,
            peer_idle_timeout_seconds,
            typing_expiry_millis,
            outbound_queue_capacity,
            turn_secret,
            turn_server,
            turn_default_ttl_seconds,
            turn_max_ttl_seconds,
            turn_cache_ttl_seconds,
            persist_max_attempts,
            persist_backoff_millis,
            log_json,
        })
    }

    /// Per-room limits derived from this configuration.
    #[must_use]
    pub fn room_settings(&self) -> RoomSettings {
        RoomSettings {
            capacity: self.max_participants_per_room,
            grace_period: Duration::from_secs(self.room_grace_period_seconds),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_seconds),
            idle_timeout: Duration::from_secs(self.peer_idle_timeout_seconds),
            typing_expiry: Duration::from_millis(self.typing_expiry_millis),
            outbound_capacity: self.outbound_queue_capacity,
            persist_retry: RetryPolicy {
                max_attempts: self.persist_max_attempts,
                initial_backoff: Duration::from_millis(self.persist_backoff_millis),
            },
        }
    }

    /// Credential issuer settings derived from this configuration.
    #[must_use]
    pub fn turn_settings(&self) -> TurnSettings {
        TurnSettings {
            shared_secret: self.turn_secret.clone(),
            server: self.turn_server.clone(),
            default_ttl: Duration::from_secs(self.turn_default_ttl_seconds),
            max_ttl: Duration::from_secs(self.turn_max_ttl_seconds),
            cache_ttl: Duration::from_secs(self.turn_cache_ttl_seconds),
        }
    }
}
