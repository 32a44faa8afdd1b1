//! Server Configuration
//!
//! Loaded from a JSON file or from `LOBBY_*` environment variables; every
//! field has a default so partial files work.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DEFAULT_STAGE_MAX_PLAYERS, RAID_SEMAPHORE_CAPACITY, RAID_SEMAPHORE_PREFIX};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON.
    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// An environment variable could not be parsed.
    #[error("Invalid value for {name}: {value}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },

    /// A field is out of range.
    #[error("Invalid config: {0}")]
    Invalid(&'static str),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Outbound queue capacity per session.
    pub send_queue_capacity: usize,
    /// Pause between send loop drain cycles (milliseconds).
    pub send_tick_ms: u64,
    /// Pause between receive loop reads (milliseconds, 0 = none).
    pub recv_tick_ms: u64,
    /// Capacity of stages created without an explicit size.
    pub default_stage_max_players: u16,
    /// Semaphore names starting with this get the raid capacity.
    pub raid_semaphore_prefix: String,
    /// Capacity forced onto raid semaphores.
    pub raid_semaphore_capacity: u16,
    /// Trace every inbound packet.
    pub log_inbound: bool,
    /// Trace every outbound message.
    pub log_outbound: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 53310)),
            max_connections: 1000,
            send_queue_capacity: 20,
            send_tick_ms: 5,
            recv_tick_ms: 0,
            default_stage_max_players: DEFAULT_STAGE_MAX_PLAYERS,
            raid_semaphore_prefix: RAID_SEMAPHORE_PREFIX.to_string(),
            raid_semaphore_capacity: RAID_SEMAPHORE_CAPACITY,
            log_inbound: false,
            log_outbound: false,
        }
    }
}

impl ServerConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = env_parse("LOBBY_BIND_ADDR")? {
            config.bind_addr = v;
        }
        if let Some(v) = env_parse("LOBBY_MAX_CONNECTIONS")? {
            config.max_connections = v;
        }
        if let Some(v) = env_parse("LOBBY_SEND_QUEUE_CAPACITY")? {
            config.send_queue_capacity = v;
        }
        if let Some(v) = env_parse("LOBBY_SEND_TICK_MS")? {
            config.send_tick_ms = v;
        }
        if let Some(v) = env_parse("LOBBY_RECV_TICK_MS")? {
            config.recv_tick_ms = v;
        }
        if let Some(v) = env_parse("LOBBY_STAGE_MAX_PLAYERS")? {
            config.default_stage_max_players = v;
        }
        if let Ok(v) = std::env::var("LOBBY_RAID_SEMAPHORE_PREFIX") {
            config.raid_semaphore_prefix = v;
        }
        if let Some(v) = env_parse("LOBBY_RAID_SEMAPHORE_CAPACITY")? {
            config.raid_semaphore_capacity = v;
        }
        config.log_inbound = env_flag("LOBBY_LOG_INBOUND");
        config.log_outbound = env_flag("LOBBY_LOG_OUTBOUND");
        config.validate()?;
        Ok(config)
    }

    /// Reject values the session core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_queue_capacity == 0 {
            return Err(ConfigError::Invalid("send_queue_capacity must be > 0"));
        }
        if self.default_stage_max_players == 0 {
            return Err(ConfigError::Invalid("default_stage_max_players must be > 0"));
        }
        if self.raid_semaphore_capacity == 0 {
            return Err(ConfigError::Invalid("raid_semaphore_capacity must be > 0"));
        }
        Ok(())
    }

    /// Send loop pause.
    pub fn send_tick(&self) -> Duration {
        Duration::from_millis(self.send_tick_ms)
    }

    /// Receive loop pause.
    pub fn recv_tick(&self) -> Duration {
        Duration::from_millis(self.recv_tick_ms)
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
        Err(_) => Ok(None),
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}
