//! Server configuration.
//!
//! Values are layered, later layers winning:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. `WATCHD_*` environment variables
//! 4. Command-line flags (applied by the binary)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default listen address
pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Default cap on simultaneously open connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Default interval between watcher counter updates
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;

/// Default per-watcher event buffer
pub const DEFAULT_EVENT_BUFFER: usize = 16;

/// Default bound on closing a transport during teardown
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 1_000;

/// Environment variable names
pub const ENV_BIND: &str = "WATCHD_BIND";
pub const ENV_MAX_CONNECTIONS: &str = "WATCHD_MAX_CONNECTIONS";
pub const ENV_ALLOWED_ORIGINS: &str = "WATCHD_ALLOWED_ORIGINS";
pub const ENV_TICK_INTERVAL_MS: &str = "WATCHD_TICK_INTERVAL_MS";

/// Configuration for [`WatchServer`](crate::server::WatchServer).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    pub bind: SocketAddr,

    /// Maximum number of simultaneously open WebSocket connections
    pub max_connections: usize,

    /// Origins allowed to open a connection.
    ///
    /// Empty means same-origin only (the `Origin` host must match `Host`).
    /// A single `"*"` entry allows any origin.
    pub allowed_origins: Vec<String>,

    /// Interval between counter updates, in milliseconds
    pub tick_interval_ms: u64,

    /// Capacity of each watcher's event channel
    pub event_buffer: usize,

    /// Upper bound on closing a transport during teardown, in milliseconds
    pub close_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            allowed_origins: Vec::new(),
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            event_buffer: DEFAULT_EVENT_BUFFER,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from defaults, an optional file, and the
    /// process environment, then validates it.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parses TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Overrides fields from `WATCHD_*` variables.
    ///
    /// `lookup` abstracts the environment so callers can inject values.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup(ENV_BIND) {
            self.bind = parse_env(ENV_BIND, &bind)?;
        }
        if let Some(max) = lookup(ENV_MAX_CONNECTIONS) {
            self.max_connections = parse_env(ENV_MAX_CONNECTIONS, &max)?;
        }
        if let Some(origins) = lookup(ENV_ALLOWED_ORIGINS) {
            self.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(tick) = lookup(ENV_TICK_INTERVAL_MS) {
            self.tick_interval_ms = parse_env(ENV_TICK_INTERVAL_MS, &tick)?;
        }
        Ok(())
    }

    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "max_connections",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "tick_interval_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "event_buffer",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Interval between counter updates.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Bound on closing a transport during teardown.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key,
        value: value.to_string(),
    })
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {key}: {value:?}")]
    Env { key: &'static str, value: String },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
