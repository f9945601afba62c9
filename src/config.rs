//! Configuration types for baskets

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{BasketsError, Result};

/// Default HTTP service port
pub const DEFAULT_PORT: u16 = 55555;

/// Default number of items per listing page
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Default capacity of a new basket
pub const INIT_BASKET_CAPACITY: usize = 200;

/// Default ceiling for basket capacity
pub const MAX_BASKET_CAPACITY: usize = 2000;

/// Default location of the durable database
pub const DEFAULT_DB_FILE: &str = "./baskets.db";

/// Persistence backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Volatile, in-process storage
    #[default]
    Memory,
    /// Embedded durable key-value log
    Embedded,
    /// Relational database
    Sql,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Memory => "memory",
            Self::Embedded => "embedded",
            Self::Sql => "sql",
        };
        f.write_str(name)
    }
}

/// Server configuration, resolved once at start-up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP service port
    #[serde(default = "default_port")]
    pub port: u16,
    /// HTTP listen address (empty means all interfaces)
    #[serde(default)]
    pub address: String,
    /// Capacity given to baskets created without one
    #[serde(default = "default_init_capacity")]
    pub init_capacity: usize,
    /// Largest capacity a basket may be configured with
    #[serde(default = "default_max_capacity")]
    pub max_capacity: usize,
    /// Default page size for listings
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Master token, generated at start-up when absent
    #[serde(default)]
    pub master_token: Option<String>,
    /// Storage backend
    #[serde(default)]
    pub backend: BackendKind,
    /// Database file for durable backends
    #[serde(default = "default_db_file")]
    pub db_file: PathBuf,
    /// Connection target for the SQL backend, `db_file` is used when absent
    #[serde(default)]
    pub db_connection: Option<String>,
    /// Baskets to create during start-up
    #[serde(default)]
    pub baskets: Vec<String>,
    /// Relay limits
    #[serde(default)]
    pub relay: RelayConfig,
    /// Capture limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Forwarding relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Per-relay timeout in milliseconds
    pub timeout_ms: u64,
    /// Maximum number of relays in flight
    pub max_in_flight: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_in_flight: 256,
        }
    }
}

impl RelayConfig {
    /// Per-relay timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Capture limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum captured body size in bytes, the rest is truncated
    pub max_body_size: usize,
    /// Maximum basket configuration payload in bytes
    pub max_config_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size: 1024 * 1024, // 1 MB
            max_config_size: 2048,      // 2 KB
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_init_capacity() -> usize {
    INIT_BASKET_CAPACITY
}

fn default_max_capacity() -> usize {
    MAX_BASKET_CAPACITY
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_db_file() -> PathBuf {
    PathBuf::from(DEFAULT_DB_FILE)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            address: String::new(),
            init_capacity: INIT_BASKET_CAPACITY,
            max_capacity: MAX_BASKET_CAPACITY,
            page_size: DEFAULT_PAGE_SIZE,
            master_token: None,
            backend: BackendKind::default(),
            db_file: default_db_file(),
            db_connection: None,
            baskets: Vec::new(),
            relay: RelayConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BasketsError::ConfigError(format!("Failed to read config file: {e}")))?;

        let mut config: Self = toml::from_str(&content)
            .map_err(|e| BasketsError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PORT` and `DATABASE_URL` environment overrides
    ///
    /// # Errors
    ///
    /// Returns error if `PORT` is not a valid port number
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("PORT") {
            self.port = port
                .parse()
                .map_err(|e| BasketsError::ConfigError(format!("Invalid PORT '{port}': {e}")))?;
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                self.db_connection = Some(url);
            }
        }

        Ok(())
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.max_capacity == 0 {
            return Err(BasketsError::ConfigError(
                "max_capacity must be > 0".to_string(),
            ));
        }

        if self.init_capacity == 0 || self.init_capacity > self.max_capacity {
            return Err(BasketsError::ConfigError(format!(
                "init_capacity must be within 1..={}, got {}",
                self.max_capacity, self.init_capacity
            )));
        }

        if self.page_size == 0 {
            return Err(BasketsError::ConfigError(
                "page_size must be > 0".to_string(),
            ));
        }

        if self.master_token.as_deref() == Some("") {
            return Err(BasketsError::ConfigError(
                "master_token cannot be empty".to_string(),
            ));
        }

        if self.relay.max_in_flight == 0 || self.relay.timeout_ms == 0 {
            return Err(BasketsError::ConfigError(
                "relay limits must be > 0".to_string(),
            ));
        }

        if self.limits.max_body_size == 0 || self.limits.max_config_size == 0 {
            return Err(BasketsError::ConfigError(
                "capture limits must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Location of the SQL database
    #[must_use]
    pub fn sql_target(&self) -> String {
        self.db_connection
            .clone()
            .unwrap_or_else(|| self.db_file.display().to_string())
    }
}
