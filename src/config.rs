//! Configuration handling for the store.
//!
//! This module provides configuration management via CLI arguments and environment
//! variables, plus the pool and cache option structs the store is built from.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;

// Cache configuration defaults
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Connection pool configuration options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Maximum number of tracked connections (default: 10)
    pub max_connections: Option<u32>,
    /// Idle timeout in seconds; idle connections older than this are discarded (default: 600)
    pub idle_timeout_secs: Option<u64>,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: Option<u64>,
    /// Whether to probe reused connections before handing them out (default: true)
    pub test_before_acquire: Option<bool>,
    /// Interval of the background reaper in seconds (default: 60)
    pub reaper_interval_secs: Option<u64>,
}

impl PoolOptions {
    /// Get max_connections with default value.
    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Get idle_timeout with default value.
    pub fn idle_timeout_or_default(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS))
    }

    /// Get acquire_timeout with default value.
    pub fn acquire_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.acquire_timeout_secs
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        )
    }

    /// Get test_before_acquire with default value.
    pub fn test_before_acquire_or_default(&self) -> bool {
        self.test_before_acquire.unwrap_or(true)
    }

    pub fn reaper_interval_or_default(&self) -> Duration {
        Duration::from_secs(
            self.reaper_interval_secs
                .unwrap_or(DEFAULT_REAPER_INTERVAL_SECS),
        )
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        if let Some(0) = self.acquire_timeout_secs {
            return Err("acquire_timeout must be greater than 0".to_string());
        }
        if let Some(0) = self.reaper_interval_secs {
            return Err("reaper_interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Entity cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    pub enabled: bool,
    pub capacity: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl CacheOptions {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.capacity == 0 {
            return Err("cache capacity must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Store configuration, parsed from command line arguments or environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "sqlstore")]
pub struct StoreConfig {
    /// Database URL, e.g. sqlite:data.db or sqlite::memory:
    #[arg(long = "database-url", env = "SQLSTORE_DATABASE_URL")]
    pub database_url: String,

    /// Maximum number of pooled connections
    #[arg(long, env = "SQLSTORE_MAX_CONNECTIONS")]
    pub max_connections: Option<u32>,

    /// Seconds to wait for a free connection
    #[arg(long = "acquire-timeout", env = "SQLSTORE_ACQUIRE_TIMEOUT")]
    pub acquire_timeout_secs: Option<u64>,

    /// Seconds a connection may sit idle before it is discarded
    #[arg(long = "idle-timeout", env = "SQLSTORE_IDLE_TIMEOUT")]
    pub idle_timeout_secs: Option<u64>,

    /// Skip the validity probe on reused connections
    #[arg(long, env = "SQLSTORE_SKIP_ACQUIRE_TEST", default_value_t = false)]
    pub skip_acquire_test: bool,

    /// Maximum number of cached entities
    #[arg(long, env = "SQLSTORE_CACHE_CAPACITY", default_value_t = DEFAULT_CACHE_CAPACITY)]
    pub cache_capacity: usize,

    /// Disable the entity cache
    #[arg(long, env = "SQLSTORE_CACHE_DISABLED", default_value_t = false)]
    pub cache_disabled: bool,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, env = "SQLSTORE_LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "SQLSTORE_JSON_LOGS", default_value_t = false)]
    pub json_logs: bool,
}

impl StoreConfig {
    /// Configuration for the given URL with every other option at its default.
    pub fn for_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: None,
            acquire_timeout_secs: None,
            idle_timeout_secs: None,
            skip_acquire_test: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_disabled: false,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            json_logs: false,
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_connections: self.max_connections,
            idle_timeout_secs: self.idle_timeout_secs,
            acquire_timeout_secs: self.acquire_timeout_secs,
            test_before_acquire: Some(!self.skip_acquire_test),
            reaper_interval_secs: None,
        }
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            enabled: !self.cache_disabled,
            capacity: self.cache_capacity,
        }
    }

    /// Validate the combined configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.database_url.trim().is_empty() {
            return Err("database URL must not be empty".to_string());
        }
        self.pool_options().validate()?;
        self.cache_options().validate()
    }
}
