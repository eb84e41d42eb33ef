//! Configuration handling.
//!
//! This module provides configuration management via CLI arguments and environment variables.

use crate::db::pool::PoolConfig;
use crate::db::transaction_registry::DEFAULT_TRANSACTION_TIMEOUT_SECS;
use crate::error::{DbError, DbResult};
use crate::models::{DEFAULT_STATEMENT_TIMEOUT_SECS, MAX_STATEMENT_TIMEOUT_SECS};
use clap::Parser;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

pub const DEFAULT_DATABASE_URL: &str = "sqlite::memory:";

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 1;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 2000;

/// Connection pool configuration options parsed from database URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 1)
    pub max_connections: Option<u32>,
    /// Connection acquire timeout in milliseconds (default: 2000)
    pub acquire_timeout_ms: Option<u64>,
    /// Per-statement timeout in seconds (default: 30)
    pub statement_timeout_secs: Option<u64>,
}

impl PoolOptions {
    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    pub fn acquire_timeout_or_default(&self) -> Duration {
        Duration::from_millis(
            self.acquire_timeout_ms
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_MS),
        )
    }

    /// Statement timeout, capped at the maximum the executor accepts.
    pub fn statement_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.statement_timeout_secs
                .unwrap_or(DEFAULT_STATEMENT_TIMEOUT_SECS)
                .min(MAX_STATEMENT_TIMEOUT_SECS),
        )
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == Some(0) {
            return Err("max_connections must be greater than 0".to_string());
        }
        if self.acquire_timeout_ms == Some(0) {
            return Err("acquire_timeout_ms must be greater than 0".to_string());
        }
        if self.statement_timeout_secs == Some(0) {
            return Err("statement_timeout must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Options set here win over `fallback`.
    pub fn or(self, fallback: PoolOptions) -> PoolOptions {
        PoolOptions {
            max_connections: self.max_connections.or(fallback.max_connections),
            acquire_timeout_ms: self.acquire_timeout_ms.or(fallback.acquire_timeout_ms),
            statement_timeout_secs: self
                .statement_timeout_secs
                .or(fallback.statement_timeout_secs),
        }
    }

    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig::new(
            self.max_connections_or_default(),
            self.acquire_timeout_or_default(),
        )
    }
}

/// Database connection configuration parsed from a connection URL.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Connection URL with pool options stripped (sensitive - not logged).
    pub connection_string: String,
    /// Connection pool configuration options parsed from URL query parameters.
    pub pool_options: PoolOptions,
}

impl DatabaseConfig {
    /// Pool option keys that we extract from URL query parameters.
    const POOL_OPTION_KEYS: &'static [&'static str] =
        &["max_connections", "acquire_timeout_ms", "statement_timeout"];

    /// Parse a database config from a connection URL.
    ///
    /// # Examples
    ///
    /// ```text
    /// sqlite::memory:
    /// sqlite:blog.db?mode=rwc&max_connections=4
    /// sqlite:blog.db?acquire_timeout_ms=500&statement_timeout=5
    /// ```
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut url = Url::parse(s).map_err(|e| format!("Invalid URL: {e}"))?;

        let scheme = url.scheme().to_lowercase();
        if scheme != "sqlite" {
            return Err(format!(
                "Unsupported database scheme '{scheme}'. Only sqlite: URLs are supported."
            ));
        }

        let mut opts = Self::extract_options(&mut url, Self::POOL_OPTION_KEYS);
        let pool_options = Self::parse_pool_options(&mut opts);
        pool_options.validate()?;

        Ok(Self {
            connection_string: url.to_string(),
            pool_options,
        })
    }

    /// Parse pool options from extracted URL query parameters.
    fn parse_pool_options(opts: &mut HashMap<String, String>) -> PoolOptions {
        PoolOptions {
            max_connections: opts.remove("max_connections").and_then(|v| v.parse().ok()),
            acquire_timeout_ms: opts
                .remove("acquire_timeout_ms")
                .and_then(|v| v.parse().ok()),
            statement_timeout_secs: opts
                .remove("statement_timeout")
                .and_then(|v| v.parse().ok()),
        }
    }

    /// Extract pool options from URL query params, keeping others for the driver.
    /// Uses proper URL encoding to preserve special characters in remaining params.
    fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
        let mut opts = HashMap::new();
        let remaining: Vec<(String, String)> = url
            .query_pairs()
            .filter_map(|(k, v)| {
                let key_lower = k.to_ascii_lowercase();
                if keys.contains(&key_lower.as_str()) {
                    opts.insert(key_lower, v.into_owned());
                    None
                } else {
                    Some((k.into_owned(), v.into_owned()))
                }
            })
            .collect();

        if remaining.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(remaining);
        }
        opts
    }
}

/// Configuration for the pool exhaustion check.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "db-lease-pool",
    about = "Runs the connection pool exhaustion scenario against a SQLite database",
    version,
    author
)]
pub struct Config {
    /// Database connection URL. Pool options may be given as query parameters.
    #[arg(
        short = 'd',
        long = "database",
        value_name = "URL",
        default_value = DEFAULT_DATABASE_URL,
        env = "DB_LEASE_POOL_DATABASE"
    )]
    pub database: String,

    /// Maximum pooled connections
    #[arg(long, env = "DB_LEASE_POOL_MAX_CONNECTIONS")]
    pub max_connections: Option<u32>,

    /// How long a query may wait for a pooled connection, in milliseconds
    #[arg(long, env = "DB_LEASE_POOL_ACQUIRE_TIMEOUT_MS")]
    pub acquire_timeout_ms: Option<u64>,

    /// Statement timeout in seconds
    #[arg(long, env = "DB_LEASE_POOL_STATEMENT_TIMEOUT")]
    pub statement_timeout: Option<u64>,

    /// Transaction timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_TRANSACTION_TIMEOUT_SECS,
        env = "DB_LEASE_POOL_TRANSACTION_TIMEOUT"
    )]
    pub transaction_timeout: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DB_LEASE_POOL_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DB_LEASE_POOL_JSON_LOGS")]
    pub json_logs: bool,

    /// Print the scenario report as JSON
    #[arg(long, env = "DB_LEASE_POOL_JSON_REPORT")]
    pub json_report: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            database: DEFAULT_DATABASE_URL.to_string(),
            max_connections: None,
            acquire_timeout_ms: None,
            statement_timeout: None,
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT_SECS,
            log_level: "info".to_string(),
            json_logs: false,
            json_report: false,
        }
    }

    /// Pool options given as flags.
    pub fn flag_pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_connections: self.max_connections,
            acquire_timeout_ms: self.acquire_timeout_ms,
            statement_timeout_secs: self.statement_timeout,
        }
    }

    /// Parse the database URL and merge its pool options with the flags.
    ///
    /// Flags take precedence over URL query parameters.
    pub fn database_config(&self) -> DbResult<DatabaseConfig> {
        let mut db = DatabaseConfig::parse(&self.database).map_err(DbError::invalid_input)?;
        let options = self.flag_pool_options();
        options.validate().map_err(DbError::invalid_input)?;
        db.pool_options = options.or(db.pool_options);
        Ok(db)
    }

    /// Get the transaction timeout as a Duration.
    pub fn transaction_timeout_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.transaction_timeout))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
