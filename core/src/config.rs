//! Configuration for notifybus-core

use crate::{Error, Result};
use std::time::Duration;

/// Environment variable holding the database URL
pub const ENV_DATABASE_URL: &str = "NOTIFYBUS_DATABASE_URL";
/// Fallback database URL variable
pub const ENV_DATABASE_URL_FALLBACK: &str = "DATABASE_URL";
/// Reconciliation tick in milliseconds
pub const ENV_RECONCILE_MS: &str = "NOTIFYBUS_RECONCILE_MS";
/// Keepalive ping period in milliseconds
pub const ENV_KEEPALIVE_MS: &str = "NOTIFYBUS_KEEPALIVE_MS";
/// Pool size
pub const ENV_MAX_CONNECTIONS: &str = "NOTIFYBUS_MAX_CONNECTIONS";

/// Configuration for the broker
#[derive(Debug, Clone)]
pub struct Config {
    /// How often the listener converges LISTEN state to the subscriptions (default: 500ms)
    ///
    /// This is also the worst-case delay before a new subscription starts
    /// receiving notifications.
    pub reconcile_interval: Duration,

    /// How often the listening connection is pinged with a no-op statement (default: 30s)
    pub keepalive_interval: Duration,

    /// Maximum pooled connections used for publishing and access (default: 10)
    pub max_connections: u32,

    /// Pool acquire timeout (default: 30s)
    pub acquire_timeout: Duration,

    /// Database URL (required)
    pub database_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_millis(500),
            keepalive_interval: Duration::from_secs(30),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            database_url: String::new(),
        }
    }
}

impl Config {
    /// Create a new config with the given database URL
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    /// Build a config from `NOTIFYBUS_*` environment variables
    ///
    /// Unset variables keep their defaults; set but unparsable ones are an error.
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var(ENV_DATABASE_URL)
            .or_else(|_| std::env::var(ENV_DATABASE_URL_FALLBACK))
            .unwrap_or_default();
        let mut config = Self::new(database_url);

        if let Some(ms) = env_number::<u64>(ENV_RECONCILE_MS)? {
            config.reconcile_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number::<u64>(ENV_KEEPALIVE_MS)? {
            config.keepalive_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_number::<u32>(ENV_MAX_CONNECTIONS)? {
            config.max_connections = n;
        }

        Ok(config)
    }

    /// Builder pattern: set reconciliation interval
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Builder pattern: set keepalive interval
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Builder pattern: set pool size
    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    /// Builder pattern: set acquire timeout
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Reject settings the listener loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.reconcile_interval.is_zero() {
            return Err(Error::Config("reconcile_interval must be non-zero".into()));
        }
        if self.keepalive_interval.is_zero() {
            return Err(Error::Config("keepalive_interval must be non-zero".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be non-zero".into()));
        }
        Ok(())
    }

    /// Check if this is a PostgreSQL connection
    pub fn is_postgres(&self) -> bool {
        self.database_url.starts_with("postgres://")
            || self.database_url.starts_with("postgresql://")
    }

    /// Check if this is a SQLite connection
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite://")
            || self.database_url.starts_with("sqlite:")
            || self.database_url.ends_with(".db")
            || self.database_url.ends_with(".sqlite")
            || self.database_url.ends_with(".sqlite3")
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} is not a valid number: {raw:?}"))),
        Err(_) => Ok(None),
    }
}
