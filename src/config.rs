//! Provider configuration
//!
//! Values come from the environment (a `.env` file is honored through
//! `dotenvy`) and fall back to the defaults below.

use std::{env, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use tracing::debug;

use crate::error::{QueryError, Result};

pub const ENV_DATABASE_URL: &str = "DEFERRED_QUERY_DATABASE_URL";
pub const ENV_PAGE_SIZE: &str = "DEFERRED_QUERY_PAGE_SIZE";
pub const ENV_ACQUIRE_TIMEOUT_SECS: &str = "DEFERRED_QUERY_ACQUIRE_TIMEOUT_SECS";
pub const ENV_FOREIGN_KEYS: &str = "DEFERRED_QUERY_FOREIGN_KEYS";
pub const ENV_BUSY_TIMEOUT_MS: &str = "DEFERRED_QUERY_BUSY_TIMEOUT_MS";
pub const ENV_WAL: &str = "DEFERRED_QUERY_WAL";

/// Default number of rows fetched per round trip by lazy enumerations
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Settings for SQLite-backed providers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// SQLite connection URL, e.g. `sqlite://data.db`
    pub database_url: String,
    /// Rows fetched per page while enumerating
    pub page_size: usize,
    /// Upper bound on opening one connection
    pub acquire_timeout_secs: u64,
    /// Whether to enforce foreign key constraints
    pub foreign_keys: bool,
    /// How long SQLite waits on a locked database
    pub busy_timeout_ms: u64,
    /// Whether to switch the database to WAL journaling
    pub wal: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            acquire_timeout_secs: 30,
            foreign_keys: true,
            busy_timeout_ms: 5_000,
            wal: false,
        }
    }
}

impl ProviderConfig {
    /// Load from the process environment after reading `.env`, if present
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, starting from the defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            config.database_url = url;
        }
        if let Some(value) = lookup(ENV_PAGE_SIZE) {
            config.page_size = parse(ENV_PAGE_SIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_ACQUIRE_TIMEOUT_SECS) {
            config.acquire_timeout_secs = parse(ENV_ACQUIRE_TIMEOUT_SECS, &value)?;
        }
        if let Some(value) = lookup(ENV_FOREIGN_KEYS) {
            config.foreign_keys = parse(ENV_FOREIGN_KEYS, &value)?;
        }
        if let Some(value) = lookup(ENV_BUSY_TIMEOUT_MS) {
            config.busy_timeout_ms = parse(ENV_BUSY_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_WAL) {
            config.wal = parse(ENV_WAL, &value)?;
        }
        config.validate()?;
        debug!(database_url = %config.database_url, page_size = config.page_size, "loaded provider configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(QueryError::configuration("page size must be at least 1"));
        }
        if self.database_url.trim().is_empty() {
            return Err(QueryError::configuration("database url must not be empty"));
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Connection options every context is opened with
    pub fn connect_options(&self) -> Result<SqliteConnectOptions> {
        let mut options = SqliteConnectOptions::from_str(&self.database_url)
            .map_err(|err| QueryError::configuration(format!("invalid database url `{}`: {err}", self.database_url)))?
            .foreign_keys(self.foreign_keys)
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(self.busy_timeout_ms));
        if self.wal {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }
        Ok(options)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| QueryError::configuration(format!("invalid {key} `{value}`: {err}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = ProviderConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, ProviderConfig::default());
        assert_eq!(config.acquire_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_overrides_from_lookup() {
        let config = ProviderConfig::from_lookup(lookup(&[
            (ENV_DATABASE_URL, "sqlite://orders.db"),
            (ENV_PAGE_SIZE, "32"),
            (ENV_FOREIGN_KEYS, "false"),
            (ENV_WAL, "true"),
        ]))
        .unwrap();

        assert_eq!(config.database_url, "sqlite://orders.db");
        assert_eq!(config.page_size, 32);
        assert!(!config.foreign_keys);
        assert!(config.wal);
        assert!(config.connect_options().is_ok());
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        let err = ProviderConfig::from_lookup(lookup(&[(ENV_PAGE_SIZE, "lots")])).unwrap_err();
        assert!(matches!(err, QueryError::ConfigurationError(_)));

        let err = ProviderConfig::from_lookup(lookup(&[(ENV_PAGE_SIZE, "0")])).unwrap_err();
        assert!(matches!(err, QueryError::ConfigurationError(_)));
    }

    #[test]
    fn test_deserializes_partial_documents() {
        let config: ProviderConfig = serde_json::from_str(r#"{"page_size": 8}"#).unwrap();
        assert_eq!(config.page_size, 8);
        assert_eq!(config.database_url, "sqlite::memory:");
    }
}
