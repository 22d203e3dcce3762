use std::env;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Process-wide defaults for connections, query execution and scheduling.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database used when a schema does not name one.
    pub default_database: String,
    /// Connection alias used when a schema does not name one.
    pub default_connection: String,
    /// Timeout applied to executions that are not given a context.
    pub query_timeout_ms: u64,
    /// How often the scheduler wakes to look for due jobs.
    pub scheduler_tick_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_database: "elemental".to_string(),
            default_connection: "default".to_string(),
            query_timeout_ms: 10_000,
            scheduler_tick_ms: 1_000,
        }
    }
}

impl Config {
    /// Defaults overridden by `ELEMENTAL_DATABASE`, `ELEMENTAL_CONNECTION`,
    /// `ELEMENTAL_QUERY_TIMEOUT_MS` and `ELEMENTAL_SCHEDULER_TICK_MS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(database) = env::var("ELEMENTAL_DATABASE") {
            config.default_database = database;
        }
        if let Ok(alias) = env::var("ELEMENTAL_CONNECTION") {
            config.default_connection = alias;
        }
        if let Ok(ms) = env::var("ELEMENTAL_QUERY_TIMEOUT_MS") {
            config.query_timeout_ms = parse_millis("ELEMENTAL_QUERY_TIMEOUT_MS", &ms)?;
        }
        if let Ok(ms) = env::var("ELEMENTAL_SCHEDULER_TICK_MS") {
            config.scheduler_tick_ms = parse_millis("ELEMENTAL_SCHEDULER_TICK_MS", &ms)?;
        }
        config.validate()
    }

    /// Parse from a JSON object; missing keys keep their defaults.
    pub fn from_json(value: &Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value.clone())?;
        config.validate()
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    fn validate(self) -> Result<Self> {
        if self.default_database.is_empty() {
            return Err(Error::Config("default_database must not be empty".into()));
        }
        if self.default_connection.is_empty() {
            return Err(Error::Config("default_connection must not be empty".into()));
        }
        if self.query_timeout_ms == 0 || self.scheduler_tick_ms == 0 {
            return Err(Error::Config("durations must be greater than zero".into()));
        }
        Ok(self)
    }
}

fn parse_millis(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name} must be a whole number of milliseconds: {raw}")))
}
