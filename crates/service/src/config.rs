//! Service configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use saga::{DEFAULT_TABLE_NAME, PostgresStoreConfig};
use thiserror::Error;

pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Errors raised while loading or validating [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Message transports the binary can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Process-local broker. Only messages published by this process are
    /// delivered.
    Memory,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Transport::Memory),
            other => Err(format!("unknown transport {other:?}, expected \"memory\"")),
        }
    }
}

/// Service configuration.
///
/// Reads from environment variables:
/// - `DATABASE_URL`: Postgres connection string (required)
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `5`)
/// - `HOST`: metrics bind address (default: `"0.0.0.0"`)
/// - `PORT`: metrics listen port (default: `9090`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_JSON`: emit JSON log lines when `true` or `1`
/// - `SAGA_TABLE_NAME`: saga instance table (default: `"saga_instances"`)
/// - `SHUTDOWN_TIMEOUT_SECS`: messaging drain timeout (default: `30`)
/// - `MESSAGE_TRANSPORT`: message transport, `memory` (required to run the
///   binary)
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub saga_table_name: String,
    pub shutdown_timeout: Duration,
    pub transport: Option<Transport>,
}

impl Config {
    /// Loads and validates configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads and validates configuration from `lookup`, which returns the
    /// value of a variable or `None` when unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            database_url: lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            max_connections: parse(&lookup, "DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "PORT")?.unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_json: lookup("LOG_JSON")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true"))
                .unwrap_or(defaults.log_json),
            saga_table_name: lookup("SAGA_TABLE_NAME").unwrap_or(defaults.saga_table_name),
            shutdown_timeout: parse(&lookup, "SHUTDOWN_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            transport: parse(&lookup, "MESSAGE_TRANSPORT")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.database_url.starts_with("postgres://")
            || self.database_url.starts_with("postgresql://"))
        {
            return Err(ConfigError::Invalid {
                key: "DATABASE_URL",
                reason: "expected a postgres:// connection string".to_string(),
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "DATABASE_MAX_CONNECTIONS",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "SHUTDOWN_TIMEOUT_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }
        self.store_config()
            .validate()
            .map_err(|e| ConfigError::Invalid {
                key: "SAGA_TABLE_NAME",
                reason: e.to_string(),
            })
    }

    /// The configured transport. The binary has no default transport.
    pub fn require_transport(&self) -> Result<Transport, ConfigError> {
        self.transport.ok_or(ConfigError::Missing("MESSAGE_TRANSPORT"))
    }

    pub fn store_config(&self) -> PostgresStoreConfig {
        PostgresStoreConfig::with_table_name(self.saga_table_name.clone())
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/sagas".to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            host: "0.0.0.0".to_string(),
            port: 9090,
            log_level: "info".to_string(),
            log_json: false,
            saga_table_name: DEFAULT_TABLE_NAME.to_string(),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            transport: None,
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_apply_when_only_database_url_is_set() {
        let config = load(&[("DATABASE_URL", "postgres://db/sagas")]).unwrap();
        assert_eq!(config.database_url, "postgres://db/sagas");
        assert_eq!(config.port, 9090);
        assert_eq!(config.log_level, "info");
        assert!(!config.log_json);
        assert_eq!(config.saga_table_name, "saga_instances");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.transport, None);
    }

    #[test]
    fn test_database_url_is_required() {
        assert!(matches!(load(&[]), Err(ConfigError::Missing("DATABASE_URL"))));
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = load(&[
            ("DATABASE_URL", "postgresql://db/sagas"),
            ("HOST", "127.0.0.1"),
            ("PORT", "8081"),
            ("LOG_JSON", "TRUE"),
            ("SAGA_TABLE_NAME", "orders.sagas"),
            ("SHUTDOWN_TIMEOUT_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(config.addr(), "127.0.0.1:8081");
        assert!(config.log_json);
        assert_eq!(config.store_config().table_name, "orders.sagas");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let url = ("DATABASE_URL", "postgres://db/sagas");
        assert!(matches!(
            load(&[url, ("PORT", "not-a-port")]),
            Err(ConfigError::Invalid { key: "PORT", .. })
        ));
        assert!(matches!(
            load(&[url, ("SHUTDOWN_TIMEOUT_SECS", "0")]),
            Err(ConfigError::Invalid { key: "SHUTDOWN_TIMEOUT_SECS", .. })
        ));
        assert!(matches!(
            load(&[url, ("SAGA_TABLE_NAME", "sagas; DROP TABLE x")]),
            Err(ConfigError::Invalid { key: "SAGA_TABLE_NAME", .. })
        ));
        assert!(matches!(
            load(&[("DATABASE_URL", "mysql://db")]),
            Err(ConfigError::Invalid { key: "DATABASE_URL", .. })
        ));
    }

    #[test]
    fn test_transport_must_be_chosen_explicitly() {
        let url = ("DATABASE_URL", "postgres://db/sagas");
        assert!(matches!(
            load(&[url]).unwrap().require_transport(),
            Err(ConfigError::Missing("MESSAGE_TRANSPORT"))
        ));
        assert_eq!(
            load(&[url, ("MESSAGE_TRANSPORT", "Memory")])
                .unwrap()
                .require_transport()
                .unwrap(),
            Transport::Memory
        );
        assert!(matches!(
            load(&[url, ("MESSAGE_TRANSPORT", "kafka")]),
            Err(ConfigError::Invalid { key: "MESSAGE_TRANSPORT", .. })
        ));
    }
}
