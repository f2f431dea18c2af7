//! Configuration loading for the broker.
//!
//! Layered loading using figment:
//! - Default values (compiled in)
//! - Configuration file (TOML)
//! - Environment variables (`COURIER_`-prefixed)
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_common::config::load_broker_config;
//!
//! let config = load_broker_config(Some("courier.toml"))?;
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DbmsType {
    /// Embedded SQLite database.
    SqliteNative,

    /// PostgreSQL server.
    Postgres,

    /// ODBC bridge (not built into this binary).
    Odbc,

    /// No backend configured; always rejected at startup.
    None,
}

impl DbmsType {
    /// Human-readable backend name, used in error context.
    pub fn type_name(&self) -> &'static str {
        match self {
            DbmsType::SqliteNative => "sqlite-native",
            DbmsType::Postgres => "postgres",
            DbmsType::Odbc => "odbc",
            DbmsType::None => "none",
        }
    }
}

/// Broker identity section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    /// Broker id; scopes persistent table names.
    #[serde(default = "default_broker_id")]
    pub id: String,
}

fn default_broker_id() -> String {
    "courier".to_string()
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            id: default_broker_id(),
        }
    }
}

/// Worker thread sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadsConfig {
    /// Number of dispatch workers.
    #[serde(default = "default_subscribers")]
    pub subscribers: usize,
}

fn default_subscribers() -> usize {
    4
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            subscribers: default_subscribers(),
        }
    }
}

/// Storage connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Backend selector.
    #[serde(default = "default_dbms_type")]
    pub dbms_type: DbmsType,

    /// Connection URL for the selected backend.
    #[serde(default = "default_url")]
    pub url: String,

    /// Maximum connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long `acquire` may block on an exhausted pool, in seconds.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_dbms_type() -> DbmsType {
    DbmsType::SqliteNative
}

fn default_url() -> String {
    "sqlite://courier.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout() -> u64 {
    30
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            dbms_type: default_dbms_type(),
            url: default_url(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Name of the global message journal table.
    #[serde(default = "default_message_journal")]
    pub message_journal: String,

    /// Filesystem root for per-destination data.
    #[serde(default = "default_data_root")]
    pub data: PathBuf,
}

fn default_message_journal() -> String {
    "courier_message_journal".to_string()
}

fn default_data_root() -> PathBuf {
    PathBuf::from("data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            message_journal: default_message_journal(),
            data: default_data_root(),
        }
    }
}

/// Complete broker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker identity.
    #[serde(default)]
    pub broker: BrokerSection,

    /// Worker sizing.
    #[serde(default)]
    pub threads: ThreadsConfig,

    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Load configuration from layered sources.
///
/// Sources (in order of precedence):
/// 1. Defaults (lowest)
/// 2. Configuration file (if provided)
/// 3. Environment variables (highest)
///
/// Environment variables are prefixed with the uppercase `prefix` followed
/// by `_`. For example, with prefix "courier", `COURIER_BROKER_ID` sets
/// `broker.id`.
pub fn load_config<T: Default + Serialize + for<'de> Deserialize<'de>>(
    prefix: &str,
    config_file: Option<&str>,
) -> Result<T, figment::Error> {
    let mut figment = Figment::new().merge(Serialized::defaults(T::default()));

    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed(&format!("{}_", prefix.to_uppercase())).split("_"));

    figment.extract()
}

/// Load broker configuration from defaults, file, and environment.
pub fn load_broker_config(config_file: Option<&str>) -> Result<BrokerConfig, figment::Error> {
    load_config("courier", config_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.broker.id, "courier");
        assert_eq!(config.threads.subscribers, 4);
        assert_eq!(config.storage.connection.dbms_type, DbmsType::SqliteNative);
        assert_eq!(config.storage.connection.max_connections, 10);
        assert_eq!(config.storage.message_journal, "courier_message_journal");
    }

    #[test]
    fn test_dbms_type_names() {
        assert_eq!(DbmsType::SqliteNative.type_name(), "sqlite-native");
        assert_eq!(DbmsType::None.type_name(), "none");
    }

    #[test]
    fn test_load_config_defaults() {
        let config: BrokerConfig = load_config("courier-test", None).unwrap();
        assert_eq!(config.threads.subscribers, 4);
    }

    #[test]
    fn test_env_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("COURIER_BROKER_ID", "node-7");
            jail.set_env("COURIER_THREADS_SUBSCRIBERS", "2");
            let config: BrokerConfig = load_config("courier", None).unwrap();
            assert_eq!(config.broker.id, "node-7");
            assert_eq!(config.threads.subscribers, 2);
            Ok(())
        });
    }
}
