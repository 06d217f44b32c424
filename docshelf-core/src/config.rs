//! Connection configuration for storage adapters.
//!
//! [`StorageConfig`] is read once when an adapter starts. Defaults are applied here,
//! at the loading boundary, so adapters never carry hardcoded connection values.
//!
//! Values can come from any key/value [`ConfigSource`] using the dotted keys
//! `storage.mongo.db.host`, `storage.mongo.db.port`, `storage.mongo.db.username`,
//! `storage.mongo.db.password`, `storage.mongo.db.name` and the timing keys
//! `storage.mongo.db.connect_timeout_ms`, `storage.mongo.db.health_interval_ms`,
//! `storage.mongo.db.probe_timeout_ms`.

use std::{collections::HashMap, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

const KEY_PREFIX: &str = "storage.mongo.db";

/// A source of raw configuration values keyed by dotted names.
pub trait ConfigSource {
    fn get(&self, key: &str) -> Option<String>;
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Reads dotted keys from environment variables.
///
/// `storage.mongo.db.host` is looked up as `STORAGE_MONGO_DB_HOST`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSource;

impl EnvSource {
    pub fn variable_name(key: &str) -> String {
        key.replace('.', "_").to_ascii_uppercase()
    }
}

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(Self::variable_name(key)).ok()
    }
}

/// Connection settings for a document database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Upper bound for opening a connection.
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,
    /// Delay between two health probes.
    #[serde(with = "duration_ms", rename = "health_interval_ms")]
    pub health_interval: Duration,
    /// Upper bound for a single health probe.
    #[serde(with = "duration_ms", rename = "probe_timeout_ms")]
    pub probe_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 27017,
            username: "client_pyscript_core".to_string(),
            password: "ycappuccino".to_string(),
            database: "ycappuccino".to_string(),
            connect_timeout: Duration::from_millis(5_000),
            health_interval: Duration::from_millis(30_000),
            probe_timeout: Duration::from_millis(2_000),
        }
    }
}

impl StorageConfig {
    /// Loads the configuration from a key/value source.
    ///
    /// Missing keys keep their defaults; present but malformed values are errors.
    pub fn from_source(source: &impl ConfigSource) -> StorageResult<Self> {
        let defaults = Self::default();

        let config = Self {
            host: read(source, "host")?.unwrap_or(defaults.host),
            port: read(source, "port")?.unwrap_or(defaults.port),
            username: read(source, "username")?.unwrap_or(defaults.username),
            password: read(source, "password")?.unwrap_or(defaults.password),
            database: read(source, "name")?.unwrap_or(defaults.database),
            connect_timeout: read::<u64>(source, "connect_timeout_ms")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            health_interval: read::<u64>(source, "health_interval_ms")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.health_interval),
            probe_timeout: read::<u64>(source, "probe_timeout_ms")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
        };

        config.validate()?;

        Ok(config)
    }

    /// Loads the configuration from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Self::from_source(&EnvSource)
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> StorageResult<()> {
        if self.host.trim().is_empty() {
            return Err(StorageError::Configuration("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(StorageError::Configuration("port must not be 0".into()));
        }
        if self.database.trim().is_empty() {
            return Err(StorageError::Configuration("database name must not be empty".into()));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("health_interval", self.health_interval),
            ("probe_timeout", self.probe_timeout),
        ] {
            if value.is_zero() {
                return Err(StorageError::Configuration(format!("{name} must be positive")));
            }
        }

        Ok(())
    }

    /// The `host:port` address of the server.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn read<T>(source: &impl ConfigSource, name: &str) -> StorageResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{KEY_PREFIX}.{name}");

    source
        .get(&key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| StorageError::Configuration(format!("{key}: {e}")))
        })
        .transpose()
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
