//! Centralized configuration for api-server.
//!
//! Values come from an optional TOML file with environment variables layered
//! on top. Everything is validated at startup to fail fast on
//! misconfiguration rather than at request time.
//!
//! The file is read from `CONFIG_PATH` when set (it must then exist), else
//! from `./config.toml` when present:
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [database]
//! provider = "sqlite"
//! path = "./data/items.db"
//! namespace = "items"
//!
//! [cache]
//! ttl_secs = 900
//! sweep_interval_secs = 60
//! invalidate_on_update = false
//!
//! [request]
//! timeout_secs = 10
//!
//! [log]
//! format = "json"
//! ```

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use domain::cache::CacheConfig;
use domain::service::ServiceConfig;
use serde::Deserialize;

/// File read when `CONFIG_PATH` is unset, if it exists.
const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Upper bound for every `*_SECS` setting (one year).
pub const MAX_SECS: u64 = 365 * 24 * 60 * 60;

/// Storage backend provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProvider {
    /// In-memory storage (data lost on restart)
    Memory,
    /// SQLite document store
    Sqlite,
}

impl StorageProvider {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("sqlite") {
            Self::Sqlite
        } else {
            Self::Memory
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Configuration error for {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerSection {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DatabaseSection {
    provider: Option<String>,
    path: Option<String>,
    namespace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CacheSection {
    ttl_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    invalidate_on_update: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RequestSection {
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LogSection {
    format: Option<String>,
}

/// On-disk configuration. Every key is optional and maps onto one
/// environment variable, which wins when both are set.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    server: ServerSection,
    database: DatabaseSection,
    cache: CacheSection,
    request: RequestSection,
    log: LogSection,
}

impl FileConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError {
            field: "CONFIG_PATH",
            message: format!("cannot read '{}': {}", path.as_ref().display(), e),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError {
            field: "CONFIG_PATH",
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// Flatten into the environment-variable names the loader reads.
    fn into_vars(self) -> HashMap<&'static str, String> {
        let entries = [
            ("SERVER_HOST", self.server.host),
            ("SERVER_PORT", self.server.port.map(|v| v.to_string())),
            ("STORAGE_PROVIDER", self.database.provider),
            ("DB_PATH", self.database.path),
            ("DB_NAMESPACE", self.database.namespace),
            ("CACHE_TTL_SECS", self.cache.ttl_secs.map(|v| v.to_string())),
            (
                "CACHE_SWEEP_INTERVAL_SECS",
                self.cache.sweep_interval_secs.map(|v| v.to_string()),
            ),
            (
                "CACHE_INVALIDATE_ON_UPDATE",
                self.cache.invalidate_on_update.map(|v| v.to_string()),
            ),
            (
                "REQUEST_TIMEOUT_SECS",
                self.request.timeout_secs.map(|v| v.to_string()),
            ),
            ("LOG_FORMAT", self.log.format),
        ];
        entries
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect()
    }
}

/// Server configuration loaded from environment variables.
///
/// All fields are validated at construction time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind host (default: 0.0.0.0)
    pub host: String,
    /// Bind port (default: 3001)
    pub port: u16,
    /// Storage provider (default: sqlite)
    pub storage_provider: StorageProvider,
    /// SQLite database file
    pub db_path: PathBuf,
    /// Collection (table) holding the item documents
    pub db_namespace: String,
    /// Cache entry lifetime; also the longest a read can lag an update
    pub cache_ttl: Duration,
    /// Period of the cache's background eviction
    pub cache_sweep_interval: Duration,
    /// Purge the cached item after a successful update
    pub invalidate_on_update: bool,
    /// Deadline attached to every request's context
    pub request_timeout: Duration,
    /// Log format
    pub log_format: LogFormat,
}

impl Config {
    /// Load and validate configuration from the optional config file and
    /// environment variables.
    ///
    /// Fails fast on invalid configuration.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match env::var("CONFIG_PATH").ok().filter(|s| !s.is_empty()) {
            Some(path) => FileConfig::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                FileConfig::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => FileConfig::default(),
        };
        Self::from_layers(file, |key| env::var(key).ok())
    }

    /// Environment lookup over file values: `var` wins, the file fills gaps.
    pub fn from_layers<F>(file: FileConfig, var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file_vars = file.into_vars();
        Self::from_lookup(|key| var(key).or_else(|| file_vars.get(key).cloned()))
    }

    /// Same as [`Config::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = var("SERVER_HOST")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "0.0.0.0".into());

        let port = match var("SERVER_PORT") {
            Some(s) => s.parse().map_err(|_| ConfigError {
                field: "SERVER_PORT",
                message: format!("Invalid port '{}'", s),
            })?,
            None => 3001,
        };

        let storage_provider =
            StorageProvider::from_str(&var("STORAGE_PROVIDER").unwrap_or_else(|| "sqlite".into()));

        let db_path = PathBuf::from(var("DB_PATH").unwrap_or_else(|| "./data/items.db".into()));

        let db_namespace = var("DB_NAMESPACE").unwrap_or_else(|| "items".into());
        if db_namespace.is_empty()
            || !db_namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError {
                field: "DB_NAMESPACE",
                message: format!("'{}' must match [A-Za-z0-9_]+", db_namespace),
            });
        }

        let cache_ttl = positive_secs(&var, "CACHE_TTL_SECS", 15 * 60)?;
        let cache_sweep_interval = positive_secs(&var, "CACHE_SWEEP_INTERVAL_SECS", 60)?;
        let request_timeout = positive_secs(&var, "REQUEST_TIMEOUT_SECS", 10)?;

        let invalidate_on_update = var("CACHE_INVALIDATE_ON_UPDATE")
            .map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let log_format =
            LogFormat::from_str(&var("LOG_FORMAT").unwrap_or_else(|| "pretty".into()));

        Ok(Self {
            host,
            port,
            storage_provider,
            db_path,
            db_namespace,
            cache_ttl,
            cache_sweep_interval,
            invalidate_on_update,
            request_timeout,
            log_format,
        })
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            cache: CacheConfig {
                ttl: self.cache_ttl,
                sweep_interval: self.cache_sweep_interval,
            },
            invalidate_on_update: self.invalidate_on_update,
        }
    }

    /// Log the read-after-write staleness the cache settings allow.
    pub fn log_staleness(&self) {
        if self.invalidate_on_update {
            tracing::info!("CACHE_INVALIDATE_ON_UPDATE set: updates purge cached items");
        } else {
            tracing::info!(
                ttl_secs = self.cache_ttl.as_secs(),
                "Cached items are not purged on update; reads may lag writes by up to CACHE_TTL_SECS"
            );
        }
    }
}

fn positive_secs<F>(var: &F, field: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = var(field) else {
        return Ok(Duration::from_secs(default));
    };
    match raw.parse::<u64>() {
        Ok(n) if (1..=MAX_SECS).contains(&n) => Ok(Duration::from_secs(n)),
        _ => Err(ConfigError {
            field,
            message: format!("'{}' must be between 1 and {} seconds", raw, MAX_SECS),
        }),
    }
}
