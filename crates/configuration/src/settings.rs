use crate::error::ConfigError;
use serde::Deserialize;
use std::path::PathBuf;

/// The root configuration structure for the entire application.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSettings,
    pub retry: RetrySettings,
    pub monitor: MonitorSettings,
    pub pagination: PaginationSettings,
    pub maintenance: MaintenanceSettings,
    pub logging: LoggingSettings,
}

/// Where and how to reach PostgreSQL.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// A full connection URL. When present it wins over the discrete fields below.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    pub password: String,
    pub pool: PoolSettings,
    pub ssl: SslSettings,
}

/// Bounds of the shared connection pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max: u32,
    pub min: u32,
    /// How long a caller waits for a free connection before giving up.
    pub acquire_timeout_ms: u64,
    /// How long an unused connection is kept before it is closed.
    pub idle_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SslSettings {
    pub require: bool,
    /// Encrypt, but skip certificate verification (managed databases with self-signed certs).
    pub accept_invalid_certs: bool,
}

/// Startup connection retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Queries taking strictly longer than this are counted and logged as slow.
    pub slow_query_threshold_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaginationSettings {
    pub default_page_size: u32,
    pub max_page_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    /// Soft-deleted rows older than this are purged by the maintenance run.
    pub soft_delete_retention_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    /// When set, logs are also written to a daily-rolling file in this directory.
    pub directory: Option<PathBuf>,
}

// --- Default Implementations ---
// These mirror a local development database, so an empty or missing
// `config.toml` still yields a usable configuration.

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            name: "storekeeper".to_string(),
            username: "postgres".to_string(),
            password: String::new(),
            pool: PoolSettings::default(),
            ssl: SslSettings::default(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max: 10,
            min: 2,
            acquire_timeout_ms: 30_000,
            idle_timeout_ms: 10_000,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_ms: 5_000,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: 1_000,
        }
    }
}

impl Default for PaginationSettings {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            soft_delete_retention_days: 90,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

impl Config {
    /// Checks the cross-field rules that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.database.pool;
        if pool.max == 0 {
            return Err(ConfigError::ValidationError(
                "database.pool.max must be at least 1".to_string(),
            ));
        }
        if pool.min > pool.max {
            return Err(ConfigError::ValidationError(format!(
                "database.pool.min ({}) must not exceed database.pool.max ({})",
                pool.min, pool.max
            )));
        }
        if self.retry.max_retries == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_retries must be at least 1".to_string(),
            ));
        }
        let paging = &self.pagination;
        if paging.default_page_size == 0 || paging.max_page_size == 0 {
            return Err(ConfigError::ValidationError(
                "pagination page sizes must be at least 1".to_string(),
            ));
        }
        if paging.default_page_size > paging.max_page_size {
            return Err(ConfigError::ValidationError(format!(
                "pagination.default_page_size ({}) must not exceed pagination.max_page_size ({})",
                paging.default_page_size, paging.max_page_size
            )));
        }
        Ok(())
    }
}
