use crate::error::ConfigError;
use config::{Environment, File, FileFormat};

// Declare the modules that make up this crate.
pub mod error;
pub mod settings;

// Re-export the core types to provide a clean public API.
pub use settings::{
    Config, DatabaseSettings, LoggingSettings, MaintenanceSettings, MonitorSettings, PaginationSettings,
    PoolSettings, RetrySettings, SslSettings,
};

/// Loads the application configuration.
///
/// Sources, later ones winning: built-in defaults, an optional `config.toml` in the
/// working directory, `STOREKEEPER__SECTION__KEY` environment variables, and finally
/// `DATABASE_URL` for the connection URL.
pub fn load_config() -> Result<Config, ConfigError> {
    let builder = config::Config::builder()
        .add_source(File::with_name("config.toml").required(false))
        .add_source(Environment::with_prefix("STOREKEEPER").separator("__"))
        .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?;

    finish(builder)
}

/// Loads the configuration from a TOML document, without consulting the environment.
pub fn load_config_from_str(toml: &str) -> Result<Config, ConfigError> {
    let builder = config::Config::builder().add_source(File::from_str(toml, FileFormat::Toml));
    finish(builder)
}

fn finish(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<Config, ConfigError> {
    // Attempt to deserialize the entire configuration into our `Config` struct
    let config = builder.build()?.try_deserialize::<Config>()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.pool.max, 10);
        assert_eq!(config.database.pool.min, 2);
        assert_eq!(config.database.pool.acquire_timeout_ms, 30_000);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.retry_delay_ms, 5_000);
        assert_eq!(config.monitor.slow_query_threshold_ms, 1_000);
        assert_eq!(config.pagination.default_page_size, 20);
        assert_eq!(config.maintenance.soft_delete_retention_days, 90);
        assert!(config.database.url.is_none());
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = load_config_from_str(
            r#"
            [database]
            host = "db.internal"

            [database.pool]
            max = 25

            [retry]
            retry_delay_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.pool.max, 25);
        assert_eq!(config.database.pool.min, 2);
        assert_eq!(config.retry.retry_delay_ms, 250);
        assert_eq!(config.retry.max_retries, 5);
    }

    #[test]
    fn min_pool_larger_than_max_is_rejected() {
        let err = load_config_from_str(
            r#"
            [database.pool]
            max = 2
            min = 3
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(msg) if msg.contains("pool.min")));
    }

    #[test]
    fn zero_retries_is_rejected() {
        let err = load_config_from_str("[retry]\nmax_retries = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn default_page_size_must_fit_under_the_cap() {
        let err = load_config_from_str(
            r#"
            [pagination]
            default_page_size = 50
            max_page_size = 10
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(msg) if msg.contains("default_page_size")));
    }
}
