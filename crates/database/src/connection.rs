use crate::error::DbError;
use crate::monitor::Monitor;
use crate::MIGRATOR;
use async_trait::async_trait;
use configuration::{DatabaseSettings, RetrySettings};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{Connection, PgPool};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const HEALTH_CHECK_QUERY: &str = "SELECT 1";

/// Builds the driver options from the typed settings.
///
/// A configured URL wins over the discrete host/port/name fields. TLS settings are
/// only applied when `ssl.require` is set, so an `sslmode` in the URL is respected.
pub fn connect_options(settings: &DatabaseSettings) -> Result<PgConnectOptions, DbError> {
    let options = match &settings.url {
        Some(url) => url
            .parse::<PgConnectOptions>()
            .map_err(|e| DbError::ConnectionConfigError(e.to_string()))?,
        None => PgConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .database(&settings.name)
            .username(&settings.username)
            .password(&settings.password),
    };

    if !settings.ssl.require {
        return Ok(options);
    }
    let mode = if settings.ssl.accept_invalid_certs {
        PgSslMode::Require
    } else {
        PgSslMode::VerifyFull
    };
    Ok(options.ssl_mode(mode))
}

/// Creates the shared connection pool without opening any connection yet.
///
/// Connections are established on demand; [`ConnectionManager::connect`] is what
/// proves the database is reachable.
pub fn create_pool(settings: &DatabaseSettings) -> Result<PgPool, DbError> {
    let pool_settings = &settings.pool;
    let pool = PgPoolOptions::new()
        .max_connections(pool_settings.max)
        .min_connections(pool_settings.min)
        .acquire_timeout(Duration::from_millis(pool_settings.acquire_timeout_ms))
        .idle_timeout(Duration::from_millis(pool_settings.idle_timeout_ms))
        .connect_lazy_with(connect_options(settings)?);
    Ok(pool)
}

/// Applies any pending migrations from `migrations/`.
pub async fn run_migrations(pool: &PgPool) -> Result<(), DbError> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

/// The operations the connection manager needs from a database.
///
/// Implemented for [`PgPool`]; tests substitute a scripted backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Opens (or borrows) a connection and proves the credentials are accepted.
    async fn authenticate(&self) -> Result<(), sqlx::Error>;

    /// Runs a trivial round-trip query.
    async fn ping(&self) -> Result<(), sqlx::Error>;

    /// Releases every connection held.
    async fn close(&self);
}

#[async_trait]
impl Backend for PgPool {
    async fn authenticate(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.acquire().await?;
        conn.ping().await
    }

    async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query(HEALTH_CHECK_QUERY).execute(self).await?;
        Ok(())
    }

    async fn close(&self) {
        PgPool::close(self).await;
    }
}

/// How often and how patiently [`ConnectionManager::connect`] retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, at least 1.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            retry_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(5_000))
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(settings.max_retries, Duration::from_millis(settings.retry_delay_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Unauthenticated,
    Connected,
    Failed,
}

/// Owns the database handle for the lifetime of the process.
pub struct ConnectionManager<B: Backend = PgPool> {
    backend: B,
    policy: RetryPolicy,
    state: Mutex<ConnectionState>,
    monitor: Option<Arc<Monitor>>,
}

impl<B: Backend> ConnectionManager<B> {
    pub fn new(backend: B, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            state: Mutex::new(ConnectionState::Unauthenticated),
            monitor: None,
        }
    }

    /// Reports connection failures and health probes to `monitor`.
    pub fn with_monitor(mut self, monitor: Arc<Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Authenticates against the database, retrying with a fixed delay.
    ///
    /// Returns on the first success. After `max_retries` failed attempts it gives up
    /// with [`DbError::ConnectionExhausted`]; callers must not retry further.
    pub async fn connect(&self) -> Result<(), DbError> {
        let max = self.policy.max_retries;
        let mut attempts = 0;

        loop {
            match self.backend.authenticate().await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(attempt = attempts + 1, "Database connection established.");
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    if let Some(monitor) = &self.monitor {
                        monitor.record_connection_failure();
                    }
                    tracing::error!(
                        error = %e,
                        "Failed to connect to database (attempt {}/{}).",
                        attempts,
                        max
                    );

                    if attempts >= max {
                        self.set_state(ConnectionState::Failed);
                        return Err(DbError::ConnectionExhausted { attempts });
                    }
                    tokio::time::sleep(self.policy.retry_delay).await;
                }
            }
        }
    }

    /// Like [`connect`](Self::connect), but releases the backend when every attempt failed.
    /// The state stays [`ConnectionState::Failed`].
    pub async fn connect_or_close(&self) -> Result<(), DbError> {
        let result = self.connect().await;
        if result.is_err() {
            self.backend.close().await;
            tracing::info!("Database connections closed after failed start-up.");
        }
        result
    }

    /// Liveness probe. Any failure is logged and reported as `false`, never raised.
    pub async fn health_check(&self) -> bool {
        let result = match &self.monitor {
            Some(monitor) => monitor.track(HEALTH_CHECK_QUERY, self.backend.ping()).await,
            None => self.backend.ping().await,
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Database health check failed.");
                false
            }
        }
    }

    /// Releases all pooled connections.
    pub async fn shutdown(&self) {
        self.backend.close().await;
        self.set_state(ConnectionState::Unauthenticated);
        tracing::info!("Database connections closed.");
    }
}
