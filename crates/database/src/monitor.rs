use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Live connection counts of a pool.
pub trait PoolGauge: Send + Sync {
    /// Open connections, idle or in use.
    fn size(&self) -> u32;
    fn idle(&self) -> u32;
}

impl PoolGauge for PgPool {
    fn size(&self) -> u32 {
        PgPool::size(self)
    }

    fn idle(&self) -> u32 {
        u32::try_from(self.num_idle()).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub total: u32,
    pub idle: u32,
    pub active: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueryMetrics {
    pub total: u64,
    pub failed: u64,
    pub slow: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionMetrics {
    pub active: u32,
    pub idle: u32,
    pub failed: u64,
}

/// A point-in-time view of the monitor's counters and the pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub queries: QueryMetrics,
    pub connections: ConnectionMetrics,
    pub pool: PoolStatus,
    pub timestamp: DateTime<Utc>,
}

/// Observes every query issued through the data layer.
///
/// Counters only ever grow for the lifetime of the process. Nothing is counted
/// until [`Monitor::setup_query_logging`] has installed the hook.
pub struct Monitor {
    gauge: Box<dyn PoolGauge>,
    slow_threshold: Duration,
    installed: AtomicBool,
    queries_total: AtomicU64,
    queries_failed: AtomicU64,
    queries_slow: AtomicU64,
    connections_failed: AtomicU64,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("slow_threshold", &self.slow_threshold)
            .field("installed", &self.installed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Monitor {
    pub fn new(gauge: impl PoolGauge + 'static, slow_threshold: Duration) -> Self {
        Self {
            gauge: Box::new(gauge),
            slow_threshold,
            installed: AtomicBool::new(false),
            queries_total: AtomicU64::new(0),
            queries_failed: AtomicU64::new(0),
            queries_slow: AtomicU64::new(0),
            connections_failed: AtomicU64::new(0),
        }
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    /// Installs the per-query hook. Calling it again is harmless.
    pub fn setup_query_logging(&self) {
        if !self.installed.swap(true, Ordering::SeqCst) {
            tracing::info!(
                slow_query_threshold_ms = self.slow_threshold.as_millis() as u64,
                "Database query monitoring enabled."
            );
        }
    }

    /// The hook itself: called once per executed query.
    pub fn observe(&self, sql: &str, elapsed: Duration) {
        if !self.installed.load(Ordering::Acquire) {
            return;
        }
        self.queries_total.fetch_add(1, Ordering::Relaxed);
        if elapsed > self.slow_threshold {
            self.queries_slow.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, sql, "Slow query.");
        }
    }

    /// Counts a query that raised an error. It has already been counted by [`Monitor::observe`].
    pub fn observe_failure(&self, sql: &str, error: &sqlx::Error) {
        if !self.installed.load(Ordering::Acquire) {
            return;
        }
        self.queries_failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(error = %error, sql, "Query failed.");
    }

    /// Runs `query`, reporting its duration and outcome to the hook.
    pub async fn track<T, F>(&self, sql: &str, query: F) -> Result<T, sqlx::Error>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        let started = Instant::now();
        let result = query.await;
        self.observe(sql, started.elapsed());
        if let Err(error) = &result {
            self.observe_failure(sql, error);
        }
        result
    }

    pub fn record_connection_failure(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads the pool's live numbers. Never cached.
    pub fn pool_status(&self) -> PoolStatus {
        let total = self.gauge.size();
        let idle = self.gauge.idle().min(total);
        PoolStatus {
            total,
            idle,
            active: total - idle,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let pool = self.pool_status();
        MetricsSnapshot {
            queries: QueryMetrics {
                total: self.queries_total.load(Ordering::Relaxed),
                failed: self.queries_failed.load(Ordering::Relaxed),
                slow: self.queries_slow.load(Ordering::Relaxed),
            },
            connections: ConnectionMetrics {
                active: pool.active,
                idle: pool.idle,
                failed: self.connections_failed.load(Ordering::Relaxed),
            },
            pool,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct FakeGauge {
        size: Arc<AtomicU32>,
        idle: Arc<AtomicU32>,
    }

    impl PoolGauge for FakeGauge {
        fn size(&self) -> u32 {
            self.size.load(Ordering::SeqCst)
        }

        fn idle(&self) -> u32 {
            self.idle.load(Ordering::SeqCst)
        }
    }

    fn monitor() -> Monitor {
        Monitor::new(FakeGauge::default(), Duration::from_millis(1000))
    }

    #[test]
    fn nothing_is_counted_before_the_hook_is_installed() {
        let monitor = monitor();
        monitor.observe("SELECT 1", Duration::from_millis(5));
        assert_eq!(monitor.metrics().queries.total, 0);
    }

    #[test]
    fn slow_queries_are_counted_strictly_above_threshold() {
        let monitor = monitor();
        monitor.setup_query_logging();
        monitor.observe("SELECT 1", Duration::from_millis(1000));
        monitor.observe("SELECT pg_sleep(2)", Duration::from_millis(1001));
        monitor.observe("SELECT 2", Duration::from_millis(3));

        let queries = monitor.metrics().queries;
        assert_eq!(queries.total, 3);
        assert_eq!(queries.slow, 1);
        assert_eq!(queries.failed, 0);
    }

    #[tokio::test]
    async fn track_counts_failures_from_the_same_interception_point() {
        let monitor = monitor();
        monitor.setup_query_logging();

        let ok: Result<i32, sqlx::Error> = monitor.track("SELECT 1", async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        let failed: Result<i32, sqlx::Error> = monitor
            .track("SELECT broken", async { Err(sqlx::Error::RowNotFound) })
            .await;
        assert!(failed.is_err());

        let queries = monitor.metrics().queries;
        assert_eq!(queries.total, 2);
        assert_eq!(queries.failed, 1);
    }

    #[test]
    fn pool_status_is_read_live() {
        let gauge = FakeGauge::default();
        let (size, idle) = (gauge.size.clone(), gauge.idle.clone());
        let monitor = Monitor::new(gauge, Duration::from_secs(1));

        size.store(4, Ordering::SeqCst);
        idle.store(1, Ordering::SeqCst);
        assert_eq!(
            monitor.pool_status(),
            PoolStatus { total: 4, idle: 1, active: 3 }
        );

        idle.store(4, Ordering::SeqCst);
        let metrics = monitor.metrics();
        assert_eq!(metrics.pool.active, 0);
        assert_eq!(metrics.connections.idle, 4);
    }

    #[test]
    fn connection_failures_accumulate() {
        let monitor = monitor();
        monitor.record_connection_failure();
        monitor.record_connection_failure();
        assert_eq!(monitor.metrics().connections.failed, 2);
    }
}
