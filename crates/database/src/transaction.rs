use crate::error::DbError;
use crate::monitor::Monitor;
use sqlx::{PgPool, Postgres, Transaction};

pub(crate) type PgTransaction = Transaction<'static, Postgres>;

/// Opens a transaction. Acquiring the connection and `BEGIN` count as one tracked statement.
pub(crate) async fn begin(pool: &PgPool, monitor: &Monitor) -> Result<PgTransaction, DbError> {
    Ok(monitor.track("BEGIN", pool.begin()).await?)
}

pub(crate) async fn commit(tx: PgTransaction, monitor: &Monitor) -> Result<(), DbError> {
    Ok(monitor.track("COMMIT", tx.commit()).await?)
}

pub(crate) async fn rollback(tx: PgTransaction, monitor: &Monitor) -> Result<(), DbError> {
    Ok(monitor.track("ROLLBACK", tx.rollback()).await?)
}

/// Commits when `outcome` succeeded and rolls back otherwise.
///
/// A failed rollback is logged and the original error is returned.
pub(crate) async fn settle<T>(
    tx: PgTransaction,
    monitor: &Monitor,
    outcome: Result<T, DbError>,
) -> Result<T, DbError> {
    match outcome {
        Ok(value) => {
            commit(tx, monitor).await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_error) = rollback(tx, monitor).await {
                tracing::error!(error = %rollback_error, "Failed to roll back transaction.");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use std::time::Duration;

    #[tokio::test]
    async fn a_failed_begin_is_counted_by_the_monitor() {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgres://127.0.0.1:1/unreachable")
            .unwrap();
        let monitor = Monitor::new(pool.clone(), Duration::from_secs(1));
        monitor.setup_query_logging();

        let Err(err) = begin(&pool, &monitor).await else {
            panic!("nothing listens on port 1");
        };
        assert!(matches!(err, DbError::Query(_)));

        let queries = monitor.metrics().queries;
        assert_eq!(queries.total, 1);
        assert_eq!(queries.failed, 1);
    }
}
