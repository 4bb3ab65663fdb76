use crate::error::DbError;
use crate::monitor::Monitor;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use std::sync::Arc;

/// Tables that maintenance is allowed to touch. Statements are never built from input.
pub const MAINTAINED_TABLES: [&str; 3] = ["products", "orders", "order_items"];

// Products still referenced by an order line are kept so order history stays intact.
const PURGE_SOFT_DELETED: &str = r#"
    DELETE FROM products
    WHERE deleted_at IS NOT NULL
      AND deleted_at < $1
      AND NOT EXISTS (SELECT 1 FROM order_items AS oi WHERE oi.product_id = products.id)
    "#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceStep {
    VacuumAnalyze,
    Reindex,
    CleanupSoftDeleted,
}

impl MaintenanceStep {
    pub const ALL: [MaintenanceStep; 3] = [
        MaintenanceStep::VacuumAnalyze,
        MaintenanceStep::Reindex,
        MaintenanceStep::CleanupSoftDeleted,
    ];

    pub fn label(self) -> &'static str {
        match self {
            MaintenanceStep::VacuumAnalyze => "vacuum analyze",
            MaintenanceStep::Reindex => "reindex",
            MaintenanceStep::CleanupSoftDeleted => "cleanup soft-deleted products",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub reindexed: Vec<&'static str>,
    pub purged_products: u64,
}

/// Routine upkeep of the store's tables.
#[derive(Debug, Clone)]
pub struct Maintenance {
    pool: PgPool,
    monitor: Arc<Monitor>,
}

impl Maintenance {
    pub fn new(pool: PgPool, monitor: Arc<Monitor>) -> Self {
        Self { pool, monitor }
    }

    pub async fn vacuum_analyze(&self) -> Result<(), DbError> {
        const SQL: &str = "VACUUM ANALYZE";
        self.monitor
            .track(SQL, sqlx::raw_sql(SQL).execute(&self.pool))
            .await?;
        tracing::info!("Vacuum analyze completed.");
        Ok(())
    }

    pub async fn reindex(&self) -> Result<Vec<&'static str>, DbError> {
        for table in MAINTAINED_TABLES {
            let sql = format!("REINDEX TABLE {table}");
            self.monitor
                .track(&sql, sqlx::raw_sql(&sql).execute(&self.pool))
                .await?;
            tracing::info!(table, "Reindexed table.");
        }
        Ok(MAINTAINED_TABLES.to_vec())
    }

    /// Hard-deletes products that were soft-deleted more than `retention` ago.
    pub async fn cleanup_soft_deleted(&self, retention: Duration) -> Result<u64, DbError> {
        let cutoff = Utc::now() - retention;
        let purged = self
            .monitor
            .track(
                PURGE_SOFT_DELETED,
                sqlx::query(PURGE_SOFT_DELETED).bind(cutoff).execute(&self.pool),
            )
            .await?
            .rows_affected();
        tracing::info!(purged, %cutoff, "Purged soft-deleted products.");
        Ok(purged)
    }

    /// Runs every step in order, stopping at the first failure.
    /// `on_step` is told which step is about to start.
    pub async fn run(
        &self,
        retention: Duration,
        mut on_step: impl FnMut(MaintenanceStep),
    ) -> Result<MaintenanceReport, DbError> {
        let mut report = MaintenanceReport::default();
        for step in MaintenanceStep::ALL {
            on_step(step);
            match step {
                MaintenanceStep::VacuumAnalyze => self.vacuum_analyze().await?,
                MaintenanceStep::Reindex => report.reindexed = self.reindex().await?,
                MaintenanceStep::CleanupSoftDeleted => {
                    report.purged_products = self.cleanup_soft_deleted(retention).await?
                }
            }
        }
        Ok(report)
    }
}
