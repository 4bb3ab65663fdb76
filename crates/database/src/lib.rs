//! # Storekeeper Database Crate
//!
//! This crate is the store's data layer: everything that talks to PostgreSQL
//! lives here, behind a small typed API.
//!
//! ## Architectural Principles
//!
//! - **Resilient Connection:** `ConnectionManager` retries the initial connection a bounded
//!   number of times, answers health checks, and closes the pool on shutdown.
//! - **Safe Dynamic Queries:** caller-supplied filters and orderings are validated against
//!   allow-lists and bound as parameters; identifiers never come from input.
//! - **Observed:** every statement runs through the `Monitor`, which counts queries,
//!   failures and slow queries.
//! - **Transactional Writes:** order placement checks and decrements stock under row locks
//!   in a single transaction. Status changes and cancellation lock the order row the same way.
//!
//! ## Public API
//!
//! - `create_pool` / `run_migrations`: build the lazily-connecting pool and apply the schema.
//! - `DbRepository`: products, orders, the order lifecycle and paginated listings.
//! - `ErrorClassifier`: maps a `DbError` onto a transport-neutral `ClassifiedError`.
//! - `Maintenance`: vacuum, reindex and purge of old soft-deleted rows.

pub mod classify;
pub mod connection;
pub mod error;
pub mod maintenance;
pub mod monitor;
pub mod order_transaction;
pub mod pagination;
pub mod query_builder;
pub mod repository;
mod transaction;

pub use classify::{ClassifiedError, ErrorClassifier};
pub use connection::{
    Backend, ConnectionManager, ConnectionState, RetryPolicy, connect_options, create_pool,
    run_migrations,
};
pub use error::{DbError, FieldError};
pub use maintenance::{Maintenance, MaintenanceReport, MaintenanceStep};
pub use monitor::{MetricsSnapshot, Monitor, PoolGauge, PoolStatus};
pub use pagination::{Entity, Page, Pagination, QueryOptimizer};
pub use query_builder::{QueryRequest, SecureQuery, SecureQueryBuilder};
pub use repository::DbRepository;

/// The schema migrations, embedded at compile time.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
