use core_types::OrderStatus;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// A constraint violation attributed to a single input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid database connection configuration: {0}")]
    ConnectionConfigError(String),

    #[error("Failed to connect to the database after {attempts} attempts")]
    ConnectionExhausted { attempts: u32 },

    #[error("Database query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("{0} not found")]
    NotFound(String),

    // --- Query construction ---
    #[error("Invalid operator: {0}")]
    InvalidOperator(String),

    #[error("Invalid filter field: {0}")]
    InvalidFilterField(String),

    #[error("Invalid value for filter field {field}: {reason}")]
    InvalidFilterValue { field: String, reason: String },

    #[error("Invalid order field: {0}")]
    InvalidOrderField(String),

    #[error("Invalid order direction: {0}")]
    InvalidOrderDirection(String),

    #[error("Invalid pagination: {0}")]
    InvalidPagination(String),

    // --- Order placement ---
    #[error("Missing required fields")]
    MissingFields,

    #[error("Product not found: {0}")]
    ProductNotFound(Uuid),

    #[error("Insufficient stock for product: {product} (available {available}, requested {requested})")]
    InsufficientStock {
        product: String,
        available: i32,
        requested: i32,
    },

    // --- Order lifecycle ---
    #[error("Cannot move an order from {from} to {to}")]
    InvalidStatusTransition { from: OrderStatus, to: OrderStatus },

    #[error("Validation failed for {} field(s)", .0.len())]
    Validation(Vec<FieldError>),
}
