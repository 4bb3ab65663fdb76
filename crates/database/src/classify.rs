use crate::error::{DbError, FieldError};
use serde::Serialize;
use sqlx::error::{DatabaseError, ErrorKind};
use sqlx::postgres::PgDatabaseError;

/// Seconds a caller should wait before retrying after a connection failure.
pub const RETRY_AFTER_SECS: u64 = 30;

/// A transport-neutral description of a failure: a status code, a message safe to
/// show to callers, and optionally the offending fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedError {
    pub status_code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ClassifiedError {
    fn new(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
            errors: None,
            retry_after: None,
        }
    }

    fn unavailable() -> Self {
        Self {
            retry_after: Some(RETRY_AFTER_SECS),
            ..Self::new(503, "Database connection error")
        }
    }

    fn internal() -> Self {
        Self::new(500, "Internal server error")
    }

    fn with_errors(mut self, errors: Vec<FieldError>) -> Self {
        self.errors = Some(errors);
        self
    }
}

// (constraint, field, message) for every named constraint in the migrations.
static CONSTRAINT_FIELDS: [(&str, &str, &str); 16] = [
    ("products_name_key", "name", "Already exists"),
    ("products_price_check", "price", "Price must not be negative"),
    ("products_stock_check", "stock", "Stock must not be negative"),
    ("products_status_check", "status", "Unknown product status"),
    ("orders_order_number_key", "orderNumber", "Already exists"),
    ("orders_total_amount_check", "totalAmount", "Total amount must not be negative"),
    ("orders_status_check", "status", "Unknown order status"),
    ("orders_payment_status_check", "paymentStatus", "Unknown payment status"),
    ("orders_payment_method_check", "paymentMethod", "Unknown payment method"),
    ("order_items_order_product_key", "productId", "Product appears more than once in the order"),
    ("order_items_quantity_check", "quantity", "Quantity must be at least 1"),
    ("order_items_unit_price_check", "unitPrice", "Unit price must not be negative"),
    ("order_items_total_price_check", "totalPrice", "Total price must not be negative"),
    ("order_items_discount_check", "discount", "Discount must not be negative"),
    ("order_items_order_id_fkey", "orderId", "Referenced order does not exist"),
    ("order_items_product_id_fkey", "productId", "Referenced product does not exist"),
];

fn constraint_entry(constraint: &str) -> Option<(&'static str, &'static str)> {
    CONSTRAINT_FIELDS
        .iter()
        .find(|(name, _, _)| *name == constraint)
        .map(|(_, field, message)| (*field, *message))
}

fn camel_case(column: &str) -> String {
    let mut out = String::with_capacity(column.len());
    let mut upper = false;
    for ch in column.chars() {
        if ch == '_' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Maps data-layer errors onto [`ClassifiedError`]s.
///
/// Decisions use the error's variant, the driver's error kind and SQLSTATE, and the
/// violated constraint's name. Message text is never inspected.
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(error: &DbError) -> ClassifiedError {
        let classified = match error {
            DbError::ConnectionExhausted { .. } => ClassifiedError::unavailable(),
            DbError::Query(e) => Self::classify_sqlx(e),
            DbError::Validation(fields) => {
                ClassifiedError::new(400, "Validation error").with_errors(fields.clone())
            }
            DbError::InvalidOperator(_)
            | DbError::InvalidFilterField(_)
            | DbError::InvalidFilterValue { .. }
            | DbError::InvalidOrderField(_)
            | DbError::InvalidOrderDirection(_)
            | DbError::InvalidPagination(_)
            | DbError::MissingFields
            | DbError::ProductNotFound(_)
            | DbError::InsufficientStock { .. }
            | DbError::InvalidStatusTransition { .. } => ClassifiedError::new(400, error.to_string()),
            DbError::NotFound(_) => ClassifiedError::new(404, error.to_string()),
            DbError::ConnectionConfigError(_)
            | DbError::MigrationError(_) => ClassifiedError::internal(),
        };

        if classified.status_code >= 500 {
            tracing::error!(error = %error, status = classified.status_code, "Request failed.");
        } else {
            tracing::debug!(error = %error, status = classified.status_code, "Request rejected.");
        }
        classified
    }

    fn classify_sqlx(error: &sqlx::Error) -> ClassifiedError {
        match error {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => ClassifiedError::unavailable(),
            sqlx::Error::RowNotFound => ClassifiedError::new(404, "Resource not found"),
            sqlx::Error::Database(db) => Self::classify_database(&**db),
            _ => ClassifiedError::internal(),
        }
    }

    fn classify_database(db: &(dyn DatabaseError + 'static)) -> ClassifiedError {
        // SQLSTATE class 08 is "connection exception"; 57P0x covers server shutdown.
        if db
            .code()
            .is_some_and(|code| code.starts_with("08") || code.starts_with("57P0"))
        {
            return ClassifiedError::unavailable();
        }

        let constraint = db.constraint().and_then(constraint_entry);
        let column = db
            .try_downcast_ref::<PgDatabaseError>()
            .and_then(PgDatabaseError::column)
            .map(camel_case);
        let field = || {
            constraint
                .map(|(field, _)| field.to_string())
                .or_else(|| column.clone())
                .or_else(|| db.constraint().map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string())
        };

        match db.kind() {
            ErrorKind::UniqueViolation => ClassifiedError::new(409, "Duplicate entry")
                .with_errors(vec![FieldError::new(field(), "Already exists")]),
            ErrorKind::NotNullViolation => ClassifiedError::new(400, "Validation error")
                .with_errors(vec![FieldError::new(field(), "Must not be null")]),
            ErrorKind::CheckViolation | ErrorKind::ForeignKeyViolation => {
                let message = match (constraint, db.kind()) {
                    (Some((_, message)), _) => message,
                    (None, ErrorKind::ForeignKeyViolation) => "Referenced record does not exist",
                    (None, _) => "Value is not allowed",
                };
                ClassifiedError::new(400, "Validation error")
                    .with_errors(vec![FieldError::new(field(), message)])
            }
            _ => ClassifiedError::internal(),
        }
    }
}

impl From<&DbError> for ClassifiedError {
    fn from(error: &DbError) -> Self {
        ErrorClassifier::classify(error)
    }
}
