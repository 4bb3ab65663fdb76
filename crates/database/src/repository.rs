use crate::error::{DbError, FieldError};
use crate::monitor::Monitor;
use crate::order_transaction;
use crate::pagination::{Entity, Page, QueryOptimizer};
use crate::query_builder::{Column, ColumnKind, QueryRequest, SecureQueryBuilder};
use crate::transaction;
use chrono::Utc;
use core_types::{
    NewOrder, NewProduct, Order, OrderItem, OrderItemDetail, OrderStatus, OrderWithItems, Product,
    ProductSummary, ProductUpdate, SoftDelete,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::{FromRow, Row};
use std::sync::Arc;
use uuid::Uuid;

const PRODUCT_COLUMNS: &str = "id, name, description, price, stock, category, brand, specifications, \
     tags, status, created_at, updated_at, deleted_at";

pub(crate) const ORDER_COLUMNS: &str = "id, order_number, status, total_amount, shipping_address, customer_details, \
     order_date, delivery_date, payment_status, payment_method, notes, created_at, updated_at";

impl Entity for Product {
    const TABLE: &'static str = "products";
    const COLUMNS: &'static str = PRODUCT_COLUMNS;
    const FILTERABLE: &'static [Column] = &[
        Column::new("id", "id", ColumnKind::Uuid),
        Column::new("name", "name", ColumnKind::Text),
        Column::new("category", "category", ColumnKind::Text),
        Column::new("brand", "brand", ColumnKind::Text),
        Column::new("status", "status", ColumnKind::Text),
        Column::new("price", "price", ColumnKind::Decimal),
        Column::new("stock", "stock", ColumnKind::Integer),
        Column::new("createdAt", "created_at", ColumnKind::Timestamp),
        Column::new("updatedAt", "updated_at", ColumnKind::Timestamp),
    ];
    const SOFT_DELETE: bool = true;
}

impl Entity for Order {
    const TABLE: &'static str = "orders";
    const COLUMNS: &'static str = ORDER_COLUMNS;
    const FILTERABLE: &'static [Column] = &[
        Column::new("id", "id", ColumnKind::Uuid),
        Column::new("orderNumber", "order_number", ColumnKind::Text),
        Column::new("status", "status", ColumnKind::Text),
        Column::new("paymentStatus", "payment_status", ColumnKind::Text),
        Column::new("paymentMethod", "payment_method", ColumnKind::Text),
        Column::new("totalAmount", "total_amount", ColumnKind::Decimal),
        Column::new("orderDate", "order_date", ColumnKind::Timestamp),
        Column::new("createdAt", "created_at", ColumnKind::Timestamp),
        Column::new("updatedAt", "updated_at", ColumnKind::Timestamp),
    ];
}

/// Checks the product fields that are present. Absent fields pass.
fn check_product_fields(
    name: Option<&str>,
    price: Option<Decimal>,
    stock: Option<i32>,
) -> Result<(), DbError> {
    let mut errors = Vec::new();
    if name.is_some_and(|name| name.trim().is_empty()) {
        errors.push(FieldError::new("name", "Name must not be empty"));
    }
    if price.is_some_and(|price| price < Decimal::ZERO) {
        errors.push(FieldError::new("price", "Price must not be negative"));
    }
    if stock.is_some_and(|stock| stock < 0) {
        errors.push(FieldError::new("stock", "Stock must not be negative"));
    }
    if errors.is_empty() { Ok(()) } else { Err(DbError::Validation(errors)) }
}

/// Field checks run before a product is inserted.
fn validate_new_product(product: &NewProduct) -> Result<(), DbError> {
    check_product_fields(Some(product.name.as_str()), Some(product.price), Some(product.stock))
}

/// An update must change something, and what it changes passes the insert checks.
fn validate_product_update(update: &ProductUpdate) -> Result<(), DbError> {
    if update.is_empty() {
        return Err(DbError::MissingFields);
    }
    check_product_fields(update.name.as_deref(), update.price, update.stock)
}

/// Maps a joined `order_items`/`products` row onto an item with its product summary.
fn item_detail(row: &PgRow) -> Result<OrderItemDetail, sqlx::Error> {
    Ok(OrderItemDetail {
        item: OrderItem::from_row(row)?,
        product: ProductSummary {
            id: row.try_get("product_id")?,
            name: row.try_get("product_name")?,
            price: row.try_get("product_price")?,
            category: row.try_get("product_category")?,
        },
    })
}

/// The `DbRepository` provides the application-level data access methods.
/// Every statement goes through the [`Monitor`].
#[derive(Debug, Clone)]
pub struct DbRepository {
    pool: PgPool,
    monitor: Arc<Monitor>,
    optimizer: QueryOptimizer,
}

impl DbRepository {
    pub fn new(pool: PgPool, monitor: Arc<Monitor>) -> Self {
        let optimizer = QueryOptimizer::new(pool.clone(), monitor.clone());
        Self {
            pool,
            monitor,
            optimizer,
        }
    }

    /// Replaces the listing defaults (page size and its cap).
    pub fn with_page_sizes(mut self, default_page_size: u32, max_page_size: u32) -> Self {
        self.optimizer = self.optimizer.with_page_sizes(default_page_size, max_page_size);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ==========================================================================
    // Products
    // ==========================================================================

    pub async fn create_product(&self, new_product: NewProduct) -> Result<Product, DbError> {
        validate_new_product(&new_product)?;
        let product = new_product.into_product(Uuid::new_v4(), Utc::now());

        let sql = format!(
            r#"
            INSERT INTO products ({PRODUCT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {PRODUCT_COLUMNS}
            "#
        );
        let created: Product = self
            .monitor
            .track(
                &sql,
                sqlx::query_as(&sql)
                    .bind(product.id)
                    .bind(&product.name)
                    .bind(&product.description)
                    .bind(product.price)
                    .bind(product.stock)
                    .bind(&product.category)
                    .bind(&product.brand)
                    .bind(&product.specifications)
                    .bind(&product.tags)
                    .bind(product.status.as_str())
                    .bind(product.timestamps.created_at)
                    .bind(product.timestamps.updated_at)
                    .bind(product.deleted_at)
                    .fetch_one(&self.pool),
            )
            .await?;

        tracing::info!(product_id = %created.id, name = %created.name, "Product created.");
        Ok(created)
    }

    /// Fetches one product. Soft-deleted products are only visible with `with_deleted`.
    pub async fn get_product(&self, id: Uuid, with_deleted: bool) -> Result<Product, DbError> {
        let sql = format!(
            r#"
            SELECT {PRODUCT_COLUMNS} FROM products
            WHERE id = $1 AND ($2 OR deleted_at IS NULL)
            "#
        );
        self.monitor
            .track(
                &sql,
                sqlx::query_as(&sql)
                    .bind(id)
                    .bind(with_deleted)
                    .fetch_optional(&self.pool),
            )
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Product {id}")))
    }

    pub async fn list_products(&self, request: QueryRequest) -> Result<Page<Product>, DbError> {
        let query = SecureQueryBuilder::new(Product::FILTERABLE).create_secure_query(request)?;
        self.optimizer.find_with_pagination::<Product>(query).await
    }

    /// Applies a partial update to a live product. Deleted products must be restored first.
    pub async fn update_product(&self, id: Uuid, update: ProductUpdate) -> Result<Product, DbError> {
        validate_product_update(&update)?;

        let mut tx = transaction::begin(&self.pool, &self.monitor).await?;
        let outcome = self.write_product_update(&mut *tx, id, update).await;
        let product = transaction::settle(tx, &self.monitor, outcome).await?;

        tracing::info!(product_id = %id, "Product updated.");
        Ok(product)
    }

    async fn write_product_update(
        &self,
        conn: &mut PgConnection,
        id: Uuid,
        update: ProductUpdate,
    ) -> Result<Product, DbError> {
        let select = format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1 AND deleted_at IS NULL FOR UPDATE"
        );
        const PERSIST: &str = r#"
            UPDATE products
            SET name = $1, description = $2, price = $3, stock = $4, category = $5, brand = $6,
                specifications = $7, tags = $8, status = $9, updated_at = $10
            WHERE id = $11
            "#;

        let mut product: Product = self
            .monitor
            .track(&select, sqlx::query_as(&select).bind(id).fetch_optional(&mut *conn))
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Product {id}")))?;
        update.apply_to(&mut product, Utc::now());

        self.monitor
            .track(
                PERSIST,
                sqlx::query(PERSIST)
                    .bind(&product.name)
                    .bind(&product.description)
                    .bind(product.price)
                    .bind(product.stock)
                    .bind(&product.category)
                    .bind(&product.brand)
                    .bind(&product.specifications)
                    .bind(&product.tags)
                    .bind(product.status.as_str())
                    .bind(product.timestamps.updated_at)
                    .bind(product.id)
                    .execute(&mut *conn),
            )
            .await?;
        Ok(product)
    }

    /// Marks a product as deleted. Deleting an already deleted product changes nothing.
    pub async fn soft_delete_product(&self, id: Uuid) -> Result<Product, DbError> {
        self.update_deletion(id, true).await
    }

    /// Clears the deletion mark. Restoring a live product changes nothing.
    pub async fn restore_product(&self, id: Uuid) -> Result<Product, DbError> {
        self.update_deletion(id, false).await
    }

    async fn update_deletion(&self, id: Uuid, delete: bool) -> Result<Product, DbError> {
        let mut tx = transaction::begin(&self.pool, &self.monitor).await?;
        let outcome = self.write_deletion(&mut *tx, id, delete).await;
        let (product, changed) = transaction::settle(tx, &self.monitor, outcome).await?;

        if changed {
            tracing::info!(product_id = %id, deleted = delete, "Product deletion state changed.");
        }
        Ok(product)
    }

    /// Returns the product and whether its deletion mark changed.
    async fn write_deletion(
        &self,
        conn: &mut PgConnection,
        id: Uuid,
        delete: bool,
    ) -> Result<(Product, bool), DbError> {
        let select = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1 FOR UPDATE");
        const PERSIST: &str = "UPDATE products SET deleted_at = $1, updated_at = $2 WHERE id = $3";

        let mut product: Product = self
            .monitor
            .track(&select, sqlx::query_as(&select).bind(id).fetch_optional(&mut *conn))
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Product {id}")))?;

        if product.is_deleted() == delete {
            return Ok((product, false));
        }

        let now = Utc::now();
        if delete {
            product.soft_delete(now);
        } else {
            product.restore();
            product.timestamps.on_update(now);
        }

        self.monitor
            .track(
                PERSIST,
                sqlx::query(PERSIST)
                    .bind(product.deleted_at)
                    .bind(product.timestamps.updated_at)
                    .bind(product.id)
                    .execute(&mut *conn),
            )
            .await?;
        Ok((product, true))
    }

    // ==========================================================================
    // Orders
    // ==========================================================================

    /// Places an order and returns it with its items as committed.
    pub async fn create_order(&self, new_order: NewOrder) -> Result<OrderWithItems, DbError> {
        let order = order_transaction::place_order(&self.pool, &self.monitor, new_order).await?;
        self.get_order(order.id).await
    }

    /// Fetches an order together with its items and a summary of each item's product.
    pub async fn get_order(&self, id: Uuid) -> Result<OrderWithItems, DbError> {
        let order_sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        const ITEMS_SQL: &str = r#"
            SELECT oi.id, oi.order_id, oi.product_id, oi.quantity, oi.unit_price, oi.total_price,
                   oi.discount, oi.created_at, oi.updated_at,
                   p.name AS product_name, p.price AS product_price, p.category AS product_category
            FROM order_items AS oi
            JOIN products AS p ON p.id = oi.product_id
            WHERE oi.order_id = $1
            ORDER BY oi.created_at, oi.id
            "#;

        let (order, rows) = tokio::try_join!(
            self.monitor.track(
                &order_sql,
                sqlx::query_as::<_, Order>(&order_sql).bind(id).fetch_optional(&self.pool),
            ),
            self.monitor
                .track(ITEMS_SQL, sqlx::query(ITEMS_SQL).bind(id).fetch_all(&self.pool)),
        )?;

        let order = order.ok_or_else(|| DbError::NotFound(format!("Order {id}")))?;
        let items = rows.iter().map(item_detail).collect::<Result<Vec<_>, _>>()?;
        Ok(OrderWithItems { order, items })
    }

    /// Moves an order along its lifecycle. See [`OrderStatus::next_statuses`].
    pub async fn update_order_status(&self, id: Uuid, status: OrderStatus) -> Result<Order, DbError> {
        order_transaction::update_status(&self.pool, &self.monitor, id, status).await
    }

    /// Cancels a pending or processing order and puts its items back in stock.
    pub async fn cancel_order(&self, id: Uuid) -> Result<Order, DbError> {
        order_transaction::cancel(&self.pool, &self.monitor, id).await
    }

    pub async fn list_orders(&self, request: QueryRequest) -> Result<Page<Order>, DbError> {
        let query = SecureQueryBuilder::new(Order::FILTERABLE).create_secure_query(request)?;
        self.optimizer.find_with_pagination::<Order>(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn lamp() -> NewProduct {
        NewProduct {
            name: "Desk Lamp".to_string(),
            description: String::new(),
            price: dec!(19.99),
            stock: 3,
            category: "lighting".to_string(),
            brand: "Lumen".to_string(),
            specifications: None,
            tags: vec![],
            status: None,
        }
    }

    #[test]
    fn new_products_are_checked_field_by_field() {
        assert!(validate_new_product(&lamp()).is_ok());

        let broken = NewProduct {
            name: "  ".to_string(),
            price: dec!(-1),
            stock: -2,
            ..lamp()
        };
        match validate_new_product(&broken) {
            Err(DbError::Validation(fields)) => {
                let names: Vec<_> = fields.iter().map(|f| f.field.as_str()).collect();
                assert_eq!(names, ["name", "price", "stock"]);
            }
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn product_updates_reuse_the_insert_checks() {
        let empty = ProductUpdate::default();
        assert!(matches!(validate_product_update(&empty), Err(DbError::MissingFields)));

        let rename = ProductUpdate {
            name: Some("Floor Lamp".to_string()),
            ..Default::default()
        };
        assert!(validate_product_update(&rename).is_ok());

        let broken = ProductUpdate {
            name: Some(String::new()),
            stock: Some(-1),
            ..Default::default()
        };
        match validate_product_update(&broken) {
            Err(DbError::Validation(fields)) => {
                let names: Vec<_> = fields.iter().map(|f| f.field.as_str()).collect();
                assert_eq!(names, ["name", "stock"]);
            }
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn product_filters_reject_unlisted_fields() {
        let builder = SecureQueryBuilder::new(Product::FILTERABLE);
        let filters = json!({ "specifications": "x" });
        assert!(matches!(
            builder.build_where_clause(filters.as_object().unwrap()),
            Err(DbError::InvalidFilterField(field)) if field == "specifications"
        ));

        let filters = json!({ "category": "lighting", "price": { "lt": 20 } });
        let clause = builder.build_where_clause(filters.as_object().unwrap()).unwrap();
        assert_eq!(clause.conditions().len(), 2);
    }

    #[test]
    fn order_filters_use_column_names() {
        let builder = SecureQueryBuilder::new(Order::FILTERABLE);
        let filters = json!({ "paymentStatus": "paid" });
        let clause = builder.build_where_clause(filters.as_object().unwrap()).unwrap();
        assert_eq!(clause.conditions()[0].column, "payment_status");
    }
}
