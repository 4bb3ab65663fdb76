use crate::error::{DbError, FieldError};
use crate::monitor::Monitor;
use crate::repository::ORDER_COLUMNS;
use crate::transaction;
use chrono::{DateTime, Utc};
use core_types::enums::{OrderStatus, PaymentMethod, PaymentStatus};
use core_types::{line_total, NewOrder, NewOrderItem, Order, Timestamps};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use uuid::Uuid;

// Locks in ascending id order so concurrent orders over the same products cannot deadlock.
const LOCK_PRODUCTS: &str = "SELECT id, name, price, stock FROM products \
     WHERE id = ANY($1) AND deleted_at IS NULL ORDER BY id FOR UPDATE";

const DECREMENT_STOCK: &str = "UPDATE products SET stock = stock - $1, updated_at = $2 WHERE id = $3";

// Restocking takes the product locks in the same order as placement does.
const LOCK_ORDERED_PRODUCTS: &str = "SELECT p.id FROM products AS p \
     JOIN order_items AS oi ON oi.product_id = p.id \
     WHERE oi.order_id = $1 ORDER BY p.id FOR UPDATE OF p";

const RESTOCK: &str = "UPDATE products AS p SET stock = p.stock + oi.quantity, updated_at = $2 \
     FROM order_items AS oi WHERE oi.order_id = $1 AND oi.product_id = p.id";

const UPDATE_STATUS: &str =
    "UPDATE orders SET status = $1, delivery_date = $2, updated_at = $3 WHERE id = $4";

const INSERT_ORDER: &str = "INSERT INTO orders \
     (id, order_number, status, total_amount, shipping_address, customer_details, order_date, \
      payment_status, payment_method, notes, created_at, updated_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
     RETURNING id, order_number, status, total_amount, shipping_address, customer_details, \
      order_date, delivery_date, payment_status, payment_method, notes, created_at, updated_at";

/// An order request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderDraft {
    pub items: Vec<NewOrderItem>,
    pub shipping_address: JsonValue,
    pub customer_details: JsonValue,
    pub payment_method: PaymentMethod,
    pub notes: Option<String>,
}

fn present(value: Option<JsonValue>) -> Option<JsonValue> {
    value.filter(|v| !v.is_null())
}

/// Checks the request before any database work.
///
/// Lines naming the same product are merged into one, summing their quantities.
pub fn validate(request: NewOrder) -> Result<OrderDraft, DbError> {
    let NewOrder {
        items,
        shipping_address,
        customer_details,
        payment_method,
        notes,
    } = request;

    let (Some(shipping_address), Some(customer_details), Some(payment_method)) = (
        present(shipping_address),
        present(customer_details),
        payment_method,
    ) else {
        return Err(DbError::MissingFields);
    };
    if items.is_empty() {
        return Err(DbError::MissingFields);
    }

    let invalid: Vec<FieldError> = items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.quantity < 1)
        .map(|(idx, _)| FieldError::new(format!("items[{idx}].quantity"), "Quantity must be at least 1"))
        .collect();
    if !invalid.is_empty() {
        return Err(DbError::Validation(invalid));
    }

    let mut merged: Vec<NewOrderItem> = Vec::with_capacity(items.len());
    for item in items {
        match merged.iter_mut().find(|line| line.product_id == item.product_id) {
            Some(line) => line.quantity = line.quantity.saturating_add(item.quantity),
            None => merged.push(item),
        }
    }

    Ok(OrderDraft {
        items: merged,
        shipping_address,
        customer_details,
        payment_method,
        notes,
    })
}

#[derive(Debug, FromRow)]
struct LockedProduct {
    id: Uuid,
    name: String,
    price: Decimal,
    stock: i32,
}

#[derive(Debug, Clone, Copy)]
struct OrderLine {
    product_id: Uuid,
    quantity: i32,
    unit_price: Decimal,
    total_price: Decimal,
}

/// Places an order atomically: stock is checked and decremented, and the order and
/// its lines are written, inside one transaction. Any failure rolls everything back.
///
/// Returns the order row as committed. Callers wanting the items read them afterwards.
pub async fn place_order(pool: &PgPool, monitor: &Monitor, request: NewOrder) -> Result<Order, DbError> {
    let draft = validate(request)?;
    let mut tx = transaction::begin(pool, monitor).await?;

    let outcome = write_order(&mut *tx, monitor, &draft, Utc::now()).await;
    match transaction::settle(tx, monitor, outcome).await {
        Ok(order) => {
            tracing::info!(
                order_id = %order.id,
                order_number = %order.order_number,
                total_amount = %order.total_amount,
                items = draft.items.len(),
                "Order placed."
            );
            Ok(order)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Order placement rolled back.");
            Err(e)
        }
    }
}

/// Moves an order to `next` under a row lock. Only the moves allowed by
/// [`OrderStatus::next_statuses`] succeed.
///
/// Delivering stamps the delivery date. Cancelling puts the ordered quantities back in stock.
pub async fn update_status(
    pool: &PgPool,
    monitor: &Monitor,
    id: Uuid,
    next: OrderStatus,
) -> Result<Order, DbError> {
    let mut tx = transaction::begin(pool, monitor).await?;
    let outcome = transition(&mut *tx, monitor, id, next, Utc::now()).await;
    let order = transaction::settle(tx, monitor, outcome).await?;

    tracing::info!(order_id = %order.id, status = %order.status, "Order status changed.");
    Ok(order)
}

/// Cancels an order that has not shipped yet and restocks its products.
pub async fn cancel(pool: &PgPool, monitor: &Monitor, id: Uuid) -> Result<Order, DbError> {
    update_status(pool, monitor, id, OrderStatus::Cancelled).await
}

async fn transition(
    conn: &mut PgConnection,
    monitor: &Monitor,
    id: Uuid,
    next: OrderStatus,
    now: DateTime<Utc>,
) -> Result<Order, DbError> {
    let lock = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE");
    let mut order: Order = monitor
        .track(&lock, sqlx::query_as(&lock).bind(id).fetch_optional(&mut *conn))
        .await?
        .ok_or_else(|| DbError::NotFound(format!("Order {id}")))?;

    if !order.status.can_transition_to(next) {
        return Err(DbError::InvalidStatusTransition {
            from: order.status,
            to: next,
        });
    }

    if next == OrderStatus::Cancelled {
        monitor
            .track(
                LOCK_ORDERED_PRODUCTS,
                sqlx::query(LOCK_ORDERED_PRODUCTS).bind(id).fetch_all(&mut *conn),
            )
            .await?;
        monitor
            .track(
                RESTOCK,
                sqlx::query(RESTOCK).bind(id).bind(now).execute(&mut *conn),
            )
            .await?;
    }

    order.status = next;
    if next == OrderStatus::Delivered {
        order.delivery_date = Some(now);
    }
    order.timestamps.on_update(now);

    monitor
        .track(
            UPDATE_STATUS,
            sqlx::query(UPDATE_STATUS)
                .bind(order.status.as_str())
                .bind(order.delivery_date)
                .bind(order.timestamps.updated_at)
                .bind(order.id)
                .execute(&mut *conn),
        )
        .await?;
    Ok(order)
}

async fn write_order(
    conn: &mut PgConnection,
    monitor: &Monitor,
    draft: &OrderDraft,
    now: DateTime<Utc>,
) -> Result<Order, DbError> {
    let mut product_ids: Vec<Uuid> = draft.items.iter().map(|i| i.product_id).collect();
    product_ids.sort_unstable();
    product_ids.dedup();

    let locked: Vec<LockedProduct> = monitor
        .track(
            LOCK_PRODUCTS,
            sqlx::query_as(LOCK_PRODUCTS).bind(product_ids).fetch_all(&mut *conn),
        )
        .await?;
    let mut products: HashMap<Uuid, LockedProduct> = locked.into_iter().map(|p| (p.id, p)).collect();

    let mut total_amount = Decimal::ZERO;
    let mut lines = Vec::with_capacity(draft.items.len());

    for item in &draft.items {
        let product = products
            .get_mut(&item.product_id)
            .ok_or(DbError::ProductNotFound(item.product_id))?;
        if product.stock < item.quantity {
            return Err(DbError::InsufficientStock {
                product: product.name.clone(),
                available: product.stock,
                requested: item.quantity,
            });
        }

        monitor
            .track(
                DECREMENT_STOCK,
                sqlx::query(DECREMENT_STOCK)
                    .bind(item.quantity)
                    .bind(now)
                    .bind(product.id)
                    .execute(&mut *conn),
            )
            .await?;
        product.stock -= item.quantity;

        let total_price = line_total(product.price, item.quantity);
        total_amount += total_price;
        lines.push(OrderLine {
            product_id: product.id,
            quantity: item.quantity,
            unit_price: product.price,
            total_price,
        });
    }

    let stamps = Timestamps::on_create(now);
    let order: Order = monitor
        .track(
            INSERT_ORDER,
            sqlx::query_as(INSERT_ORDER)
                .bind(Uuid::new_v4())
                .bind(Order::generate_number(now))
                .bind(OrderStatus::Pending.as_str())
                .bind(total_amount)
                .bind(&draft.shipping_address)
                .bind(&draft.customer_details)
                .bind(now)
                .bind(PaymentStatus::Pending.as_str())
                .bind(draft.payment_method.as_str())
                .bind(&draft.notes)
                .bind(stamps.created_at)
                .bind(stamps.updated_at)
                .fetch_one(&mut *conn),
        )
        .await?;

    let mut insert_items = QueryBuilder::<Postgres>::new(
        "INSERT INTO order_items \
         (id, order_id, product_id, quantity, unit_price, total_price, discount, created_at, updated_at) ",
    );
    insert_items.push_values(&lines, |mut row, line| {
        row.push_bind(Uuid::new_v4())
            .push_bind(order.id)
            .push_bind(line.product_id)
            .push_bind(line.quantity)
            .push_bind(line.unit_price)
            .push_bind(line.total_price)
            .push_bind(Decimal::ZERO)
            .push_bind(stamps.created_at)
            .push_bind(stamps.updated_at);
    });
    let insert_sql = insert_items.sql().to_owned();
    monitor
        .track(&insert_sql, insert_items.build().execute(&mut *conn))
        .await?;

    Ok(order)
}
