use crate::enums::{OrderStatus, PaymentMethod, PaymentStatus, ProductStatus};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

// ==============================================================================
// Lifecycle Steps
// ==============================================================================

/// Creation and modification times of a persisted row.
///
/// These are never filled in implicitly. Writers call [`Timestamps::on_create`]
/// when building a new row and [`Timestamps::on_update`] before persisting a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Timestamps {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Timestamps {
    pub fn on_create(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves `updated_at` forward. A clock that went backwards never moves it before `created_at`.
    pub fn on_update(&mut self, now: DateTime<Utc>) {
        self.updated_at = now.max(self.created_at);
    }
}

/// Entities that are marked as deleted instead of being removed.
pub trait SoftDelete {
    fn deleted_at(&self) -> Option<DateTime<Utc>>;
    fn soft_delete(&mut self, now: DateTime<Utc>);
    fn restore(&mut self);

    fn is_deleted(&self) -> bool {
        self.deleted_at().is_some()
    }
}

// ==============================================================================
// Catalog
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub price: Decimal,
    /// Units on hand. Never negative.
    pub stock: i32,
    pub category: String,
    pub brand: String,
    pub specifications: JsonValue,
    pub tags: Vec<String>,
    #[sqlx(try_from = "String")]
    pub status: ProductStatus,
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub timestamps: Timestamps,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SoftDelete for Product {
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn soft_delete(&mut self, now: DateTime<Utc>) {
        self.deleted_at = Some(now);
        self.timestamps.on_update(now);
    }

    fn restore(&mut self) {
        self.deleted_at = None;
    }
}

/// The slice of a product embedded in order responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSummary {
    pub id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub category: String,
}

/// A product as submitted for creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProduct {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price: Decimal,
    #[serde(default)]
    pub stock: i32,
    pub category: String,
    pub brand: String,
    #[serde(default)]
    pub specifications: Option<JsonValue>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: Option<ProductStatus>,
}

impl NewProduct {
    /// Builds the row to insert, stamped with `now`.
    pub fn into_product(self, id: Uuid, now: DateTime<Utc>) -> Product {
        Product {
            id,
            name: self.name,
            description: self.description,
            price: self.price,
            stock: self.stock,
            category: self.category,
            brand: self.brand,
            specifications: self
                .specifications
                .unwrap_or_else(|| JsonValue::Object(Default::default())),
            tags: self.tags,
            status: self.status.unwrap_or(ProductStatus::Active),
            timestamps: Timestamps::on_create(now),
            deleted_at: None,
        }
    }
}

/// A partial change to a product. Absent fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub stock: Option<i32>,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub specifications: Option<JsonValue>,
    pub tags: Option<Vec<String>>,
    pub status: Option<ProductStatus>,
}

impl ProductUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Copies the present fields onto `product` and runs the update step.
    pub fn apply_to(self, product: &mut Product, now: DateTime<Utc>) {
        if let Some(name) = self.name {
            product.name = name;
        }
        if let Some(description) = self.description {
            product.description = description;
        }
        if let Some(price) = self.price {
            product.price = price;
        }
        if let Some(stock) = self.stock {
            product.stock = stock;
        }
        if let Some(category) = self.category {
            product.category = category;
        }
        if let Some(brand) = self.brand {
            product.brand = brand;
        }
        if let Some(specifications) = self.specifications {
            product.specifications = specifications;
        }
        if let Some(tags) = self.tags {
            product.tags = tags;
        }
        if let Some(status) = self.status {
            product.status = status;
        }
        product.timestamps.on_update(now);
    }
}

// ==============================================================================
// Orders
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    #[sqlx(try_from = "String")]
    pub status: OrderStatus,
    pub total_amount: Decimal,
    pub shipping_address: JsonValue,
    pub customer_details: JsonValue,
    pub order_date: DateTime<Utc>,
    pub delivery_date: Option<DateTime<Utc>>,
    #[sqlx(try_from = "String")]
    pub payment_status: PaymentStatus,
    #[sqlx(try_from = "String")]
    pub payment_method: PaymentMethod,
    pub notes: Option<String>,
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub timestamps: Timestamps,
}

impl Order {
    /// Builds a human-readable, collision-resistant order number such as `ORD-1718000000000-3F9A12BC`.
    pub fn generate_number(now: DateTime<Utc>) -> String {
        let suffix = Uuid::new_v4().simple().to_string().to_uppercase();
        format!("ORD-{}-{}", now.timestamp_millis(), &suffix[..8])
    }
}

/// One line of an order. Owned by exactly one order, references one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
    pub discount: Decimal,
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub timestamps: Timestamps,
}

/// Price of `quantity` units at `unit_price`.
pub fn line_total(unit_price: Decimal, quantity: i32) -> Decimal {
    unit_price * Decimal::from(quantity)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemDetail {
    #[serde(flatten)]
    pub item: OrderItem,
    pub product: ProductSummary,
}

/// An order together with its lines, as returned after placement or lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderWithItems {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItemDetail>,
}

// ==============================================================================
// Order Placement Input
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderItem {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// An order request as submitted by a caller. Every field is required; they are
/// optional here only so that a missing one can be reported instead of failing to parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    #[serde(default)]
    pub items: Vec<NewOrderItem>,
    pub shipping_address: Option<JsonValue>,
    pub customer_details: Option<JsonValue>,
    pub payment_method: Option<PaymentMethod>,
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn on_update_only_moves_updated_at() {
        let mut stamps = Timestamps::on_create(at(0));
        stamps.on_update(at(60));
        assert_eq!(stamps.created_at, at(0));
        assert_eq!(stamps.updated_at, at(60));

        stamps.on_update(at(0) - Duration::seconds(5));
        assert_eq!(stamps.updated_at, at(0));
    }

    #[test]
    fn soft_delete_and_restore() {
        let mut product = Product {
            id: Uuid::new_v4(),
            name: "Desk Lamp".to_string(),
            description: "Warm light".to_string(),
            price: dec!(19.99),
            stock: 4,
            category: "lighting".to_string(),
            brand: "Lumen".to_string(),
            specifications: serde_json::json!({}),
            tags: vec![],
            status: ProductStatus::Active,
            timestamps: Timestamps::on_create(at(0)),
            deleted_at: None,
        };

        product.soft_delete(at(30));
        assert!(product.is_deleted());
        assert_eq!(product.timestamps.updated_at, at(30));

        product.restore();
        assert!(!product.is_deleted());
    }

    #[test]
    fn new_product_fills_in_defaults() {
        let parsed: NewProduct = serde_json::from_str(
            r#"{"name":"Desk Lamp","price":"19.99","category":"lighting","brand":"Lumen"}"#,
        )
        .unwrap();
        let product = parsed.into_product(Uuid::nil(), at(0));

        assert_eq!(product.price, dec!(19.99));
        assert_eq!(product.stock, 0);
        assert_eq!(product.status, ProductStatus::Active);
        assert_eq!(product.specifications, serde_json::json!({}));
        assert_eq!(product.timestamps, Timestamps::on_create(at(0)));
        assert!(!product.is_deleted());
    }

    #[test]
    fn product_update_only_touches_present_fields() {
        let mut product = NewProduct {
            name: "Desk Lamp".to_string(),
            description: "Warm light".to_string(),
            price: dec!(19.99),
            stock: 4,
            category: "lighting".to_string(),
            brand: "Lumen".to_string(),
            specifications: None,
            tags: vec!["desk".to_string()],
            status: None,
        }
        .into_product(Uuid::nil(), at(0));

        let update: ProductUpdate =
            serde_json::from_str(r#"{"price":"17.50","status":"inactive"}"#).unwrap();
        assert!(!update.is_empty());
        update.apply_to(&mut product, at(90));

        assert_eq!(product.price, dec!(17.50));
        assert_eq!(product.status, ProductStatus::Inactive);
        assert_eq!(product.name, "Desk Lamp");
        assert_eq!(product.tags, ["desk"]);
        assert_eq!(product.timestamps.created_at, at(0));
        assert_eq!(product.timestamps.updated_at, at(90));
        assert!(ProductUpdate::default().is_empty());
    }

    #[test]
    fn line_total_multiplies_exactly() {
        assert_eq!(line_total(dec!(19.99), 3), dec!(59.97));
        assert_eq!(line_total(dec!(0), 7), dec!(0));
    }

    #[test]
    fn order_numbers_are_unique_for_the_same_instant() {
        let now = at(0);
        let a = Order::generate_number(now);
        let b = Order::generate_number(now);
        assert!(a.starts_with(&format!("ORD-{}-", now.timestamp_millis())));
        assert_ne!(a, b);
    }

    #[test]
    fn new_order_tolerates_missing_fields_when_parsing() {
        let parsed: NewOrder = serde_json::from_str(r#"{"paymentMethod":"paypal"}"#).unwrap();
        assert!(parsed.items.is_empty());
        assert_eq!(parsed.payment_method, Some(PaymentMethod::Paypal));
        assert!(parsed.shipping_address.is_none());
    }
}
