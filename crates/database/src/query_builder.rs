//! Turns untrusted filter and sort input into SQL fragments.
//!
//! Nothing from the caller is ever spliced into SQL text. Field names are looked up
//! in a per-entity allow-list that yields the real column name, operators come from
//! a closed table, sort directions are an enum, and every value is a bound parameter.

use crate::error::DbError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value as JsonValue};
use sqlx::{Postgres, QueryBuilder};
use std::str::FromStr;
use uuid::Uuid;

// ==============================================================================
// Operators
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Gt,
    Lt,
    Like,
}

impl Operator {
    /// The operator allow-list.
    pub const ALL: [Operator; 4] = [Operator::Eq, Operator::Gt, Operator::Lt, Operator::Like];

    /// The tag accepted from callers.
    pub fn tag(self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Gt => "gt",
            Operator::Lt => "lt",
            Operator::Like => "like",
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Like => "LIKE",
        }
    }
}

impl FromStr for Operator {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operator::ALL
            .into_iter()
            .find(|op| op.tag() == s)
            .ok_or_else(|| DbError::InvalidOperator(s.to_string()))
    }
}

// ==============================================================================
// Columns & Values
// ==============================================================================

/// The SQL type a filter value must be coerced to before binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Uuid,
    Text,
    Integer,
    Decimal,
    Timestamp,
}

/// An allow-listed field: the name callers use, the column it maps to, and its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub field: &'static str,
    pub column: &'static str,
    pub kind: ColumnKind,
}

impl Column {
    pub const fn new(field: &'static str, column: &'static str, kind: ColumnKind) -> Self {
        Self { field, column, kind }
    }
}

/// Fields every listing may be ordered by.
pub static ORDER_FIELDS: [Column; 3] = [
    Column::new("id", "id", ColumnKind::Uuid),
    Column::new("createdAt", "created_at", ColumnKind::Timestamp),
    Column::new("updatedAt", "updated_at", ColumnKind::Timestamp),
];

#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Uuid(Uuid),
    Text(String),
    Integer(i64),
    Decimal(Decimal),
    Timestamp(DateTime<Utc>),
    Null,
}

impl BindValue {
    fn coerce(column: &Column, value: &JsonValue) -> Result<Self, DbError> {
        let invalid = |reason: &str| DbError::InvalidFilterValue {
            field: column.field.to_string(),
            reason: reason.to_string(),
        };

        match (column.kind, value) {
            (_, JsonValue::Null) => Ok(BindValue::Null),
            (_, JsonValue::Array(_) | JsonValue::Object(_)) => Err(invalid("expected a scalar value")),
            (ColumnKind::Text, JsonValue::String(s)) => Ok(BindValue::Text(s.clone())),
            (ColumnKind::Text, _) => Err(invalid("expected a string")),
            (ColumnKind::Uuid, JsonValue::String(s)) => Uuid::parse_str(s)
                .map(BindValue::Uuid)
                .map_err(|_| invalid("expected a UUID")),
            (ColumnKind::Uuid, _) => Err(invalid("expected a UUID")),
            (ColumnKind::Integer, JsonValue::Number(n)) => n
                .as_i64()
                .map(BindValue::Integer)
                .ok_or_else(|| invalid("expected an integer")),
            (ColumnKind::Integer, JsonValue::String(s)) => s
                .parse::<i64>()
                .map(BindValue::Integer)
                .map_err(|_| invalid("expected an integer")),
            (ColumnKind::Integer, _) => Err(invalid("expected an integer")),
            (ColumnKind::Decimal, JsonValue::Number(n)) => Decimal::from_str(&n.to_string())
                .or_else(|_| Decimal::from_scientific(&n.to_string()))
                .map(BindValue::Decimal)
                .map_err(|_| invalid("expected a decimal number")),
            (ColumnKind::Decimal, JsonValue::String(s)) => Decimal::from_str(s)
                .map(BindValue::Decimal)
                .map_err(|_| invalid("expected a decimal number")),
            (ColumnKind::Decimal, _) => Err(invalid("expected a decimal number")),
            (ColumnKind::Timestamp, JsonValue::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|t| BindValue::Timestamp(t.with_timezone(&Utc)))
                .map_err(|_| invalid("expected an RFC 3339 timestamp")),
            (ColumnKind::Timestamp, _) => Err(invalid("expected an RFC 3339 timestamp")),
        }
    }

    fn push_to(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        match self {
            BindValue::Uuid(v) => builder.push_bind(*v),
            BindValue::Text(v) => builder.push_bind(v.clone()),
            BindValue::Integer(v) => builder.push_bind(*v),
            BindValue::Decimal(v) => builder.push_bind(*v),
            BindValue::Timestamp(v) => builder.push_bind(*v),
            BindValue::Null => builder.push("NULL"),
        };
    }
}

// ==============================================================================
// Where Clause
// ==============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: &'static str,
    pub operator: Operator,
    pub value: BindValue,
}

/// Validated `(column, operator, value)` triples, joined with AND.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhereClause {
    conditions: Vec<Condition>,
    raw_predicates: Vec<&'static str>,
}

impl WhereClause {
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.raw_predicates.is_empty()
    }

    /// Adds a fixed predicate written by this crate, e.g. `deleted_at IS NULL`.
    pub(crate) fn and_static(mut self, predicate: &'static str) -> Self {
        self.raw_predicates.push(predicate);
        self
    }

    /// Appends ` WHERE ...` to `builder`, or nothing when there are no conditions.
    pub fn push_to(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        if self.is_empty() {
            return;
        }
        builder.push(" WHERE ");
        let mut first = true;
        for predicate in &self.raw_predicates {
            if !first {
                builder.push(" AND ");
            }
            first = false;
            builder.push(*predicate);
        }
        for condition in &self.conditions {
            if !first {
                builder.push(" AND ");
            }
            first = false;
            builder.push(condition.column);
            match (&condition.value, condition.operator) {
                (BindValue::Null, _) => {
                    builder.push(" IS NULL");
                }
                (value, op) => {
                    builder.push(" ").push(op.sql()).push(" ");
                    value.push_to(builder);
                }
            }
        }
    }
}

// ==============================================================================
// Ordering
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// A single `(column, direction)` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub column: &'static str,
    pub direction: SortDirection,
}

impl OrderBy {
    /// Newest first, the default for every listing.
    pub const NEWEST_FIRST: OrderBy = OrderBy {
        column: "created_at",
        direction: SortDirection::Desc,
    };

    /// Appends ` ORDER BY ...`, with `id` as tie-breaker so pages never overlap.
    pub fn push_to(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        builder
            .push(" ORDER BY ")
            .push(self.column)
            .push(" ")
            .push(self.direction.sql());
        if self.column != "id" {
            builder.push(", id ").push(self.direction.sql());
        }
    }
}

// ==============================================================================
// Builder
// ==============================================================================

/// Everything a caller may ask of a listing, before validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRequest {
    pub filters: Option<Map<String, JsonValue>>,
    /// `"<field> <direction>"`, e.g. `"createdAt DESC"`.
    pub order_by: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub with_deleted: bool,
}

/// A validated [`QueryRequest`]. Paging fields pass through unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecureQuery {
    pub filter: WhereClause,
    pub order: Option<OrderBy>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub with_deleted: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SecureQueryBuilder {
    filterable: &'static [Column],
}

impl SecureQueryBuilder {
    pub fn new(filterable: &'static [Column]) -> Self {
        Self { filterable }
    }

    fn column(&self, field: &str) -> Result<&'static Column, DbError> {
        self.filterable
            .iter()
            .find(|c| c.field == field)
            .ok_or_else(|| DbError::InvalidFilterField(field.to_string()))
    }

    /// Validates each filter entry and turns it into a condition.
    ///
    /// A scalar means equality; `{"<op>": value}` selects an operator from the allow-list.
    pub fn build_where_clause(&self, filters: &Map<String, JsonValue>) -> Result<WhereClause, DbError> {
        let mut clause = WhereClause::default();

        for (field, value) in filters {
            let column = self.column(field)?;
            let (operator, operand) = match value {
                JsonValue::Object(pair) => {
                    let mut entries = pair.iter();
                    let (tag, operand) = match (entries.next(), entries.next()) {
                        (Some(entry), None) => entry,
                        (None, _) => return Err(DbError::InvalidOperator(String::new())),
                        (Some(_), Some(_)) => {
                            return Err(DbError::InvalidFilterValue {
                                field: field.clone(),
                                reason: "expected exactly one operator".to_string(),
                            });
                        }
                    };
                    (tag.parse::<Operator>()?, operand)
                }
                scalar => (Operator::Eq, scalar),
            };

            let bound = BindValue::coerce(column, operand)?;
            if operator == Operator::Like && !matches!(bound, BindValue::Text(_)) {
                return Err(DbError::InvalidFilterValue {
                    field: field.clone(),
                    reason: "like requires a text pattern".to_string(),
                });
            }
            if operator != Operator::Eq && bound == BindValue::Null {
                return Err(DbError::InvalidFilterValue {
                    field: field.clone(),
                    reason: format!("{} cannot compare against null", operator.tag()),
                });
            }

            clause.conditions.push(Condition {
                column: column.column,
                operator,
                value: bound,
            });
        }

        Ok(clause)
    }

    /// Parses `"<field> <direction>"` against [`ORDER_FIELDS`].
    ///
    /// The direction is case-insensitive, must be ASC or DESC, and defaults to ASC.
    pub fn sanitize_order(&self, spec: &str) -> Result<OrderBy, DbError> {
        let mut tokens = spec.split_whitespace();
        let field = tokens.next().unwrap_or_default();
        let column = ORDER_FIELDS
            .iter()
            .find(|c| c.field == field)
            .ok_or_else(|| DbError::InvalidOrderField(field.to_string()))?;

        let direction = match tokens.next().map(str::to_uppercase).as_deref() {
            None | Some("ASC") => SortDirection::Asc,
            Some("DESC") => SortDirection::Desc,
            Some(other) => return Err(DbError::InvalidOrderDirection(other.to_string())),
        };
        if let Some(extra) = tokens.next() {
            return Err(DbError::InvalidOrderDirection(extra.to_string()));
        }

        Ok(OrderBy {
            column: column.column,
            direction,
        })
    }

    pub fn create_secure_query(&self, request: QueryRequest) -> Result<SecureQuery, DbError> {
        let filter = match &request.filters {
            Some(filters) => self.build_where_clause(filters)?,
            None => WhereClause::default(),
        };
        let order = request
            .order_by
            .as_deref()
            .map(|spec| self.sanitize_order(spec))
            .transpose()?;

        Ok(SecureQuery {
            filter,
            order,
            page: request.page,
            page_size: request.page_size,
            with_deleted: request.with_deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    static COLUMNS: [Column; 4] = [
        Column::new("name", "name", ColumnKind::Text),
        Column::new("price", "price", ColumnKind::Decimal),
        Column::new("stock", "stock", ColumnKind::Integer),
        Column::new("createdAt", "created_at", ColumnKind::Timestamp),
    ];

    fn builder() -> SecureQueryBuilder {
        SecureQueryBuilder::new(&COLUMNS)
    }

    fn filters(value: JsonValue) -> Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("filters must be an object"),
        }
    }

    fn sql_for(clause: &WhereClause) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM products");
        clause.push_to(&mut qb);
        qb.sql().to_string()
    }

    #[test]
    fn every_allowed_operator_produces_a_condition() {
        for (tag, expected_sql) in [("eq", "="), ("gt", ">"), ("lt", "<")] {
            let mut pair = Map::new();
            pair.insert(tag.to_string(), json!(3));
            let mut stock = Map::new();
            stock.insert("stock".to_string(), JsonValue::Object(pair));
            let clause = builder().build_where_clause(&stock).unwrap();
            assert_eq!(clause.conditions()[0].operator.sql(), expected_sql);
            assert_eq!(clause.conditions()[0].value, BindValue::Integer(3));
        }

        let like = builder()
            .build_where_clause(&filters(json!({ "name": { "like": "%lamp%" } })))
            .unwrap();
        assert_eq!(like.conditions()[0].operator, Operator::Like);
    }

    #[test]
    fn operator_tags_parse_back_to_their_operator() {
        for op in Operator::ALL {
            assert_eq!(op.tag().parse::<Operator>().unwrap(), op);
        }
        let sql: Vec<_> = Operator::ALL.iter().map(|op| op.sql()).collect();
        assert_eq!(sql, ["=", ">", "<", "LIKE"]);
        assert!(matches!("EQ".parse::<Operator>(), Err(DbError::InvalidOperator(tag)) if tag == "EQ"));
    }

    #[test]
    fn unknown_operator_is_rejected_by_name() {
        let err = builder()
            .build_where_clause(&filters(json!({ "stock": { "ne": 3 } })))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidOperator(op) if op == "ne"));

        let err = builder()
            .build_where_clause(&filters(json!({ "name": { "$raw": "1=1; DROP TABLE products" } })))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidOperator(op) if op == "$raw"));
    }

    #[test]
    fn scalars_mean_equality_and_are_anded() {
        let clause = builder()
            .build_where_clause(&filters(json!({ "name": "Desk Lamp", "price": { "lt": 20.5 } })))
            .unwrap();
        let sql = sql_for(&clause);
        assert!(sql.contains(" WHERE "));
        assert!(sql.contains("name = $"));
        assert!(sql.contains("price < $"));
        assert!(sql.contains(" AND "));
        assert!(!sql.contains("Desk Lamp"));
    }

    #[test]
    fn null_equality_becomes_is_null() {
        let clause = builder()
            .build_where_clause(&filters(json!({ "name": null })))
            .unwrap();
        assert_eq!(sql_for(&clause), "SELECT * FROM products WHERE name IS NULL");

        let err = builder()
            .build_where_clause(&filters(json!({ "stock": { "gt": null } })))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidFilterValue { .. }));
    }

    #[test]
    fn fields_outside_the_allow_list_are_rejected() {
        let err = builder()
            .build_where_clause(&filters(json!({ "name; DROP TABLE products": "x" })))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidFilterField(_)));
    }

    #[test]
    fn values_are_coerced_to_the_column_type() {
        let clause = builder()
            .build_where_clause(&filters(json!({
                "price": { "gt": "10.25" },
                "createdAt": { "lt": "2024-05-01T00:00:00Z" }
            })))
            .unwrap();
        assert!(clause
            .conditions()
            .iter()
            .any(|c| c.value == BindValue::Decimal(Decimal::new(1025, 2))));
        assert!(clause
            .conditions()
            .iter()
            .any(|c| matches!(c.value, BindValue::Timestamp(_))));

        let err = builder()
            .build_where_clause(&filters(json!({ "stock": "many" })))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidFilterValue { field, .. } if field == "stock"));

        let err = builder()
            .build_where_clause(&filters(json!({ "stock": { "like": "1%" } })))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidFilterValue { .. }));
    }

    #[test]
    fn sanitize_order_rejects_fields_outside_the_allow_list() {
        let err = builder().sanitize_order("price DESC").unwrap_err();
        assert!(matches!(err, DbError::InvalidOrderField(f) if f == "price"));
    }

    #[test]
    fn sanitize_order_uppercases_the_direction() {
        let order = builder().sanitize_order("id asc").unwrap();
        assert_eq!(order, OrderBy { column: "id", direction: SortDirection::Asc });

        let order = builder().sanitize_order("createdAt desc").unwrap();
        assert_eq!(order.column, "created_at");
        assert_eq!(order.direction, SortDirection::Desc);

        assert_eq!(builder().sanitize_order("updatedAt").unwrap().direction, SortDirection::Asc);
    }

    #[test]
    fn sanitize_order_rejects_anything_but_asc_or_desc() {
        let err = builder().sanitize_order("id; DROP TABLE products").unwrap_err();
        assert!(matches!(err, DbError::InvalidOrderField(_)));

        let err = builder().sanitize_order("id ASC; DROP").unwrap_err();
        assert!(matches!(err, DbError::InvalidOrderDirection(d) if d == "ASC;"));

        let err = builder().sanitize_order("id ASC NULLS").unwrap_err();
        assert!(matches!(err, DbError::InvalidOrderDirection(_)));
    }

    #[test]
    fn create_secure_query_passes_paging_through() {
        let query = builder()
            .create_secure_query(QueryRequest {
                filters: Some(filters(json!({ "name": "Desk Lamp" }))),
                order_by: Some("updatedAt DESC".to_string()),
                page: Some(3),
                page_size: Some(7),
                with_deleted: true,
            })
            .unwrap();
        assert_eq!(query.filter.conditions().len(), 1);
        assert_eq!(query.order.map(|o| o.column), Some("updated_at"));
        assert_eq!(query.page, Some(3));
        assert_eq!(query.page_size, Some(7));
        assert!(query.with_deleted);
    }

    #[test]
    fn order_by_breaks_ties_on_id() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM products");
        OrderBy::NEWEST_FIRST.push_to(&mut qb);
        assert_eq!(qb.sql(), "SELECT * FROM products ORDER BY created_at DESC, id DESC");
    }
}
