use crate::error::DbError;
use crate::monitor::Monitor;
use crate::query_builder::{Column, OrderBy, SecureQuery, WhereClause};
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::sync::Arc;

/// A table that can be listed page by page.
pub trait Entity: for<'r> FromRow<'r, PgRow> + Send + Unpin {
    const TABLE: &'static str;
    /// The select list, in the order the row mapping expects.
    const COLUMNS: &'static str;
    /// Fields callers may filter on.
    const FILTERABLE: &'static [Column];
    /// Whether rows carry a `deleted_at` marker that hides them by default.
    const SOFT_DELETE: bool = false;
}

/// A validated page position. Both numbers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Result<Self, DbError> {
        if page == 0 {
            return Err(DbError::InvalidPagination("page must be at least 1".to_string()));
        }
        if page_size == 0 {
            return Err(DbError::InvalidPagination("pageSize must be at least 1".to_string()));
        }
        Ok(Self { page, page_size })
    }

    pub fn offset(&self) -> i64 {
        (i64::from(self.page) - 1) * i64::from(self.page_size)
    }
}

/// Number of pages needed for `total_items`; zero when there is nothing to show.
pub fn total_pages(total_items: u64, page_size: u32) -> u64 {
    total_items.div_ceil(u64::from(page_size.max(1)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
    pub total_items: u64,
}

impl Pagination {
    pub fn new(request: PageRequest, total_items: u64) -> Self {
        Self {
            page: request.page,
            page_size: request.page_size,
            total_pages: total_pages(total_items, request.page_size),
            total_items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub pagination: Pagination,
}

/// Builds the count and fetch statements for one page. Both share the same filter.
fn page_statements<E: Entity>(
    filter: &WhereClause,
    order: OrderBy,
    paging: PageRequest,
) -> (QueryBuilder<'static, Postgres>, QueryBuilder<'static, Postgres>) {
    let mut count = QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", E::TABLE));
    filter.push_to(&mut count);

    let mut fetch = QueryBuilder::new(format!("SELECT {} FROM {}", E::COLUMNS, E::TABLE));
    filter.push_to(&mut fetch);
    order.push_to(&mut fetch);
    fetch
        .push(" LIMIT ")
        .push_bind(i64::from(paging.page_size))
        .push(" OFFSET ")
        .push_bind(paging.offset());

    (count, fetch)
}

/// Paginated listing over any [`Entity`].
#[derive(Debug, Clone)]
pub struct QueryOptimizer {
    pool: PgPool,
    monitor: Arc<Monitor>,
    default_page_size: u32,
    max_page_size: u32,
}

impl QueryOptimizer {
    pub fn new(pool: PgPool, monitor: Arc<Monitor>) -> Self {
        Self {
            pool,
            monitor,
            default_page_size: 20,
            max_page_size: 100,
        }
    }

    pub fn with_page_sizes(mut self, default_page_size: u32, max_page_size: u32) -> Self {
        self.default_page_size = default_page_size;
        self.max_page_size = max_page_size;
        self
    }

    /// Applies defaults (page 1, the configured page size). Larger page sizes are cut down to the cap.
    pub fn page_request(&self, page: Option<u32>, page_size: Option<u32>) -> Result<PageRequest, DbError> {
        let mut request = PageRequest::new(
            page.unwrap_or(1),
            page_size.unwrap_or(self.default_page_size),
        )?;
        if request.page_size > self.max_page_size {
            tracing::debug!(
                requested = request.page_size,
                max_page_size = self.max_page_size,
                "Page size clamped."
            );
            request.page_size = self.max_page_size;
        }
        Ok(request)
    }

    /// Counts the matching rows and fetches one page of them concurrently.
    ///
    /// The two statements run on separate connections without a shared snapshot, so
    /// under concurrent writes the total and the rows may disagree slightly.
    pub async fn find_with_pagination<E: Entity>(&self, query: SecureQuery) -> Result<Page<E>, DbError> {
        let paging = self.page_request(query.page, query.page_size)?;
        let order = query.order.unwrap_or(OrderBy::NEWEST_FIRST);
        let filter = if E::SOFT_DELETE && !query.with_deleted {
            query.filter.and_static("deleted_at IS NULL")
        } else {
            query.filter
        };

        let (mut count, mut fetch) = page_statements::<E>(&filter, order, paging);
        let count_sql = count.sql().to_owned();
        let fetch_sql = fetch.sql().to_owned();

        let (total_items, rows) = tokio::try_join!(
            self.monitor
                .track(&count_sql, count.build_query_scalar::<i64>().fetch_one(&self.pool)),
            self.monitor
                .track(&fetch_sql, fetch.build_query_as::<E>().fetch_all(&self.pool)),
        )?;

        let total_items = u64::try_from(total_items).unwrap_or_default();
        tracing::debug!(
            table = E::TABLE,
            page = paging.page,
            page_size = paging.page_size,
            total_items,
            "Fetched page."
        );

        Ok(Page {
            rows,
            pagination: Pagination::new(paging, total_items),
        })
    }
}
