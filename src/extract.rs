//! Paginated extraction from document stores and relational sources.
//!
//! Extractors are lazy: each call to `next_batch` issues exactly one page query, and pages are
//! always fetched one after the other.

use crate::error::{Error, Result};
use crate::schema::IntrospectedColumn;
use crate::sql::quote_ident;
use serde_json::{Map, Value as JsonValue, json};
use tracing::{debug, info, instrument, warn};

/// Default memory budget for one document-store page (20 MiB).
pub const DEFAULT_PAGE_BYTE_BUDGET: u64 = 20 * 1024 * 1024;

/// Default row count of one relational page.
pub const DEFAULT_RELATIONAL_BATCH_SIZE: u64 = 10_000;

/// Column used for cursor paging in document stores.
pub const DOCUMENT_ID_COLUMN: &str = "_id";

/// Collection statistics reported by a document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectionStats {
    /// Number of documents
    pub count: u64,
    /// Average document size in bytes
    pub avg_object_size: u64,
}

/// How a source is split into pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePlan {
    /// Records requested per page
    pub page_size: u64,
    /// Number of page queries
    pub total_pages: u64,
}

impl PagePlan {
    /// Offset of the first record of a page.
    pub fn offset(&self, page: u64) -> u64 {
        page * self.page_size
    }
}

/// Plan size-bounded pages for a collection.
///
/// An average object size of zero puts the whole collection in one page.
pub fn plan_size_pages(stats: CollectionStats, byte_budget: u64) -> PagePlan {
    if stats.count == 0 {
        return PagePlan {
            page_size: 0,
            total_pages: 0,
        };
    }
    let page_size = match stats.avg_object_size {
        0 => stats.count,
        avg => (byte_budget / avg).max(1),
    };
    PagePlan {
        page_size,
        total_pages: stats.count.div_ceil(page_size),
    }
}

/// Plan fixed-size offset pages.
pub fn plan_offset_pages(total: u64, batch_size: u64) -> Result<PagePlan> {
    if batch_size == 0 {
        return Err(Error::config("Relational batch size must be greater than 0"));
    }
    Ok(PagePlan {
        page_size: batch_size,
        total_pages: total.div_ceil(batch_size),
    })
}

/// Offset page query for a relational source.
pub fn offset_page_sql(table: &str, order_by: Option<&str>, offset: u64, limit: u64) -> String {
    let order = order_by
        .map(|col| format!(" ORDER BY {}", quote_ident(col)))
        .unwrap_or_default();
    format!(
        "SELECT * FROM {}{} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
        table, order, offset, limit
    )
}

/// A table of a relational source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTable {
    /// Namespace (schema) of the table
    pub namespace: String,
    /// Table name
    pub name: String,
}

impl SourceTable {
    /// Create a table reference.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Quoted, qualified name.
    pub fn qualified(&self) -> String {
        crate::sql::qualified(&self.namespace, &self.name)
    }
}

impl std::fmt::Display for SourceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// One document-store query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindQuery {
    /// Filter document
    pub filter: Map<String, JsonValue>,
    /// Projection document, `None` returns every field
    pub projection: Option<Map<String, JsonValue>>,
    /// Field sorted ascending
    pub sort: Option<String>,
    /// Maximum number of documents
    pub limit: Option<u64>,
    /// Number of documents to skip
    pub skip: Option<u64>,
}

/// Build the projection of a document-store job.
///
/// Declared schema columns win: only they are fetched, minus ignored fields. Without a schema the
/// ignored fields are excluded. Mixing both kinds in one projection is rejected by document
/// stores, so only one kind is ever produced.
pub fn build_projection(
    schema_columns: &[String],
    ignore_fields: &[String],
) -> Option<Map<String, JsonValue>> {
    if !schema_columns.is_empty() {
        let map: Map<String, JsonValue> = schema_columns
            .iter()
            .filter(|c| !ignore_fields.contains(c))
            .map(|c| (c.clone(), json!(1)))
            .collect();
        return Some(map);
    }
    if ignore_fields.is_empty() {
        return None;
    }
    Some(
        ignore_fields
            .iter()
            .map(|c| (c.clone(), json!(0)))
            .collect(),
    )
}

/// Filter `column` to the half-open window `[start, end)`.
pub fn time_window_filter(
    column: &str,
    start: Option<i64>,
    end: Option<i64>,
) -> Map<String, JsonValue> {
    let mut range = Map::new();
    if let Some(start) = start {
        range.insert("$gte".to_string(), json!(start));
    }
    if let Some(end) = end {
        range.insert("$lt".to_string(), json!(end));
    }
    let mut filter = Map::new();
    if !range.is_empty() {
        filter.insert(column.to_string(), JsonValue::Object(range));
    }
    filter
}

/// A document store the extractor can page through.
#[allow(async_fn_in_trait)]
pub trait DocumentStore {
    /// Document count and average document size of a collection.
    async fn collection_stats(&self, collection: &str) -> Result<CollectionStats>;

    /// Run one query.
    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<JsonValue>>;
}

/// A relational database the extractor can page through.
#[allow(async_fn_in_trait)]
pub trait RelationalSource {
    /// Total number of rows of a table.
    async fn count_records(&self, table: &SourceTable) -> Result<u64>;

    /// Run a query, one JSON object per row.
    async fn fetch_records(&self, query: &str) -> Result<Vec<JsonValue>>;

    /// Column names and declared types of a table.
    async fn source_columns(&self, table: &SourceTable) -> Result<Vec<IntrospectedColumn>>;

    /// Query of one offset page, in the source's SQL dialect.
    fn page_sql(
        &self,
        table: &SourceTable,
        order_by: Option<&str>,
        offset: u64,
        limit: u64,
    ) -> String {
        offset_page_sql(&table.qualified(), order_by, offset, limit)
    }
}

/// One extracted page.
#[derive(Debug, Clone)]
pub struct Page {
    /// Zero-based page index
    pub index: u64,
    /// Planned number of pages
    pub total: u64,
    /// Raw records
    pub records: Vec<JsonValue>,
}

/// Options of a document-store extraction.
#[derive(Debug, Clone)]
pub struct DocumentExtractOptions {
    /// Collection name
    pub collection: String,
    /// Column driving incremental loads; `_id` enables cursor paging
    pub max_column: Option<String>,
    /// Projection applied to every query
    pub projection: Option<Map<String, JsonValue>>,
    /// Filter of the unpaged query
    pub filter: Map<String, JsonValue>,
    /// Memory budget per page
    pub byte_budget: u64,
}

impl DocumentExtractOptions {
    /// Options for a collection with default settings.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            max_column: None,
            projection: None,
            filter: Map::new(),
            byte_budget: DEFAULT_PAGE_BYTE_BUDGET,
        }
    }

    fn paged(&self) -> bool {
        self.max_column.as_deref() == Some(DOCUMENT_ID_COLUMN)
    }
}

/// Lazy page sequence over a document-store collection.
pub struct DocumentExtractor<'a, S: DocumentStore> {
    store: &'a S,
    options: DocumentExtractOptions,
    plan: PagePlan,
    next_page: u64,
}

impl<'a, S: DocumentStore> DocumentExtractor<'a, S> {
    /// Read collection statistics and plan the pages.
    #[instrument(skip(store, options), fields(collection = %options.collection))]
    pub async fn prepare(store: &'a S, options: DocumentExtractOptions) -> Result<Self> {
        let stats = store.collection_stats(&options.collection).await?;
        info!("Total records: {}", stats.count);

        let plan = if options.paged() {
            plan_size_pages(stats, options.byte_budget)
        } else {
            PagePlan {
                page_size: 0,
                total_pages: 1,
            }
        };
        debug!(
            "Planned {} pages of {} records",
            plan.total_pages, plan.page_size
        );

        Ok(Self {
            store,
            options,
            plan,
            next_page: 0,
        })
    }

    /// The page plan.
    pub fn plan(&self) -> PagePlan {
        self.plan
    }

    /// Query of page `index`.
    pub fn page_query(&self, index: u64) -> FindQuery {
        if self.options.paged() {
            FindQuery {
                filter: Map::new(),
                projection: self.options.projection.clone(),
                sort: Some(DOCUMENT_ID_COLUMN.to_string()),
                limit: Some(self.plan.page_size),
                skip: Some(self.plan.offset(index)),
            }
        } else {
            FindQuery {
                filter: self.options.filter.clone(),
                projection: self.options.projection.clone(),
                ..FindQuery::default()
            }
        }
    }

    /// Fetch the next non-empty page.
    pub async fn next_batch(&mut self) -> Result<Option<Page>> {
        while self.next_page < self.plan.total_pages {
            let index = self.next_page;
            self.next_page += 1;

            info!(
                "[{}/{}] Processing batch {}",
                index + 1,
                self.plan.total_pages,
                index + 1
            );
            let query = self.page_query(index);
            let records = self.store.find(&self.options.collection, &query).await?;
            info!("Received {} records", records.len());

            if records.is_empty() {
                continue;
            }
            return Ok(Some(Page {
                index,
                total: self.plan.total_pages,
                records,
            }));
        }
        Ok(None)
    }

    /// Start again from the first page.
    pub fn restart(&mut self) {
        self.next_page = 0;
    }
}

/// Lazy page sequence over a relational table.
pub struct RelationalExtractor<'a, R: RelationalSource> {
    source: &'a R,
    table: SourceTable,
    order_by: Option<String>,
    plan: PagePlan,
    next_page: u64,
}

impl<'a, R: RelationalSource> RelationalExtractor<'a, R> {
    /// Count the table rows and plan the pages.
    #[instrument(skip(source), fields(table = %table))]
    pub async fn prepare(
        source: &'a R,
        table: &SourceTable,
        order_by: Option<&str>,
        batch_size: u64,
    ) -> Result<Self> {
        let total = source.count_records(table).await?;
        let plan = plan_offset_pages(total, batch_size)?;
        info!("Total records: {}", total);
        info!("Total queries to run: {}", plan.total_pages);
        if order_by.is_none() && plan.total_pages > 1 {
            warn!(
                "No ordering column configured for {}; offset pages may overlap or miss rows",
                table
            );
        }

        Ok(Self {
            source,
            table: table.clone(),
            order_by: order_by.map(str::to_string),
            plan,
            next_page: 0,
        })
    }

    /// The page plan.
    pub fn plan(&self) -> PagePlan {
        self.plan
    }

    /// SQL of page `index`.
    pub fn page_sql(&self, index: u64) -> String {
        self.source.page_sql(
            &self.table,
            self.order_by.as_deref(),
            self.plan.offset(index),
            self.plan.page_size,
        )
    }

    /// Fetch the next non-empty page.
    pub async fn next_batch(&mut self) -> Result<Option<Page>> {
        while self.next_page < self.plan.total_pages {
            let index = self.next_page;
            self.next_page += 1;

            let records = self.source.fetch_records(&self.page_sql(index)).await?;
            if records.is_empty() {
                debug!("Page {} is empty", index + 1);
                continue;
            }
            info!("Received {} records", records.len());
            return Ok(Some(Page {
                index,
                total: self.plan.total_pages,
                records,
            }));
        }
        Ok(None)
    }

    /// Start again from the first page.
    pub fn restart(&mut self) {
        self.next_page = 0;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::RefCell;

    /// In-memory collection sorted by `_id`.
    pub(crate) struct MemoryStore {
        pub docs: Vec<JsonValue>,
        pub avg_object_size: u64,
        pub queries: RefCell<Vec<FindQuery>>,
    }

    impl MemoryStore {
        pub fn with_ids(n: u64, avg_object_size: u64) -> Self {
            Self {
                docs: (0..n).map(|i| json!({"_id": i, "v": i * 2})).collect(),
                avg_object_size,
                queries: RefCell::new(Vec::new()),
            }
        }
    }

    impl DocumentStore for MemoryStore {
        async fn collection_stats(&self, _collection: &str) -> Result<CollectionStats> {
            Ok(CollectionStats {
                count: self.docs.len() as u64,
                avg_object_size: self.avg_object_size,
            })
        }

        async fn find(&self, _collection: &str, query: &FindQuery) -> Result<Vec<JsonValue>> {
            self.queries.borrow_mut().push(query.clone());
            let skip = query.skip.unwrap_or(0) as usize;
            let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
            Ok(self.docs.iter().skip(skip).take(limit).cloned().collect())
        }
    }

    /// In-memory table answering offset page queries.
    pub(crate) struct MemoryTable {
        pub rows: Vec<JsonValue>,
        pub queries: RefCell<Vec<String>>,
    }

    impl MemoryTable {
        pub fn with_ids(n: u64) -> Self {
            Self {
                rows: (0..n).map(|i| json!({"id": i.to_string()})).collect(),
                queries: RefCell::new(Vec::new()),
            }
        }
    }

    fn number_after(sql: &str, keyword: &str) -> usize {
        let words: Vec<&str> = sql.split_whitespace().collect();
        words
            .iter()
            .position(|w| *w == keyword)
            .and_then(|i| words.get(i + 1))
            .and_then(|w| w.parse().ok())
            .unwrap_or(0)
    }

    impl RelationalSource for MemoryTable {
        async fn count_records(&self, _table: &SourceTable) -> Result<u64> {
            Ok(self.rows.len() as u64)
        }

        async fn fetch_records(&self, query: &str) -> Result<Vec<JsonValue>> {
            self.queries.borrow_mut().push(query.to_string());
            let offset = number_after(query, "OFFSET");
            let limit = number_after(query, "NEXT");
            Ok(self.rows.iter().skip(offset).take(limit).cloned().collect())
        }

        async fn source_columns(&self, _table: &SourceTable) -> Result<Vec<IntrospectedColumn>> {
            Ok(vec![IntrospectedColumn::new("id", "bigint")])
        }
    }

    #[test]
    fn test_plan_size_pages() {
        let stats = CollectionStats {
            count: 1000,
            avg_object_size: 1024,
        };
        let plan = plan_size_pages(stats, 100 * 1024);
        assert_eq!(plan.page_size, 100);
        assert_eq!(plan.total_pages, 10);

        let plan = plan_size_pages(
            CollectionStats {
                count: 5,
                avg_object_size: 0,
            },
            DEFAULT_PAGE_BYTE_BUDGET,
        );
        assert_eq!(plan.total_pages, 1);
        assert_eq!(plan.page_size, 5);

        // Objects bigger than the budget still make progress
        let plan = plan_size_pages(
            CollectionStats {
                count: 3,
                avg_object_size: 10,
            },
            1,
        );
        assert_eq!(plan.page_size, 1);
        assert_eq!(plan.total_pages, 3);
    }

    #[test]
    fn test_empty_collection_has_no_pages() {
        let plan = plan_size_pages(CollectionStats::default(), DEFAULT_PAGE_BYTE_BUDGET);
        assert_eq!(plan.total_pages, 0);
    }

    #[test]
    fn test_plan_offset_pages() {
        let plan = plan_offset_pages(25_001, DEFAULT_RELATIONAL_BATCH_SIZE).unwrap();
        assert_eq!(plan.total_pages, 3);
        assert_eq!(plan.offset(2), 20_000);
        assert!(plan_offset_pages(10, 0).is_err());
        assert_eq!(plan_offset_pages(0, 10).unwrap().total_pages, 0);
    }

    #[test]
    fn test_offset_page_sql() {
        assert_eq!(
            offset_page_sql("\"public\".\"orders\"", Some("updated_at"), 20, 10),
            "SELECT * FROM \"public\".\"orders\" ORDER BY \"updated_at\" OFFSET 20 ROWS FETCH NEXT 10 ROWS ONLY"
        );
        assert_eq!(
            offset_page_sql("orders", None, 0, 10),
            "SELECT * FROM orders OFFSET 0 ROWS FETCH NEXT 10 ROWS ONLY"
        );
    }

    #[test]
    fn test_build_projection() {
        let cols = vec!["a".to_string(), "b".to_string(), "secret".to_string()];
        let ignore = vec!["secret".to_string()];
        let projection = build_projection(&cols, &ignore).unwrap();
        assert_eq!(JsonValue::Object(projection), json!({"a": 1, "b": 1}));

        let projection = build_projection(&[], &ignore).unwrap();
        assert_eq!(JsonValue::Object(projection), json!({"secret": 0}));

        assert!(build_projection(&[], &[]).is_none());
    }

    #[test]
    fn test_time_window_filter() {
        let filter = time_window_filter("updated_at", Some(10), Some(20));
        assert_eq!(
            JsonValue::Object(filter),
            json!({"updated_at": {"$gte": 10, "$lt": 20}})
        );
        assert!(time_window_filter("updated_at", None, None).is_empty());
    }

    #[tokio::test]
    async fn test_document_extractor_pages_by_id() {
        let store = MemoryStore::with_ids(25, 100);
        let mut options = DocumentExtractOptions::new("orders");
        options.max_column = Some("_id".to_string());
        options.byte_budget = 1000;

        let mut extractor = DocumentExtractor::prepare(&store, options).await.unwrap();
        assert_eq!(extractor.plan().total_pages, 3);

        let mut sizes = Vec::new();
        while let Some(page) = extractor.next_batch().await.unwrap() {
            sizes.push(page.records.len());
        }
        assert_eq!(sizes, vec![10, 10, 5]);

        let queries = store.queries.borrow();
        assert_eq!(queries[2].skip, Some(20));
        assert_eq!(queries[2].sort.as_deref(), Some("_id"));
    }

    #[tokio::test]
    async fn test_document_extractor_unpaged_uses_filter() {
        let store = MemoryStore::with_ids(7, 100);
        let mut options = DocumentExtractOptions::new("orders");
        options.max_column = Some("updated_at".to_string());
        options.filter = time_window_filter("updated_at", Some(1), None);

        let mut extractor = DocumentExtractor::prepare(&store, options).await.unwrap();
        let page = extractor.next_batch().await.unwrap().unwrap();
        assert_eq!(page.records.len(), 7);
        assert!(extractor.next_batch().await.unwrap().is_none());

        let queries = store.queries.borrow();
        assert_eq!(queries.len(), 1);
        assert!(queries[0].limit.is_none());
        assert!(queries[0].filter.contains_key("updated_at"));
    }

    #[tokio::test]
    async fn test_empty_pages_are_skipped() {
        let store = MemoryStore::with_ids(0, 100);
        let mut options = DocumentExtractOptions::new("orders");
        options.max_column = Some("updated_at".to_string());
        let mut extractor = DocumentExtractor::prepare(&store, options).await.unwrap();
        assert!(extractor.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_relational_extractor_restart() {
        let table = MemoryTable::with_ids(5);
        let source = SourceTable::new("public", "t");
        let mut extractor = RelationalExtractor::prepare(&table, &source, Some("id"), 2)
            .await
            .unwrap();
        let mut first = 0;
        while let Some(page) = extractor.next_batch().await.unwrap() {
            first += page.records.len();
        }
        extractor.restart();
        let page = extractor.next_batch().await.unwrap().unwrap();
        assert_eq!(first, 5);
        assert_eq!(page.index, 0);
        assert_eq!(table.queries.borrow().len(), 4);
    }

    proptest! {
        #[test]
        fn prop_document_pages_cover_all_keys(n in 0u64..300, avg in 1u64..50, budget in 1u64..500) {
            let store = MemoryStore::with_ids(n, avg);
            let mut options = DocumentExtractOptions::new("c");
            options.max_column = Some("_id".to_string());
            options.byte_budget = budget;

            let (pages, ids) = tokio_test::block_on(async {
                let mut extractor = DocumentExtractor::prepare(&store, options).await.unwrap();
                let mut pages = 0u64;
                let mut ids = Vec::new();
                while let Some(page) = extractor.next_batch().await.unwrap() {
                    pages += 1;
                    ids.extend(page.records.iter().map(|r| r["_id"].as_u64().unwrap()));
                }
                (pages, ids)
            });

            let per_page = (budget / avg).max(1);
            prop_assert_eq!(pages, n.div_ceil(per_page));
            prop_assert_eq!(ids, (0..n).collect::<Vec<_>>());
        }

        #[test]
        fn prop_relational_pages_cover_all_rows(n in 0u64..300, batch in 1u64..40) {
            let table = MemoryTable::with_ids(n);
            let (pages, ids) = tokio_test::block_on(async {
                let source = SourceTable::new("public", "t");
                let mut extractor = RelationalExtractor::prepare(&table, &source, Some("id"), batch)
                    .await
                    .unwrap();
                let mut pages = 0u64;
                let mut ids = Vec::new();
                while let Some(page) = extractor.next_batch().await.unwrap() {
                    pages += 1;
                    ids.extend(page.records.iter().map(|r| r["id"].as_str().unwrap().to_string()));
                }
                (pages, ids)
            });

            prop_assert_eq!(pages, n.div_ceil(batch));
            prop_assert_eq!(ids, (0..n).map(|i| i.to_string()).collect::<Vec<_>>());
        }
    }
}
