//! Warehouse sync engine.
//!
//! A batch goes through `check table -> create table (if absent) -> truncate (replace only) ->
//! load -> commit`. The load runs in one transaction; the truncate of a replace is committed on
//! its own before it, so a failed load leaves the destination empty.

use crate::config::{WarehouseBackend, WarehouseConfig};
use crate::error::{Error, Result};
use crate::motherduck::MotherDuckClient;
use crate::normalize::NormalizedRecord;
use crate::postgres::PostgresClient;
use crate::schema::TableSchema;
use crate::sql::{self, Dialect, Statement};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, instrument};

/// How a batch is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadType {
    /// Upsert on the primary key
    Merge,
    /// Empty the table, then insert
    Replace,
}

impl FromStr for LoadType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(LoadType::Merge),
            "replace" => Ok(LoadType::Replace),
            _ => Err(Error::UnsupportedLoadType(s.to_string())),
        }
    }
}

impl fmt::Display for LoadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadType::Merge => write!(f, "merge"),
            LoadType::Replace => write!(f, "replace"),
        }
    }
}

/// Operations the sync engine and transformations need from a warehouse.
#[allow(async_fn_in_trait)]
pub trait Warehouse {
    /// SQL dialect.
    fn dialect(&self) -> Dialect;

    /// Namespace holding the destination tables.
    fn namespace(&self) -> &str;

    /// Whether `table` exists in the namespace.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Column names of `table`, in order.
    async fn table_columns(&self, table: &str) -> Result<Vec<String>>;

    /// Run statements without parameters outside any explicit transaction.
    async fn execute_batch(&self, sql: &str) -> Result<()>;

    /// Run statements in one transaction; rolls back and fails on the first error.
    ///
    /// Returns the number of affected rows.
    async fn execute_in_transaction(&self, statements: &[Statement]) -> Result<u64>;
}

/// Warehouse selected at runtime.
pub enum WarehouseClient {
    /// PostgreSQL
    Postgres(PostgresClient),
    /// DuckDB / MotherDuck
    MotherDuck(MotherDuckClient),
}

impl WarehouseClient {
    /// Connect to the configured backend.
    pub async fn connect(config: &WarehouseConfig) -> Result<Self> {
        match config.backend {
            WarehouseBackend::Postgres => {
                let pg = config
                    .postgres
                    .clone()
                    .ok_or_else(|| Error::config("warehouse.postgres is not configured"))?;
                let schema = pg.schema.clone();
                let client = PostgresClient::connect(&pg.url, pg.connect_timeout_secs).await?;
                Ok(WarehouseClient::Postgres(client.with_namespace(schema)))
            }
            WarehouseBackend::MotherDuck => {
                let md = config
                    .motherduck
                    .clone()
                    .ok_or_else(|| Error::config("warehouse.motherduck is not configured"))?;
                Ok(WarehouseClient::MotherDuck(MotherDuckClient::connect(md)?))
            }
        }
    }
}

impl Warehouse for WarehouseClient {
    fn dialect(&self) -> Dialect {
        match self {
            WarehouseClient::Postgres(c) => c.dialect(),
            WarehouseClient::MotherDuck(c) => c.dialect(),
        }
    }

    fn namespace(&self) -> &str {
        match self {
            WarehouseClient::Postgres(c) => c.namespace(),
            WarehouseClient::MotherDuck(c) => c.namespace(),
        }
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        match self {
            WarehouseClient::Postgres(c) => c.table_exists(table).await,
            WarehouseClient::MotherDuck(c) => c.table_exists(table).await,
        }
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        match self {
            WarehouseClient::Postgres(c) => c.table_columns(table).await,
            WarehouseClient::MotherDuck(c) => c.table_columns(table).await,
        }
    }

    async fn execute_batch(&self, sql: &str) -> Result<()> {
        match self {
            WarehouseClient::Postgres(c) => c.execute_batch(sql).await,
            WarehouseClient::MotherDuck(c) => c.execute_batch(sql).await,
        }
    }

    async fn execute_in_transaction(&self, statements: &[Statement]) -> Result<u64> {
        match self {
            WarehouseClient::Postgres(c) => c.execute_in_transaction(statements).await,
            WarehouseClient::MotherDuck(c) => c.execute_in_transaction(statements).await,
        }
    }
}

/// Loads normalized batches into a warehouse.
pub struct SyncEngine<'a, W: Warehouse> {
    warehouse: &'a W,
}

impl<'a, W: Warehouse> SyncEngine<'a, W> {
    /// Create an engine on a warehouse connection.
    pub fn new(warehouse: &'a W) -> Self {
        Self { warehouse }
    }

    /// Create the namespace and table when the table does not exist.
    ///
    /// Returns whether the table was created.
    #[instrument(skip(self, schema))]
    pub async fn ensure_table(&self, table: &str, schema: &TableSchema) -> Result<bool> {
        if self.warehouse.table_exists(table).await? {
            info!("Table {} exists!", table);
            return Ok(false);
        }

        let namespace = self.warehouse.namespace();
        let ddl = sql::create_table_sql(self.warehouse.dialect(), namespace, table, schema)?;
        debug!("Creating table with DDL: {}", ddl);
        self.warehouse
            .execute_batch(&sql::create_schema_sql(namespace))
            .await?;
        self.warehouse.execute_batch(&ddl).await?;
        info!("Created table {}.{}", namespace, table);
        Ok(true)
    }

    /// Empty a table; committed immediately.
    #[instrument(skip(self))]
    pub async fn truncate(&self, table: &str) -> Result<()> {
        let stmt = sql::truncate_sql(self.warehouse.dialect(), self.warehouse.namespace(), table);
        self.warehouse.execute_batch(&stmt).await?;
        info!("Truncated table {}", table);
        Ok(())
    }

    /// Upsert a batch on the schema's primary key.
    #[instrument(skip(self, schema, batch), fields(count = batch.len()))]
    pub async fn merge(
        &self,
        table: &str,
        schema: &TableSchema,
        batch: &[NormalizedRecord],
    ) -> Result<u64> {
        let statements = sql::upsert_statements(
            self.warehouse.dialect(),
            self.warehouse.namespace(),
            table,
            schema,
            batch,
        )?;
        self.load(table, &statements).await
    }

    /// Insert a batch without touching existing rows.
    #[instrument(skip(self, schema, batch), fields(count = batch.len()))]
    pub async fn insert(
        &self,
        table: &str,
        schema: &TableSchema,
        batch: &[NormalizedRecord],
    ) -> Result<u64> {
        let statements = sql::insert_statements(
            self.warehouse.dialect(),
            self.warehouse.namespace(),
            table,
            schema,
            batch,
        );
        self.load(table, &statements).await
    }

    /// Truncate, then insert a batch.
    pub async fn replace(
        &self,
        table: &str,
        schema: &TableSchema,
        batch: &[NormalizedRecord],
    ) -> Result<u64> {
        self.truncate(table).await?;
        self.insert(table, schema, batch).await
    }

    /// Ensure the table exists, then load a batch with the given load type.
    #[instrument(skip(self, schema, batch), fields(load_type = %load_type, count = batch.len()))]
    pub async fn sync_data(
        &self,
        load_type: LoadType,
        table: &str,
        schema: &TableSchema,
        batch: &[NormalizedRecord],
    ) -> Result<u64> {
        if load_type == LoadType::Merge && schema.primary_key().is_empty() {
            return Err(Error::schema(format!(
                "Merge into {} requires primary key columns",
                table
            )));
        }
        self.ensure_table(table, schema).await?;
        match load_type {
            LoadType::Merge => self.merge(table, schema, batch).await,
            LoadType::Replace => self.replace(table, schema, batch).await,
        }
    }

    async fn load(&self, table: &str, statements: &[Statement]) -> Result<u64> {
        if statements.is_empty() {
            return Ok(0);
        }
        let affected = self.warehouse.execute_in_transaction(statements).await?;
        info!(
            "Loaded {} rows into {} in {} statements",
            affected,
            table,
            statements.len()
        );
        Ok(affected)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::normalize::Normalizer;
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::HashSet;

    /// Warehouse that records statements instead of running them.
    #[derive(Default)]
    pub(crate) struct RecordingWarehouse {
        pub tables: RefCell<HashSet<String>>,
        pub columns: Vec<String>,
        pub batches: RefCell<Vec<String>>,
        pub transactions: RefCell<Vec<Vec<Statement>>>,
        pub fail_transactions: bool,
    }

    impl Warehouse for RecordingWarehouse {
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }

        fn namespace(&self) -> &str {
            "dwh"
        }

        async fn table_exists(&self, table: &str) -> Result<bool> {
            Ok(self.tables.borrow().contains(table))
        }

        async fn table_columns(&self, _table: &str) -> Result<Vec<String>> {
            Ok(self.columns.clone())
        }

        async fn execute_batch(&self, sql: &str) -> Result<()> {
            self.batches.borrow_mut().push(sql.to_string());
            Ok(())
        }

        async fn execute_in_transaction(&self, statements: &[Statement]) -> Result<u64> {
            if self.fail_transactions {
                return Err(Error::schema("boom"));
            }
            self.transactions.borrow_mut().push(statements.to_vec());
            Ok(statements.iter().map(|s| s.params.len() as u64).sum())
        }
    }

    fn schema() -> TableSchema {
        TableSchema::from_json(
            r#"[{"name":"id","type":"INTEGER","mode":"REQUIRED","is_primary_key":true},
                {"name":"v","type":"STRING","mode":"NULLABLE"}]"#,
        )
        .unwrap()
    }

    fn batch() -> Vec<NormalizedRecord> {
        Normalizer::new(&schema())
            .normalize_data(&[json!({"id": 1, "v": "a"}), json!({"id": 2})])
            .unwrap()
            .records
    }

    #[test]
    fn test_load_type_parse() {
        assert_eq!("merge".parse::<LoadType>().unwrap(), LoadType::Merge);
        assert_eq!(" Replace ".parse::<LoadType>().unwrap(), LoadType::Replace);
        let err = "append".parse::<LoadType>().unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_LOAD_TYPE");
        assert_eq!(LoadType::Replace.to_string(), "replace");
    }

    #[tokio::test]
    async fn test_merge_creates_table_once() {
        let wh = RecordingWarehouse::default();
        let engine = SyncEngine::new(&wh);

        engine
            .sync_data(LoadType::Merge, "orders", &schema(), &batch())
            .await
            .unwrap();
        let batches = wh.batches.borrow().clone();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], "CREATE SCHEMA IF NOT EXISTS \"dwh\"");
        assert!(batches[1].starts_with("CREATE TABLE IF NOT EXISTS \"dwh\".\"orders\""));

        wh.tables.borrow_mut().insert("orders".into());
        engine
            .sync_data(LoadType::Merge, "orders", &schema(), &batch())
            .await
            .unwrap();
        assert_eq!(wh.batches.borrow().len(), 2);
        assert_eq!(wh.transactions.borrow().len(), 2);
    }

    #[tokio::test]
    async fn test_replace_truncates_before_insert() {
        let wh = RecordingWarehouse::default();
        wh.tables.borrow_mut().insert("orders".into());
        let engine = SyncEngine::new(&wh);

        let affected = engine
            .sync_data(LoadType::Replace, "orders", &schema(), &batch())
            .await
            .unwrap();
        assert_eq!(affected, 4);
        assert_eq!(
            wh.batches.borrow().as_slice(),
            &["TRUNCATE TABLE \"dwh\".\"orders\"".to_string()]
        );
        let tx = wh.transactions.borrow();
        assert!(tx[0][0].sql.starts_with("INSERT INTO \"dwh\".\"orders\""));
        assert!(!tx[0][0].sql.contains("ON CONFLICT"));
    }

    #[tokio::test]
    async fn test_merge_without_primary_key_is_rejected_before_ddl() {
        let wh = RecordingWarehouse::default();
        let schema =
            TableSchema::from_json(r#"[{"name":"v","type":"STRING","mode":"NULLABLE"}]"#).unwrap();
        let err = SyncEngine::new(&wh)
            .sync_data(LoadType::Merge, "t", &schema, &[])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SCHEMA_ERROR");
        assert!(wh.batches.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_load_failure_propagates() {
        let wh = RecordingWarehouse {
            fail_transactions: true,
            ..Default::default()
        };
        wh.tables.borrow_mut().insert("orders".into());
        let result = SyncEngine::new(&wh)
            .sync_data(LoadType::Merge, "orders", &schema(), &batch())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let wh = RecordingWarehouse::default();
        wh.tables.borrow_mut().insert("orders".into());
        let affected = SyncEngine::new(&wh)
            .merge("orders", &schema(), &[])
            .await
            .unwrap();
        assert_eq!(affected, 0);
        assert!(wh.transactions.borrow().is_empty());
    }
}
