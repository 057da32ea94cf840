//! DuckDB / MotherDuck warehouse client.

use crate::config::MotherDuckConfig;
use crate::error::{Error, Result};
use crate::sql::{self, Dialect, Statement, qualified};
use crate::sync::Warehouse;
use duckdb::{Connection, params, params_from_iter};
use tracing::{debug, info, instrument};

/// Environment variable consulted when no token is configured.
pub const MOTHERDUCK_TOKEN_ENV: &str = "MOTHERDUCK_TOKEN";

/// MotherDuck client wrapper.
pub struct MotherDuckClient {
    conn: Connection,
    config: MotherDuckConfig,
}

impl MotherDuckClient {
    /// Open the configured database: `:memory:`, a local file, or `md:<database>`.
    #[instrument(skip(config), fields(path = %config.path))]
    pub fn connect(config: MotherDuckConfig) -> Result<Self> {
        let conn = if config.path == ":memory:" {
            Connection::open_in_memory()
                .map_err(|e| Error::motherduck_connection("Failed to open in-memory database", e))?
        } else if let Some(database) = config.path.strip_prefix("md:") {
            Self::open_motherduck(&config, database)?
        } else {
            Connection::open(&config.path)
                .map_err(|e| Error::motherduck_connection("Failed to open database file", e))?
        };

        info!("Connected to DuckDB database: {}", config.path);
        Ok(Self { conn, config })
    }

    fn open_motherduck(config: &MotherDuckConfig, database: &str) -> Result<Connection> {
        info!("Connecting to MotherDuck...");
        let token = config
            .token
            .clone()
            .or_else(|| std::env::var(MOTHERDUCK_TOKEN_ENV).ok())
            .ok_or_else(|| {
                Error::config(format!(
                    "MotherDuck token missing; set warehouse.motherduck.token or {}",
                    MOTHERDUCK_TOKEN_ENV
                ))
            })?;

        if config.create_database && !database.is_empty() {
            let init_conn = Connection::open(format!("md:?motherduck_token={}", token))
                .map_err(|e| Error::motherduck_connection("Failed to connect to MotherDuck", e))?;
            init_conn
                .execute(
                    &format!("CREATE DATABASE IF NOT EXISTS {}", sql::quote_ident(database)),
                    [],
                )
                .map_err(|e| Error::motherduck_query("", "Failed to create database", e))?;
            info!("Ensured database exists: {}", database);
        }

        Connection::open(format!("md:{}?motherduck_token={}", database, token))
            .map_err(|e| Error::motherduck_connection("Failed to connect to database", e))
    }

    /// Get row count for a table of the namespace.
    pub fn count_rows(&self, table: &str) -> Result<i64> {
        let query = format!(
            "SELECT COUNT(*) FROM {}",
            qualified(&self.config.schema, table)
        );
        let mut stmt = self
            .conn
            .prepare(&query)
            .map_err(|e| Error::motherduck_query(table, "Prepare count failed", e))?;

        stmt.query_row([], |row| row.get(0))
            .map_err(|e| Error::motherduck_query(table, "Count failed", e))
    }

    /// Get a reference to the underlying connection for advanced queries.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn rollback(&self) {
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            tracing::error!("Rollback failed: {}", e);
        }
    }
}

impl Warehouse for MotherDuckClient {
    fn dialect(&self) -> Dialect {
        Dialect::DuckDb
    }

    fn namespace(&self) -> &str {
        &self.config.schema
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare(sql::table_exists_sql(Dialect::DuckDb))
            .map_err(|e| Error::motherduck_query(table, "Check table exists failed", e))?;

        let count: i64 = stmt
            .query_row(params![self.config.schema, table], |row| row.get(0))
            .map_err(|e| Error::motherduck_query(table, "Check table exists failed", e))?;

        Ok(count > 0)
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(sql::table_columns_sql(Dialect::DuckDb))
            .map_err(|e| Error::motherduck_query(table, "Column introspection failed", e))?;

        let rows = stmt
            .query_map(params![self.config.schema, table], |row| row.get(0))
            .map_err(|e| Error::motherduck_query(table, "Column introspection failed", e))?;

        rows.collect::<std::result::Result<Vec<String>, _>>()
            .map_err(|e| Error::motherduck_query(table, "Column introspection failed", e))
    }

    async fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| Error::motherduck_query("", "Execute batch failed", e))
    }

    async fn execute_in_transaction(&self, statements: &[Statement]) -> Result<u64> {
        self.conn
            .execute_batch("BEGIN TRANSACTION")
            .map_err(|e| Error::motherduck_query("", "Begin transaction failed", e))?;

        let mut affected = 0u64;
        for stmt in statements {
            match self.conn.execute(&stmt.sql, params_from_iter(stmt.params.iter())) {
                Ok(n) => affected += n as u64,
                Err(e) => {
                    self.rollback();
                    return Err(Error::motherduck_query("", "Statement failed", e));
                }
            }
        }

        if let Err(e) = self.conn.execute_batch("COMMIT") {
            self.rollback();
            return Err(Error::motherduck_query("", "Commit failed", e));
        }
        debug!("Committed {} statements", statements.len());
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> MotherDuckClient {
        MotherDuckClient::connect(MotherDuckConfig {
            path: ":memory:".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_table_introspection() {
        let client = memory();
        assert!(!client.table_exists("t").await.unwrap());

        client
            .execute_batch("CREATE TABLE main.t (id BIGINT, name VARCHAR)")
            .await
            .unwrap();
        assert!(client.table_exists("t").await.unwrap());
        assert_eq!(client.table_columns("t").await.unwrap(), vec!["id", "name"]);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back() {
        let client = memory();
        client
            .execute_batch("CREATE TABLE main.t (id BIGINT PRIMARY KEY)")
            .await
            .unwrap();

        let statements = vec![
            Statement {
                sql: "INSERT INTO main.t VALUES (CAST(?::VARCHAR AS BIGINT))".into(),
                params: vec![Some("1".into())],
            },
            Statement::raw("INSERT INTO main.missing VALUES (1)"),
        ];
        assert!(client.execute_in_transaction(&statements).await.is_err());
        assert_eq!(client.count_rows("t").unwrap(), 0);

        let affected = client
            .execute_in_transaction(&statements[..1])
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(client.count_rows("t").unwrap(), 1);
    }

    #[test]
    fn test_motherduck_requires_token() {
        let config = MotherDuckConfig {
            path: "md:analytics".into(),
            token: None,
            ..Default::default()
        };
        // Only meaningful when the environment does not provide a token
        if std::env::var(MOTHERDUCK_TOKEN_ENV).is_err() {
            let err = MotherDuckClient::connect(config).err().unwrap();
            assert_eq!(err.code(), "CONFIG_ERROR");
        }
    }
}
