//! SQL generation for the warehouse dialects.
//!
//! Every value is bound as a text parameter and cast server-side to the column type, so
//! statements never interpolate data.

use crate::error::{Error, Result};
use crate::normalize::NormalizedRecord;
use crate::registry::ScalarType;
use crate::schema::{FieldSchema, FieldType, TableSchema};
use std::collections::HashMap;

/// Maximum bind parameters in one statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Audit column set when a row is first inserted.
pub const CREATED_AT_COLUMN: &str = "etl_created_at";

/// Audit column refreshed on every merge.
pub const UPDATED_AT_COLUMN: &str = "etl_updated_at";

/// Warehouse SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// PostgreSQL
    Postgres,
    /// DuckDB / MotherDuck
    DuckDb,
}

impl Dialect {
    /// Column type of a field.
    pub fn column_type(&self, field: &FieldSchema) -> &'static str {
        match &field.field_type {
            FieldType::Scalar(scalar) if !field.is_structured() => self.scalar_type(*scalar),
            _ => self.structured_type(),
        }
    }

    /// Column type holding records and lists as JSON.
    fn structured_type(&self) -> &'static str {
        match self {
            Dialect::Postgres => "JSONB",
            Dialect::DuckDb => "VARCHAR",
        }
    }

    fn scalar_type(&self, scalar: ScalarType) -> &'static str {
        match (self, scalar) {
            (_, ScalarType::Boolean) => "BOOLEAN",
            (_, ScalarType::Date) => "DATE",
            (Dialect::Postgres, ScalarType::Float) => "DOUBLE PRECISION",
            (Dialect::DuckDb, ScalarType::Float) => "DOUBLE",
            (_, ScalarType::Integer) => "BIGINT",
            (Dialect::Postgres, ScalarType::String | ScalarType::JsonString) => "TEXT",
            (Dialect::DuckDb, ScalarType::String | ScalarType::JsonString) => "VARCHAR",
            (_, ScalarType::Timestamp) => "TIMESTAMP",
            (_, ScalarType::Time) => "TIME",
        }
    }

    /// Bind placeholder number `n` (1-based) cast to `column_type`.
    pub fn placeholder(&self, n: usize, column_type: &str) -> String {
        match self {
            Dialect::Postgres => format!("CAST(${}::TEXT AS {})", n, column_type),
            Dialect::DuckDb => format!("CAST(?::VARCHAR AS {})", column_type),
        }
    }
}

/// A statement with its bound text parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL text
    pub sql: String,
    /// Parameters, `None` binds NULL
    pub params: Vec<Option<String>>,
}

impl Statement {
    /// Statement without parameters.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }
}

/// Double-quote an identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"namespace"."table"`.
pub fn qualified(namespace: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(namespace), quote_ident(table))
}

fn column_list<'a>(columns: impl IntoIterator<Item = &'a str>) -> String {
    columns
        .into_iter()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Create the namespace if missing.
pub fn create_schema_sql(namespace: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(namespace))
}

/// Destination table DDL.
pub fn create_table_sql(
    dialect: Dialect,
    namespace: &str,
    table: &str,
    schema: &TableSchema,
) -> Result<String> {
    if schema.is_empty() {
        return Err(Error::schema(format!(
            "Cannot create table {} without columns",
            table
        )));
    }

    let mut columns: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| format!("{} {}", quote_ident(&f.name), dialect.column_type(f)))
        .collect();
    columns.push(format!(
        "{} TIMESTAMP DEFAULT CURRENT_TIMESTAMP",
        quote_ident(CREATED_AT_COLUMN)
    ));
    columns.push(format!(
        "{} TIMESTAMP DEFAULT CURRENT_TIMESTAMP",
        quote_ident(UPDATED_AT_COLUMN)
    ));

    let pk = schema.primary_key();
    if !pk.is_empty() {
        columns.push(format!("PRIMARY KEY ({})", column_list(pk)));
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        qualified(namespace, table),
        columns.join(",\n    ")
    ))
}

/// Empty a table.
pub fn truncate_sql(dialect: Dialect, namespace: &str, table: &str) -> String {
    match dialect {
        Dialect::Postgres => format!("TRUNCATE TABLE {}", qualified(namespace, table)),
        Dialect::DuckDb => format!("DELETE FROM {}", qualified(namespace, table)),
    }
}

fn rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).max(1)
}

fn values_statement(
    dialect: Dialect,
    head: &str,
    tail: &str,
    types: &[&str],
    rows: &[&NormalizedRecord],
) -> Statement {
    let mut params = Vec::with_capacity(rows.len() * types.len());
    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        let placeholders: Vec<String> = row
            .values()
            .iter()
            .zip(types)
            .map(|(value, ty)| {
                params.push(value.to_sql_text());
                dialect.placeholder(params.len(), ty)
            })
            .collect();
        tuples.push(format!("({})", placeholders.join(", ")));
    }
    Statement {
        sql: format!("{} VALUES {}{}", head, tuples.join(", "), tail),
        params,
    }
}

fn column_types(dialect: Dialect, schema: &TableSchema) -> Vec<&'static str> {
    schema
        .fields()
        .iter()
        .map(|f| dialect.column_type(f))
        .collect()
}

/// Plain inserts of a batch, split to respect the bind-parameter limit.
pub fn insert_statements(
    dialect: Dialect,
    namespace: &str,
    table: &str,
    schema: &TableSchema,
    records: &[NormalizedRecord],
) -> Vec<Statement> {
    let head = format!(
        "INSERT INTO {} ({})",
        qualified(namespace, table),
        column_list(schema.fields().iter().map(|f| f.name.as_str()))
    );
    let types = column_types(dialect, schema);
    let rows: Vec<&NormalizedRecord> = records.iter().collect();
    rows.chunks(rows_per_statement(types.len()))
        .map(|chunk| values_statement(dialect, &head, "", &types, chunk))
        .collect()
}

/// Upserts of a batch, split to respect the bind-parameter limit.
///
/// Records sharing a primary key are collapsed to the last one. On conflict every non-key column
/// is overwritten and the update timestamp refreshed.
pub fn upsert_statements(
    dialect: Dialect,
    namespace: &str,
    table: &str,
    schema: &TableSchema,
    records: &[NormalizedRecord],
) -> Result<Vec<Statement>> {
    let pk = schema.primary_key();
    if pk.is_empty() {
        return Err(Error::schema(format!(
            "Merge into {} requires primary key columns",
            table
        )));
    }

    let key_positions: Vec<usize> = schema
        .fields()
        .iter()
        .enumerate()
        .filter(|(_, f)| f.is_primary_key)
        .map(|(i, _)| i)
        .collect();
    let rows = dedup_by_key(records, &key_positions);

    let mut updates: Vec<String> = schema
        .fields()
        .iter()
        .filter(|f| !f.is_primary_key)
        .map(|f| format!("{0} = EXCLUDED.{0}", quote_ident(&f.name)))
        .collect();
    updates.push(format!(
        "{} = CURRENT_TIMESTAMP",
        quote_ident(UPDATED_AT_COLUMN)
    ));

    let head = format!(
        "INSERT INTO {} ({})",
        qualified(namespace, table),
        column_list(schema.fields().iter().map(|f| f.name.as_str()))
    );
    let tail = format!(
        " ON CONFLICT ({}) DO UPDATE SET {}",
        column_list(pk),
        updates.join(", ")
    );
    let types = column_types(dialect, schema);

    Ok(rows
        .chunks(rows_per_statement(types.len()))
        .map(|chunk| values_statement(dialect, &head, &tail, &types, chunk))
        .collect())
}

fn dedup_by_key<'a>(
    records: &'a [NormalizedRecord],
    key_positions: &[usize],
) -> Vec<&'a NormalizedRecord> {
    let mut last: HashMap<Vec<Option<String>>, usize> = HashMap::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        let key = key_positions
            .iter()
            .map(|&p| record.values()[p].to_sql_text())
            .collect();
        last.insert(key, i);
    }
    let mut keep: Vec<usize> = last.into_values().collect();
    keep.sort_unstable();
    keep.into_iter().map(|i| &records[i]).collect()
}

/// Column introspection query; binds the namespace and table name.
pub fn table_columns_sql(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => {
            "SELECT column_name::TEXT FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position"
        }
        Dialect::DuckDb => {
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position"
        }
    }
}

/// Table existence query; binds the namespace and table name.
pub fn table_exists_sql(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => {
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2"
        }
        Dialect::DuckDb => {
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = ? AND table_name = ?"
        }
    }
}
