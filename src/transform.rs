//! Set-based transformations inside the warehouse.

use crate::config::TransformationConfig;
use crate::error::{Error, Result};
use crate::sql::{Statement, qualified, quote_ident};
use crate::sync::{LoadType, Warehouse};
use tracing::{debug, info, instrument};

/// Upsert every row of `source` into `destination`.
pub fn merge_sql(
    namespace: &str,
    source: &str,
    destination: &str,
    columns: &[String],
    primary_key: &[String],
) -> Result<String> {
    if primary_key.is_empty() {
        return Err(Error::schema(format!(
            "Merge into {} requires a primary key",
            destination
        )));
    }
    if columns.is_empty() {
        return Err(Error::schema(format!(
            "Source table {} has no columns or doesn't exist",
            source
        )));
    }

    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let key_list = primary_key
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !primary_key.contains(c))
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    Ok(format!(
        "INSERT INTO {dest} ({cols}) SELECT {cols} FROM {src} ON CONFLICT ({keys}) {action}",
        dest = qualified(namespace, destination),
        cols = column_list,
        src = qualified(namespace, source),
        keys = key_list,
        action = action,
    ))
}

/// Rebuild `destination` from `source`, then restore its primary key.
pub fn replace_sql(
    namespace: &str,
    source: &str,
    destination: &str,
    primary_key: &[String],
) -> Vec<String> {
    let dest = qualified(namespace, destination);
    let mut statements = vec![
        format!("DROP TABLE IF EXISTS {}", dest),
        format!(
            "CREATE TABLE {} AS SELECT * FROM {}",
            dest,
            qualified(namespace, source)
        ),
    ];
    if !primary_key.is_empty() {
        let keys = primary_key
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        statements.push(format!("ALTER TABLE {} ADD PRIMARY KEY ({})", dest, keys));
    }
    statements
}

/// Run a transformation job in one warehouse transaction.
///
/// Returns the affected row count reported by the warehouse.
#[instrument(skip(warehouse, config), fields(job = %config.job_name, mode = %config.mode))]
pub async fn run_transformation<W: Warehouse>(
    warehouse: &W,
    config: &TransformationConfig,
) -> Result<u64> {
    let mode: LoadType = config.mode.parse()?;
    let primary_key = config.primary_key();
    let namespace = warehouse.namespace();

    let statements: Vec<Statement> = match mode {
        LoadType::Merge => {
            let columns = warehouse.table_columns(&config.source_table).await?;
            debug!("Source columns: {:?}", columns);
            let sql = merge_sql(
                namespace,
                &config.source_table,
                &config.destination_table,
                &columns,
                &primary_key,
            )?;
            vec![Statement::raw(sql)]
        }
        LoadType::Replace => replace_sql(
            namespace,
            &config.source_table,
            &config.destination_table,
            &primary_key,
        )
        .into_iter()
        .map(Statement::raw)
        .collect(),
    };

    for stmt in &statements {
        info!("Query: {}", stmt.sql);
    }
    let affected = warehouse.execute_in_transaction(&statements).await?;
    info!(
        "Table {} sync successfully! Affected rows: {}",
        config.destination_table, affected
    );
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::tests::RecordingWarehouse;

    fn config(mode: &str, pk: Option<&str>) -> TransformationConfig {
        TransformationConfig {
            job_name: "report".into(),
            source_table: "orders".into(),
            destination_table: "orders_report".into(),
            mode: mode.into(),
            primary_key: pk.map(str::to_string),
        }
    }

    #[test]
    fn test_merge_sql() {
        let cols = vec!["id".to_string(), "total".to_string()];
        let sql = merge_sql("dwh", "src", "dst", &cols, &["id".to_string()]).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"dwh\".\"dst\" (\"id\", \"total\") SELECT \"id\", \"total\" \
             FROM \"dwh\".\"src\" ON CONFLICT (\"id\") DO UPDATE SET \"total\" = EXCLUDED.\"total\""
        );
    }

    #[test]
    fn test_merge_sql_only_keys() {
        let cols = vec!["id".to_string()];
        let sql = merge_sql("dwh", "src", "dst", &cols, &cols).unwrap();
        assert!(sql.ends_with("ON CONFLICT (\"id\") DO NOTHING"));
        assert!(merge_sql("dwh", "src", "dst", &cols, &[]).is_err());
        assert!(merge_sql("dwh", "src", "dst", &[], &cols).is_err());
    }

    #[test]
    fn test_replace_sql() {
        let stmts = replace_sql("dwh", "src", "dst", &["a".to_string(), "b".to_string()]);
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[0], "DROP TABLE IF EXISTS \"dwh\".\"dst\"");
        assert_eq!(stmts[2], "ALTER TABLE \"dwh\".\"dst\" ADD PRIMARY KEY (\"a\", \"b\")");
        assert_eq!(replace_sql("dwh", "src", "dst", &[]).len(), 2);
    }

    #[tokio::test]
    async fn test_run_merge_uses_source_columns() {
        let wh = RecordingWarehouse {
            columns: vec!["id".into(), "total".into()],
            ..Default::default()
        };
        run_transformation(&wh, &config("merge", Some("id"))).await.unwrap();
        let tx = wh.transactions.borrow();
        assert_eq!(tx.len(), 1);
        assert!(tx[0][0].sql.contains("\"total\" = EXCLUDED.\"total\""));
    }

    #[tokio::test]
    async fn test_run_replace_is_one_transaction() {
        let wh = RecordingWarehouse::default();
        run_transformation(&wh, &config("replace", Some("id"))).await.unwrap();
        let tx = wh.transactions.borrow();
        assert_eq!(tx.len(), 1);
        assert_eq!(tx[0].len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_mode() {
        let wh = RecordingWarehouse::default();
        let err = run_transformation(&wh, &config("append", None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_LOAD_TYPE");
    }
}
