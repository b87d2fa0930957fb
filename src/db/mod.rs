//! Schema-synchronizing, transactional writer. Reconciles declared table
//! structures against the live database, commits one block of rows plus its
//! progress-log entries in a single transaction, and answers the restart
//! queries (`last_block`, `get_block`).

pub mod adapter;
mod error;

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use crate::config::{DbAdapter, VentConfig};
use crate::sqlspec::Catalog;
use crate::types::{
    dictionary_table, log_table, BlockBatch, CrudAction, EventRow, SqlColumn, SqlColumnType,
    SqlValue, TableSchema, DICTIONARY_TABLE,
};

use adapter::{
    DeleteSpec, PostgresClient, SqlClient, SqlDialect, SqlStmt, SqliteClient, UpsertSpec,
};

pub use error::{DbError, SqlErrorKind};

/// A replayed block: every table the block touched, rows rendered as text.
#[derive(Debug)]
pub struct EventData {
    pub height: String,
    pub tables: BTreeMap<String, Vec<HashMap<String, Option<String>>>>,
}

pub struct VentDb {
    client: Box<dyn SqlClient>,
}

impl VentDb {
    /// Connect and make sure the namespace and the internal tables exist.
    pub async fn open(config: &VentConfig) -> Result<Self, DbError> {
        let client: Box<dyn SqlClient> = match config.db_adapter {
            DbAdapter::Postgres => {
                Box::new(PostgresClient::connect(&config.db_url, &config.db_schema).await?)
            }
            DbAdapter::Sqlite => Box::new(SqliteClient::open(&config.db_url).await?),
        };

        let db = Self { client };
        db.ensure_namespace().await?;
        // The dictionary first: every create records itself in it.
        db.sync_table(&dictionary_table()).await?;
        db.sync_table(&log_table()).await?;
        Ok(db)
    }

    async fn ensure_namespace(&self) -> Result<(), DbError> {
        let dialect = self.client.dialect();
        let (Some(find), Some(create)) = (dialect.find_schema_sql(), dialect.create_schema_sql())
        else {
            return Ok(());
        };

        let rows = self.client.query(&find, &[]).await?;
        if rows.first().map(|r| r.bool(0)).transpose()?.unwrap_or(false) {
            return Ok(());
        }

        tracing::info!("creating schema");
        match self.client.execute(&create, &[]).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == Some(SqlErrorKind::DuplicateSchema) => {
                tracing::warn!("schema already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn ping(&self) -> Result<(), DbError> {
        self.client.ping().await
    }

    /// Height of the last committed block, `"0"` when nothing has been
    /// committed yet.
    pub async fn last_block(&self) -> Result<String, DbError> {
        let sql = self.client.dialect().last_height_sql();
        let rows = self.client.query(&sql, &[]).await?;
        match rows.first() {
            Some(row) => Ok(row.text(0)?.unwrap_or_else(|| "0".to_string())),
            None => Ok("0".to_string()),
        }
    }

    /// Reconcile every declared table: create the missing ones, add the
    /// missing columns to existing ones. Idempotent.
    pub async fn synchronize(&self, catalog: &Catalog) -> Result<(), DbError> {
        tracing::info!(tables = catalog.schemas.len(), "synchronizing database structures");
        for schema in catalog.schemas.values() {
            self.sync_table(schema).await?;
        }
        Ok(())
    }

    async fn sync_table(&self, table: &TableSchema) -> Result<(), DbError> {
        if self.find_table(&table.name).await? {
            self.alter_table(table).await
        } else {
            self.create_table(table).await
        }
    }

    async fn find_table(&self, name: &str) -> Result<bool, DbError> {
        let sql = self.client.dialect().find_table_sql();
        let rows = self.client.query(&sql, &[SqlValue::Text(name.to_string())]).await?;
        Ok(rows.first().map(|r| r.bool(0)).transpose()?.unwrap_or(false))
    }

    async fn create_table(&self, table: &TableSchema) -> Result<(), DbError> {
        validate_column_order(table)?;

        let mut table = table.clone();
        table.columns.sort_by_key(|c| c.order);

        tracing::info!(table = %table.name, "creating table");
        let dialect = self.client.dialect();
        let mut stmts = vec![SqlStmt::new(dialect.create_table_sql(&table), vec![])];
        for column in &table.columns {
            stmts.push(dictionary_stmt(dialect, &table.name, column));
        }

        match self.client.execute_transaction(stmts).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == Some(SqlErrorKind::DuplicateTable) => {
                tracing::warn!(table = %table.name, "table already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn alter_table(&self, table: &TableSchema) -> Result<(), DbError> {
        let live = self.live_columns(&table.name).await?;
        let dialect = self.client.dialect();

        for column in &table.columns {
            // Presence is judged by name alone; a column that exists with a
            // different type is left untouched.
            if live.iter().any(|name| name == &column.name) {
                continue;
            }

            tracing::info!(table = %table.name, column = %column.name, "adding column");
            let alter = dialect.alter_add_column_sql(&table.name, column);
            match self.client.execute(&alter, &[]).await {
                Ok(_) => {}
                Err(e) if e.kind() == Some(SqlErrorKind::DuplicateColumn) => {
                    tracing::warn!(table = %table.name, column = %column.name, "column already exists");
                }
                Err(e) => return Err(e),
            }

            let stmt = dictionary_stmt(dialect, &table.name, column);
            self.client.execute(&stmt.sql, &stmt.params).await?;
        }
        Ok(())
    }

    /// Column names that physically exist right now.
    async fn live_columns(&self, table: &str) -> Result<Vec<String>, DbError> {
        let sql = self.client.dialect().live_columns_sql();
        let rows = self.client.query(&sql, &[SqlValue::Text(table.to_string())]).await?;
        let mut names = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(name) = row.text(0)? {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Declared structure of a table as the dialect reports it:
    /// `information_schema` on Postgres, the dictionary on SQLite.
    pub async fn table_definition(&self, name: &str) -> Result<Vec<SqlColumn>, DbError> {
        let sql = self.client.dialect().table_definition_sql();
        let rows = self.client.query(&sql, &[SqlValue::Text(name.to_string())]).await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let name = row.text(0)?.unwrap_or_default();
            let type_name = row.text(1)?.unwrap_or_default();
            let sql_type = SqlColumnType::from_str(&type_name).unwrap_or(SqlColumnType::Text);
            columns.push(SqlColumn {
                name,
                sql_type,
                length: row.int(2)? as usize,
                primary: row.bool(3)?,
                evm_type: String::new(),
                bytes_to_string: false,
                order: row.int(4)? as usize,
            });
        }
        Ok(columns)
    }

    /// Commit one block atomically: all row effects plus one log entry per
    /// touched table, or nothing. On schema drift the write is retried once
    /// after a full resynchronization.
    pub async fn set_block(&self, catalog: &Catalog, batch: &BlockBatch) -> Result<(), DbError> {
        if batch.is_empty() {
            tracing::debug!(height = %batch.height, "empty batch, nothing to commit");
            return Ok(());
        }

        match self.write_batch(catalog, batch).await {
            Err(e) if e.is_drift() || matches!(e, DbError::UnknownTable(_)) => {
                tracing::warn!(height = %batch.height, error = %e, "schema drift, resynchronizing and retrying");
                self.synchronize(catalog).await?;
                self.write_batch(catalog, batch).await
            }
            result => result,
        }
    }

    async fn write_batch(&self, catalog: &Catalog, batch: &BlockBatch) -> Result<(), DbError> {
        let dialect = self.client.dialect();
        let mut stmts = Vec::new();

        for (table_name, rows) in &batch.tables {
            let schema = catalog
                .schema(table_name)
                .ok_or_else(|| DbError::UnknownTable(table_name.clone()))?;

            let upsert = dialect.upsert_sql(schema);
            let delete = dialect.delete_sql(schema);

            for row in rows {
                match row.action {
                    CrudAction::Upsert => stmts.push(bind_upsert(&upsert, row)?),
                    CrudAction::Delete => stmts.push(bind_delete(&delete, row)?),
                }
            }

            stmts.push(SqlStmt::new(
                dialect.insert_log_sql(),
                vec![
                    SqlValue::Text(table_name.clone()),
                    SqlValue::Text(schema.event_name.clone()),
                    SqlValue::Text(schema.filter.clone()),
                    SqlValue::Int(rows.len() as i32),
                    SqlValue::Text(batch.height.clone()),
                ],
            ));
        }

        self.client.execute_transaction(stmts).await?;
        tracing::debug!(height = %batch.height, rows = batch.row_count(), "block committed");
        Ok(())
    }

    /// Replay a committed block: the tables its log entries name, with all
    /// row values rendered as text.
    pub async fn get_block(&self, height: &str) -> Result<EventData, DbError> {
        let dialect = self.client.dialect();
        let height_param = [SqlValue::Text(height.to_string())];
        let log_rows = self.client.query(&dialect.select_log_sql(), &height_param).await?;

        let mut tables = BTreeMap::new();
        for log_row in &log_rows {
            let Some(table_name) = log_row.text(0)? else { continue };
            let columns = self.table_definition(&table_name).await?;
            if columns.is_empty() {
                continue;
            }

            let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
            let sql = dialect.select_row_sql(&table_name, &names);
            let rows = self.client.query(&sql, &height_param).await?;

            let mut out = Vec::with_capacity(rows.len());
            for row in &rows {
                let mut data = HashMap::with_capacity(names.len());
                for (i, name) in names.iter().enumerate() {
                    data.insert(name.clone(), row.text(i)?);
                }
                out.push(data);
            }
            tables.insert(table_name, out);
        }

        Ok(EventData { height: height.to_string(), tables })
    }

    /// Drop everything this process manages. Postgres drops the schema;
    /// SQLite drops every table the dictionary records, then the internals.
    pub async fn destroy(&self) -> Result<(), DbError> {
        let dialect = self.client.dialect();
        if let Some(drop) = dialect.drop_schema_sql() {
            self.client.execute(&drop, &[]).await?;
            return Ok(());
        }

        let sql = format!(
            "SELECT DISTINCT _tablename FROM {};",
            dialect.qualify(DICTIONARY_TABLE)
        );
        let rows = self.client.query(&sql, &[]).await?;
        for row in &rows {
            if let Some(name) = row.text(0)? {
                let drop = format!("DROP TABLE IF EXISTS {};", dialect.qualify(&name));
                self.client.execute(&drop, &[]).await?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn raw_execute(&self, sql: &str) -> Result<u64, DbError> {
        self.client.execute(sql, &[]).await
    }
}

fn validate_column_order(table: &TableSchema) -> Result<(), DbError> {
    let mut seen = vec![false; table.columns.len()];
    for column in &table.columns {
        if column.order == 0 || column.order > table.columns.len() || seen[column.order - 1] {
            return Err(DbError::BadSchema {
                table: table.name.clone(),
                reason: format!("column order is not dense at column {}", column.name),
            });
        }
        seen[column.order - 1] = true;
    }
    Ok(())
}

fn dictionary_stmt(dialect: &dyn SqlDialect, table: &str, column: &SqlColumn) -> SqlStmt {
    SqlStmt::new(
        dialect.insert_dictionary_sql(),
        vec![
            SqlValue::Text(table.to_string()),
            SqlValue::Text(column.name.clone()),
            SqlValue::Text(column.sql_type.to_string()),
            SqlValue::Int(column.length as i32),
            SqlValue::Int(column.primary as i32),
            SqlValue::Int(column.order as i32),
        ],
    )
}

fn bind_upsert(spec: &UpsertSpec, row: &EventRow) -> Result<SqlStmt, DbError> {
    let mut params = vec![SqlValue::Null; spec.param_len];
    for column in &spec.columns {
        match row.data.get(&column.name) {
            Some(value) => {
                params[column.insert_pos] = value.clone();
                if let Some(pos) = column.update_pos {
                    params[pos] = value.clone();
                }
            }
            // Absent non-key columns bind as NULL.
            None if column.primary => return Err(DbError::MissingPrimaryKey(column.name.clone())),
            None => {}
        }
    }
    Ok(SqlStmt::new(spec.sql.clone(), params))
}

fn bind_delete(spec: &DeleteSpec, row: &EventRow) -> Result<SqlStmt, DbError> {
    if spec.columns.is_empty() {
        return Err(DbError::MissingPrimaryKey("(table has no primary key)".to_string()));
    }
    let mut params = Vec::with_capacity(spec.columns.len());
    for name in &spec.columns {
        match row.data.get(name) {
            Some(value) if !value.is_null() => params.push(value.clone()),
            _ => return Err(DbError::MissingPrimaryKey(name.clone())),
        }
    }
    Ok(SqlStmt::new(spec.sql.clone(), params))
}

#[cfg(test)]
mod tests {
    use crate::sqlspec::{fixtures, parse_bytes};
    use crate::types::{COL_EVENT_NAME, COL_EVENT_TYPE, COL_HEIGHT, COL_TX_HASH};

    use super::*;

    fn sqlite_config(path: &str) -> VentConfig {
        let mut config = VentConfig::default_for(DbAdapter::Sqlite);
        config.db_url = path.to_string();
        config
    }

    async fn memory_db() -> VentDb {
        VentDb::open(&sqlite_config(":memory:")).await.unwrap()
    }

    fn upsert_row(pairs: &[(&str, SqlValue)]) -> EventRow {
        EventRow::upsert(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    fn event_row(height: &str, key: &str, description: Option<&str>) -> EventRow {
        let mut pairs = vec![
            (COL_HEIGHT, SqlValue::Text(height.to_string())),
            (COL_TX_HASH, SqlValue::Text(format!("TX{height}"))),
            (COL_EVENT_TYPE, SqlValue::Text("LogEvent".to_string())),
            (COL_EVENT_NAME, SqlValue::Text("UpdateTestEvents".to_string())),
            ("testkey", SqlValue::Numeric(key.to_string())),
        ];
        if let Some(description) = description {
            pairs.push(("testdescription", SqlValue::Text(description.to_string())));
        }
        upsert_row(&pairs)
    }

    fn event_batch(height: &str, rows: Vec<EventRow>) -> BlockBatch {
        let mut batch = BlockBatch::new(height);
        for row in rows {
            batch.add_row("eventtest", row);
        }
        batch
    }

    #[tokio::test]
    async fn test_open_creates_internal_tables() {
        let db = memory_db().await;
        assert!(db.find_table("_vent_log").await.unwrap());
        assert!(db.find_table("_vent_dictionary").await.unwrap());
        assert_eq!(db.last_block().await.unwrap(), "0");
    }

    #[tokio::test]
    async fn test_synchronize_is_idempotent() {
        let db = memory_db().await;
        let catalog = parse_bytes(fixtures::GOOD_SPEC.as_bytes()).unwrap();

        db.synchronize(&catalog).await.unwrap();
        let first = db.table_definition("useraccounts").await.unwrap();

        db.synchronize(&catalog).await.unwrap();
        let second = db.table_definition("useraccounts").await.unwrap();

        assert_eq!(first.len(), second.len());
        assert!(first.iter().any(|c| c.name == "address" && c.primary));
        assert!(db.find_table("test_table").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_block_and_get_block() {
        let db = memory_db().await;
        let catalog = parse_bytes(fixtures::EVENT_TEST_SPEC.as_bytes()).unwrap();
        db.synchronize(&catalog).await.unwrap();

        db.set_block(&catalog, &event_batch("2", vec![event_row("2", "1", Some("first"))]))
            .await
            .unwrap();
        db.set_block(&catalog, &event_batch("5", vec![event_row("5", "2", Some("second"))]))
            .await
            .unwrap();

        assert_eq!(db.last_block().await.unwrap(), "5");

        let block = db.get_block("2").await.unwrap();
        let rows = &block.tables["eventtest"];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["_eventname"], Some("UpdateTestEvents".to_string()));
        assert_eq!(rows[0]["testkey"], Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_empty_batch_leaves_no_trace() {
        let db = memory_db().await;
        let catalog = parse_bytes(fixtures::EVENT_TEST_SPEC.as_bytes()).unwrap();
        db.synchronize(&catalog).await.unwrap();

        db.set_block(&catalog, &BlockBatch::new("9")).await.unwrap();
        assert_eq!(db.last_block().await.unwrap(), "0");
    }

    #[tokio::test]
    async fn test_replay_is_deterministic_with_primary_keys() {
        let db = memory_db().await;
        let catalog = parse_bytes(fixtures::EVENT_TEST_SPEC.as_bytes()).unwrap();
        db.synchronize(&catalog).await.unwrap();

        let batch_a = event_batch("2", vec![event_row("2", "1", Some("a"))]);
        let batch_b = event_batch("3", vec![event_row("3", "1", Some("b"))]);

        // Redelivery of batch_a before batch_b must converge to the same row.
        db.set_block(&catalog, &batch_a).await.unwrap();
        db.set_block(&catalog, &batch_a).await.unwrap();
        db.set_block(&catalog, &batch_b).await.unwrap();

        let block = db.get_block("3").await.unwrap();
        let rows = &block.tables["eventtest"];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["testdescription"], Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_upsert_null_fills_absent_columns() {
        let db = memory_db().await;
        let catalog = parse_bytes(fixtures::EVENT_TEST_SPEC.as_bytes()).unwrap();
        db.synchronize(&catalog).await.unwrap();

        db.set_block(&catalog, &event_batch("4", vec![event_row("4", "7", None)]))
            .await
            .unwrap();

        let block = db.get_block("4").await.unwrap();
        assert_eq!(block.tables["eventtest"][0]["testdescription"], None);
    }

    #[tokio::test]
    async fn test_missing_primary_key_is_rejected() {
        let db = memory_db().await;
        let catalog = parse_bytes(fixtures::EVENT_TEST_SPEC.as_bytes()).unwrap();
        db.synchronize(&catalog).await.unwrap();

        let row = upsert_row(&[
            (COL_HEIGHT, SqlValue::Text("4".to_string())),
            (COL_TX_HASH, SqlValue::Text("TX".to_string())),
            (COL_EVENT_TYPE, SqlValue::Text("LogEvent".to_string())),
            (COL_EVENT_NAME, SqlValue::Text("UpdateTestEvents".to_string())),
        ]);
        let err = db.set_block(&catalog, &event_batch("4", vec![row])).await.unwrap_err();
        assert!(matches!(err, DbError::MissingPrimaryKey(column) if column == "testkey"));
        assert_eq!(db.last_block().await.unwrap(), "0");
    }

    #[tokio::test]
    async fn test_delete_follows_upsert_in_order() {
        let db = memory_db().await;
        let catalog = parse_bytes(fixtures::EVENT_TEST_SPEC.as_bytes()).unwrap();
        db.synchronize(&catalog).await.unwrap();

        let delete = EventRow::delete(
            [("testkey".to_string(), SqlValue::Numeric("1".to_string()))].into_iter().collect(),
        );
        let batch = event_batch("6", vec![event_row("6", "1", Some("gone")), delete]);
        db.set_block(&catalog, &batch).await.unwrap();

        let block = db.get_block("6").await.unwrap();
        assert!(block.tables["eventtest"].is_empty());
        assert_eq!(db.last_block().await.unwrap(), "6");
    }

    #[tokio::test]
    async fn test_append_table_accepts_duplicates() {
        let spec = r#"[{
            "TableName": "AppendOnly",
            "Filter": "EventType = 'LogEvent'",
            "Event": {
                "inputs": [{"indexed": false, "name": "note", "type": "string"}],
                "name": "NoteAdded",
                "type": "event"
            },
            "Columns": {"note": {"name": "note", "primary": false}}
        }]"#;
        let catalog = parse_bytes(spec.as_bytes()).unwrap();
        let db = memory_db().await;
        db.synchronize(&catalog).await.unwrap();

        let row = upsert_row(&[
            (COL_HEIGHT, SqlValue::Text("1".to_string())),
            (COL_TX_HASH, SqlValue::Text("TX".to_string())),
            (COL_EVENT_TYPE, SqlValue::Text("LogEvent".to_string())),
            (COL_EVENT_NAME, SqlValue::Text("NoteAdded".to_string())),
            ("note", SqlValue::Text("same".to_string())),
        ]);
        let mut batch = BlockBatch::new("1");
        batch.add_row("appendonly", row.clone());
        batch.add_row("appendonly", row);
        db.set_block(&catalog, &batch).await.unwrap();

        let block = db.get_block("1").await.unwrap();
        assert_eq!(block.tables["appendonly"].len(), 2);
    }

    #[tokio::test]
    async fn test_restart_resumes_from_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vent.db");
        let path = path.to_str().unwrap();
        let catalog = parse_bytes(fixtures::EVENT_TEST_SPEC.as_bytes()).unwrap();

        {
            let db = VentDb::open(&sqlite_config(path)).await.unwrap();
            db.synchronize(&catalog).await.unwrap();
            db.set_block(&catalog, &event_batch("4", vec![event_row("4", "1", Some("four"))]))
                .await
                .unwrap();
        }

        // A fresh process sees the committed progress and continues.
        let db = VentDb::open(&sqlite_config(path)).await.unwrap();
        assert_eq!(db.last_block().await.unwrap(), "4");

        db.synchronize(&catalog).await.unwrap();
        db.set_block(&catalog, &event_batch("5", vec![event_row("5", "2", Some("five"))]))
            .await
            .unwrap();
        assert_eq!(db.last_block().await.unwrap(), "5");

        let block = db.get_block("4").await.unwrap();
        assert_eq!(block.tables["eventtest"][0]["testdescription"], Some("four".to_string()));
    }

    #[tokio::test]
    async fn test_drift_recovery_restores_dropped_column() {
        let db = memory_db().await;
        let catalog = parse_bytes(fixtures::EVENT_TEST_SPEC.as_bytes()).unwrap();
        db.synchronize(&catalog).await.unwrap();

        db.set_block(&catalog, &event_batch("1", vec![event_row("1", "1", Some("one"))]))
            .await
            .unwrap();

        // Somebody external drops a projected column between writes.
        db.raw_execute("ALTER TABLE eventtest DROP COLUMN testdescription;").await.unwrap();

        db.set_block(&catalog, &event_batch("2", vec![event_row("2", "2", Some("two"))]))
            .await
            .unwrap();

        let block = db.get_block("2").await.unwrap();
        assert_eq!(block.tables["eventtest"].len(), 1);
        assert_eq!(
            block.tables["eventtest"][0]["testdescription"],
            Some("two".to_string())
        );
        // The pre-drift row survives with a NULL in the re-added column.
        let earlier = db.get_block("1").await.unwrap();
        assert_eq!(earlier.tables["eventtest"][0]["testdescription"], None);
    }

    #[tokio::test]
    async fn test_unsynchronized_table_is_created_on_write() {
        let db = memory_db().await;
        let catalog = parse_bytes(fixtures::EVENT_TEST_SPEC.as_bytes()).unwrap();

        // No synchronize call: the first write hits a missing table, heals
        // and retries.
        db.set_block(&catalog, &event_batch("1", vec![event_row("1", "1", Some("x"))]))
            .await
            .unwrap();
        assert_eq!(db.last_block().await.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let db = memory_db().await;
        let catalog = parse_bytes(fixtures::EVENT_TEST_SPEC.as_bytes()).unwrap();
        db.synchronize(&catalog).await.unwrap();

        db.destroy().await.unwrap();
        assert!(!db.find_table("eventtest").await.unwrap());
        assert!(!db.find_table("_vent_log").await.unwrap());
    }
}
