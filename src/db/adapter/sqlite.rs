use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rusqlite::params_from_iter;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::Connection;
use tokio::task;

use crate::types::{SqlColumn, SqlColumnType, SqlValue, TableSchema, DICTIONARY_TABLE, LOG_TABLE};

use super::super::error::{DbError, SqlErrorKind};
use super::{
    build_delete, build_upsert, create_table_body, DeleteSpec, SqlClient, SqlDialect, SqlRow,
    SqlStmt, UpsertSpec,
};

/// Query builder for SQLite. No namespaces; table presence is answered by
/// `sqlite_master` and column structure by the schema dictionary, since
/// SQLite has no introspection catalog carrying our generic types.
#[derive(Debug, Clone, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    fn placeholder(position: usize, _sql_type: SqlColumnType) -> String {
        format!("?{position}")
    }
}

impl SqlDialect for SqliteDialect {
    fn type_mapping(&self, column: &SqlColumn) -> String {
        match column.sql_type {
            SqlColumnType::Bool => "BOOLEAN".to_string(),
            SqlColumnType::ByteA => "BLOB".to_string(),
            SqlColumnType::Int => "INTEGER".to_string(),
            SqlColumnType::Numeric => "NUMERIC".to_string(),
            SqlColumnType::Text => "TEXT".to_string(),
            SqlColumnType::Varchar => {
                if column.length > 0 {
                    format!("VARCHAR({})", column.length)
                } else {
                    "VARCHAR".to_string()
                }
            }
            SqlColumnType::Timestamp => "TIMESTAMP".to_string(),
            // Single INTEGER primary keys alias the rowid and autoincrement.
            SqlColumnType::Serial => "INTEGER".to_string(),
        }
    }

    fn qualify(&self, table: &str) -> String {
        self.quote(table)
    }

    fn find_schema_sql(&self) -> Option<String> {
        None
    }

    fn create_schema_sql(&self) -> Option<String> {
        None
    }

    fn drop_schema_sql(&self) -> Option<String> {
        None
    }

    fn create_table_sql(&self, table: &TableSchema) -> String {
        create_table_body(self, table)
    }

    fn upsert_sql(&self, table: &TableSchema) -> UpsertSpec {
        build_upsert(self, table, &Self::placeholder, &|table, updates| {
            let keys = table
                .primary_columns()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            if updates.is_empty() {
                format!("ON CONFLICT ({keys}) DO NOTHING")
            } else {
                format!("ON CONFLICT ({keys}) DO UPDATE SET {updates}")
            }
        })
    }

    fn delete_sql(&self, table: &TableSchema) -> DeleteSpec {
        build_delete(self, table, &Self::placeholder)
    }

    fn alter_add_column_sql(&self, table: &str, column: &SqlColumn) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {} {};",
            self.qualify(table),
            self.quote(&column.name),
            self.type_mapping(column)
        )
    }

    fn find_table_sql(&self) -> String {
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1;".to_string()
    }

    fn table_definition_sql(&self) -> String {
        format!(
            "SELECT _columnname, _columntype, _columnlength, _primarykey, _columnorder \
             FROM {DICTIONARY_TABLE} WHERE _tablename = ?1 ORDER BY _columnorder;"
        )
    }

    fn live_columns_sql(&self) -> String {
        "SELECT name FROM pragma_table_info(?1);".to_string()
    }

    fn select_row_sql(&self, table: &str, columns: &[String]) -> String {
        let fields = columns
            .iter()
            .map(|c| format!("CAST({} AS TEXT)", self.quote(c)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("SELECT {} FROM {} WHERE _height = ?1;", fields, self.qualify(table))
    }

    fn select_log_sql(&self) -> String {
        format!("SELECT DISTINCT _tablename FROM {LOG_TABLE} WHERE _height = ?1;")
    }

    fn insert_log_sql(&self) -> String {
        format!(
            "INSERT INTO {LOG_TABLE} (_timestamp, _tablename, _eventname, _eventfilter, _rowcount, _height) \
             VALUES (CURRENT_TIMESTAMP, ?1, ?2, ?3, ?4, ?5);"
        )
    }

    fn insert_dictionary_sql(&self) -> String {
        format!(
            "INSERT INTO {DICTIONARY_TABLE} (_tablename, _columnname, _columntype, _columnlength, _primarykey, _columnorder) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) ON CONFLICT DO NOTHING;"
        )
    }

    fn last_height_sql(&self) -> String {
        format!(
            "WITH ll AS (SELECT MAX(_id) AS _id FROM {LOG_TABLE}) \
             SELECT COALESCE(l._height, '0') FROM ll LEFT OUTER JOIN {LOG_TABLE} l ON ll._id = l._id;"
        )
    }
}

impl rusqlite::types::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(*b as i64)),
            SqlValue::Int(n) => ToSqlOutput::Owned(Value::Integer(*n as i64)),
            SqlValue::BigInt(n) => ToSqlOutput::Owned(Value::Integer(*n)),
            // Decimal strings keep their full precision under NUMERIC
            // affinity; SQLite only folds them when the fold is lossless.
            SqlValue::Numeric(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> Self {
        // SQLite reports schema conflicts as generic errors; the message is
        // the only classification signal it offers.
        let message = e.to_string();
        let lower = message.to_lowercase();
        let kind = if lower.contains("already exists") && lower.contains("table") {
            SqlErrorKind::DuplicateTable
        } else if lower.contains("duplicate column name") {
            SqlErrorKind::DuplicateColumn
        } else if lower.contains("no such table") {
            SqlErrorKind::UndefinedTable
        } else if lower.contains("no such column") || lower.contains("has no column named") {
            SqlErrorKind::UndefinedColumn
        } else {
            SqlErrorKind::Generic
        };
        DbError::Sql { kind, message }
    }
}

/// SQLite client. The connection is synchronous, so every call runs on the
/// blocking pool; the single mutex also serializes writers, which SQLite
/// requires anyway.
pub struct SqliteClient {
    conn: Arc<Mutex<Connection>>,
    dialect: SqliteDialect,
}

impl SqliteClient {
    pub async fn open(path: &str) -> Result<Self, DbError> {
        let path = path.to_string();
        let conn = task::spawn_blocking(move || Connection::open(path).map_err(DbError::from))
            .await
            .map_err(join_err)??;
        tracing::info!("opened sqlite database");
        Ok(Self { conn: Arc::new(Mutex::new(conn)), dialect: SqliteDialect })
    }
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

fn join_err(e: task::JoinError) -> DbError {
    DbError::Task(e.to_string())
}

#[async_trait]
impl SqlClient for SqliteClient {
    fn dialect(&self) -> &dyn SqlDialect {
        &self.dialect
    }

    async fn ping(&self) -> Result<(), DbError> {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let conn = lock(&conn);
            conn.query_row("SELECT 1;", [], |_| Ok(())).map_err(DbError::from)
        })
        .await
        .map_err(join_err)?
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        let conn = self.conn.clone();
        let sql = sql.to_string();
        let params = params.to_vec();
        task::spawn_blocking(move || {
            let conn = lock(&conn);
            let mut stmt = conn.prepare_cached(&sql)?;
            let changed = stmt.execute(params_from_iter(params.iter()))?;
            Ok(changed as u64)
        })
        .await
        .map_err(join_err)?
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        let conn = self.conn.clone();
        let sql = sql.to_string();
        let params = params.to_vec();
        task::spawn_blocking(move || {
            let conn = lock(&conn);
            let mut stmt = conn.prepare_cached(&sql)?;
            let column_count = stmt.column_count();
            let mut rows = stmt.query(params_from_iter(params.iter()))?;

            // Drain the cursor completely before the statement drops.
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    values.push(match row.get_ref(i)? {
                        ValueRef::Null => SqlValue::Null,
                        ValueRef::Integer(n) => SqlValue::BigInt(n),
                        ValueRef::Real(f) => SqlValue::Numeric(f.to_string()),
                        ValueRef::Text(t) => {
                            SqlValue::Text(String::from_utf8_lossy(t).into_owned())
                        }
                        ValueRef::Blob(b) => SqlValue::Bytes(b.to_vec()),
                    });
                }
                out.push(SqlRow { values });
            }
            Ok(out)
        })
        .await
        .map_err(join_err)?
    }

    async fn execute_transaction(&self, stmts: Vec<SqlStmt>) -> Result<(), DbError> {
        if stmts.is_empty() {
            return Ok(());
        }

        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let mut conn = lock(&conn);
            let tx = conn.transaction()?;
            for stmt in &stmts {
                let mut prepared = tx.prepare_cached(&stmt.sql)?;
                if let Err(e) = prepared.execute(params_from_iter(stmt.params.iter())) {
                    tracing::debug!(sql = %stmt.sql, error = %e, "statement failed, rolling back");
                    return Err(e.into());
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }
}
