//! Dialect adapters. All SQL text, identifier quoting, placeholder syntax
//! and driver error classification live behind the two traits in this
//! module; nothing outside the adapters speaks a specific dialect.

mod postgres;
mod sqlite;

use async_trait::async_trait;

use crate::types::{SqlColumn, SqlColumnType, SqlValue, TableSchema};

use super::error::DbError;

pub use postgres::{PostgresClient, PostgresDialect};
pub use sqlite::{SqliteClient, SqliteDialect};

/// One parameterized statement, ready for execution.
#[derive(Debug, Clone)]
pub struct SqlStmt {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlStmt {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self { sql: sql.into(), params }
    }
}

/// Bind layout of one column in a prepared upsert.
#[derive(Debug, Clone)]
pub struct UpsertColumn {
    pub name: String,
    pub primary: bool,
    /// 0-based position of the insert value in the parameter list.
    pub insert_pos: usize,
    /// 0-based position of the update value; `None` for primary-key columns
    /// and for tables without a primary key.
    pub update_pos: Option<usize>,
}

/// A prepared upsert: the statement text plus the column-to-position layout
/// so the writer can bind values without re-parsing SQL.
#[derive(Debug, Clone)]
pub struct UpsertSpec {
    pub sql: String,
    pub param_len: usize,
    pub columns: Vec<UpsertColumn>,
}

/// A prepared delete keyed on the primary-key columns, in bind order.
#[derive(Debug, Clone)]
pub struct DeleteSpec {
    pub sql: String,
    pub columns: Vec<String>,
}

/// One row of a query result, values in select-list order.
#[derive(Debug, Clone)]
pub struct SqlRow {
    pub values: Vec<SqlValue>,
}

impl SqlRow {
    fn value(&self, index: usize) -> Result<&SqlValue, DbError> {
        self.values
            .get(index)
            .ok_or_else(|| DbError::Row(format!("no column at index {index}")))
    }

    /// Text at `index`; `None` for NULL. Integers are rendered, so height
    /// and count columns read uniformly across dialects.
    pub fn text(&self, index: usize) -> Result<Option<String>, DbError> {
        match self.value(index)? {
            SqlValue::Null => Ok(None),
            other => Ok(other.as_text()),
        }
    }

    pub fn int(&self, index: usize) -> Result<i64, DbError> {
        match self.value(index)? {
            SqlValue::Int(n) => Ok(*n as i64),
            SqlValue::BigInt(n) => Ok(*n),
            SqlValue::Numeric(s) | SqlValue::Text(s) => s
                .parse()
                .map_err(|_| DbError::Row(format!("column {index} is not an integer: {s:?}"))),
            other => Err(DbError::Row(format!("column {index} is not an integer: {other:?}"))),
        }
    }

    pub fn bool(&self, index: usize) -> Result<bool, DbError> {
        match self.value(index)? {
            SqlValue::Bool(b) => Ok(*b),
            SqlValue::Int(n) => Ok(*n != 0),
            SqlValue::BigInt(n) => Ok(*n != 0),
            other => Err(DbError::Row(format!("column {index} is not a boolean: {other:?}"))),
        }
    }
}

/// Pure query building and type mapping for one SQL dialect.
pub trait SqlDialect: Send + Sync {
    /// Dialect-native type name for a generic column type, including the
    /// length suffix where the dialect wants one.
    fn type_mapping(&self, column: &SqlColumn) -> String;

    /// Make an identifier safe for splicing into SQL text. Identifiers from
    /// specs are already lowercased; this strips anything that is not a
    /// word character.
    fn quote(&self, identifier: &str) -> String {
        identifier.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_').collect()
    }

    /// Table name qualified with the namespace, where the dialect has one.
    fn qualify(&self, table: &str) -> String;

    /// Namespace management; `None` on dialects without schemas.
    fn find_schema_sql(&self) -> Option<String>;
    fn create_schema_sql(&self) -> Option<String>;
    fn drop_schema_sql(&self) -> Option<String>;

    fn create_table_sql(&self, table: &TableSchema) -> String;
    fn upsert_sql(&self, table: &TableSchema) -> UpsertSpec;
    fn delete_sql(&self, table: &TableSchema) -> DeleteSpec;
    fn alter_add_column_sql(&self, table: &str, column: &SqlColumn) -> String;

    /// One bind parameter: the table name. Result row: a truthy value when
    /// the table exists.
    fn find_table_sql(&self) -> String;

    /// One bind parameter: the table name. Result rows:
    /// `(name, generic type, length, primary, order)`.
    fn table_definition_sql(&self) -> String;

    /// Names of the columns that physically exist right now; the ground
    /// truth the synchronizer reconciles against. One bind parameter: the
    /// table name.
    fn live_columns_sql(&self) -> String;

    /// Select the named columns, all cast to text, for rows at one height.
    /// One bind parameter: the height.
    fn select_row_sql(&self, table: &str, columns: &[String]) -> String;

    /// Distinct table names committed at one height. One bind parameter.
    fn select_log_sql(&self) -> String;

    /// Bind parameters: table name, event name, event filter, row count,
    /// height. The timestamp comes from the database clock.
    fn insert_log_sql(&self) -> String;

    /// Bind parameters: table name, column name, column type, length,
    /// primary flag, order. Idempotent on replays.
    fn insert_dictionary_sql(&self) -> String;

    /// Height of the most recent log entry, `'0'` when the log is empty.
    fn last_height_sql(&self) -> String;
}

/// Asynchronous statement execution against one database.
#[async_trait]
pub trait SqlClient: Send + Sync {
    fn dialect(&self) -> &dyn SqlDialect;

    async fn ping(&self) -> Result<(), DbError>;

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError>;

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError>;

    /// Execute every statement inside a single transaction; either all of
    /// them are durable or none.
    async fn execute_transaction(&self, stmts: Vec<SqlStmt>) -> Result<(), DbError>;
}

/// Shared CREATE TABLE body: column definitions in `order`, NOT NULL on key
/// columns, and a named primary-key constraint when any key column exists.
fn create_table_body(dialect: &dyn SqlDialect, table: &TableSchema) -> String {
    let mut columns_def = String::new();
    let mut primary_key = String::new();

    for column in &table.columns {
        let name = dialect.quote(&column.name);
        if !columns_def.is_empty() {
            columns_def.push_str(", ");
        }
        columns_def.push_str(&format!("{} {}", name, dialect.type_mapping(column)));

        if column.primary {
            columns_def.push_str(" NOT NULL");
            if !primary_key.is_empty() {
                primary_key.push_str(", ");
            }
            primary_key.push_str(&name);
        }
    }

    let mut sql = format!("CREATE TABLE {} ({}", dialect.qualify(&table.name), columns_def);
    if !primary_key.is_empty() {
        sql.push_str(&format!(
            ", CONSTRAINT {}_pkey PRIMARY KEY ({})",
            dialect.quote(&table.name),
            primary_key
        ));
    }
    sql.push_str(");");
    sql
}

/// Shared upsert skeleton, parameterized on the dialect's placeholder and
/// conflict-clause syntax. Insert values occupy positions `0..n`; update
/// values for non-key columns follow at `n..`.
fn build_upsert(
    dialect: &dyn SqlDialect,
    table: &TableSchema,
    placeholder: &dyn Fn(usize, SqlColumnType) -> String,
    conflict_clause: &dyn Fn(&TableSchema, &str) -> String,
) -> UpsertSpec {
    let total = table.columns.len();
    let has_pk = table.has_primary_key();

    let mut column_list = String::new();
    let mut insert_values = String::new();
    let mut update_values = String::new();
    let mut columns = Vec::with_capacity(total);
    let mut update_count = 0usize;

    for (i, column) in table.columns.iter().enumerate() {
        let name = dialect.quote(&column.name);
        if !column_list.is_empty() {
            column_list.push_str(", ");
            insert_values.push_str(", ");
        }
        column_list.push_str(&name);
        insert_values.push_str(&placeholder(i + 1, column.sql_type));

        let update_pos = if has_pk && !column.primary {
            let pos = total + update_count;
            update_count += 1;
            if !update_values.is_empty() {
                update_values.push_str(", ");
            }
            update_values.push_str(&format!("{} = {}", name, placeholder(pos + 1, column.sql_type)));
            Some(pos)
        } else {
            None
        };

        columns.push(UpsertColumn {
            name: column.name.clone(),
            primary: column.primary,
            insert_pos: i,
            update_pos,
        });
    }

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ",
        dialect.qualify(&table.name),
        column_list,
        insert_values
    );
    if has_pk {
        sql.push_str(&conflict_clause(table, &update_values));
    } else {
        // No key, nothing can conflict; duplicate deliveries append.
        sql.push_str("ON CONFLICT DO NOTHING");
    }
    sql.push(';');

    UpsertSpec { sql, param_len: total + update_count, columns }
}

fn build_delete(
    dialect: &dyn SqlDialect,
    table: &TableSchema,
    placeholder: &dyn Fn(usize, SqlColumnType) -> String,
) -> DeleteSpec {
    let mut clause = String::new();
    let mut columns = Vec::new();

    for column in table.primary_columns() {
        if !clause.is_empty() {
            clause.push_str(" AND ");
        }
        clause.push_str(&format!(
            "{} = {}",
            dialect.quote(&column.name),
            placeholder(columns.len() + 1, column.sql_type)
        ));
        columns.push(column.name.clone());
    }

    let sql = format!("DELETE FROM {} WHERE {};", dialect.qualify(&table.name), clause);
    DeleteSpec { sql, columns }
}
