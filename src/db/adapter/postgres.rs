use async_trait::async_trait;
use bytes::BytesMut;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::types::{IsNull, ToSql, Type};
use tokio_postgres::NoTls;

use crate::types::{SqlColumn, SqlColumnType, SqlValue, TableSchema, LOG_TABLE};

use super::super::error::{DbError, SqlErrorKind};
use super::{
    build_delete, build_upsert, create_table_body, DeleteSpec, SqlClient, SqlDialect, SqlRow,
    SqlStmt, UpsertSpec,
};

// PostgreSQL error codes the classifier recognizes.
const ERR_DUP_SCHEMA: &str = "42P06";
const ERR_DUP_TABLE: &str = "42P07";
const ERR_DUP_COLUMN: &str = "42701";
const ERR_UNDEFINED_TABLE: &str = "42P01";
const ERR_UNDEFINED_COLUMN: &str = "42703";
const ERR_INVALID_TYPE: &str = "42704";

/// Query builder for PostgreSQL. All objects live in a configurable schema.
#[derive(Debug, Clone)]
pub struct PostgresDialect {
    schema: String,
}

impl PostgresDialect {
    pub fn new(schema: impl Into<String>) -> Self {
        Self { schema: schema.into() }
    }

    fn placeholder(position: usize, sql_type: SqlColumnType) -> String {
        // The binary protocol will not coerce a text parameter into a
        // numeric column, so big integers are cast server-side.
        if sql_type == SqlColumnType::Numeric {
            format!("CAST(${position} AS NUMERIC)")
        } else {
            format!("${position}")
        }
    }
}

impl SqlDialect for PostgresDialect {
    fn type_mapping(&self, column: &SqlColumn) -> String {
        match column.sql_type {
            SqlColumnType::Bool => "BOOLEAN".to_string(),
            SqlColumnType::ByteA => "BYTEA".to_string(),
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
            SqlColumnType::Serial => "SERIAL".to_string(),
        }
    }

    fn qualify(&self, table: &str) -> String {
        format!("{}.{}", self.schema, self.quote(table))
    }

    fn find_schema_sql(&self) -> Option<String> {
        Some(format!(
            "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace n WHERE n.nspname = '{}');",
            self.schema
        ))
    }

    fn create_schema_sql(&self) -> Option<String> {
        Some(format!("CREATE SCHEMA {};", self.schema))
    }

    fn drop_schema_sql(&self) -> Option<String> {
        Some(format!("DROP SCHEMA {} CASCADE;", self.schema))
    }

    fn create_table_sql(&self, table: &TableSchema) -> String {
        create_table_body(self, table)
    }

    fn upsert_sql(&self, table: &TableSchema) -> UpsertSpec {
        build_upsert(self, table, &Self::placeholder, &|table, updates| {
            if updates.is_empty() {
                format!("ON CONFLICT ON CONSTRAINT {}_pkey DO NOTHING", table.name)
            } else {
                format!("ON CONFLICT ON CONSTRAINT {}_pkey DO UPDATE SET {}", table.name, updates)
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
        format!(
            "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_class c \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = '{}' AND c.relname = $1 AND c.relkind = 'r');",
            self.schema
        )
    }

    fn table_definition_sql(&self) -> String {
        format!(
            "SELECT c.column_name, \
             (CASE WHEN c.data_type = 'integer' THEN 'INT' \
                   WHEN c.data_type = 'boolean' THEN 'BOOL' \
                   WHEN c.data_type = 'bytea' THEN 'BYTEA' \
                   WHEN c.data_type = 'text' THEN 'TEXT' \
                   WHEN c.data_type = 'numeric' THEN 'NUMERIC' \
                   WHEN c.udt_name = 'timestamp' THEN 'TIMESTAMP' \
                   WHEN c.udt_name = 'varchar' THEN 'VARCHAR' \
                   ELSE c.udt_name END), \
             COALESCE(c.character_maximum_length, 0), \
             (CASE WHEN c.is_nullable = 'NO' THEN true ELSE false END), \
             c.ordinal_position \
             FROM information_schema.columns c \
             WHERE c.table_schema = '{}' AND c.table_name = $1 \
             ORDER BY c.ordinal_position;",
            self.schema
        )
    }

    fn live_columns_sql(&self) -> String {
        format!(
            "SELECT c.column_name FROM information_schema.columns c \
             WHERE c.table_schema = '{}' AND c.table_name = $1 \
             ORDER BY c.ordinal_position;",
            self.schema
        )
    }

    fn select_row_sql(&self, table: &str, columns: &[String]) -> String {
        let fields = columns
            .iter()
            .map(|c| format!("CAST({} AS TEXT)", self.quote(c)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("SELECT {} FROM {} WHERE _height = $1;", fields, self.qualify(table))
    }

    fn select_log_sql(&self) -> String {
        format!(
            "SELECT DISTINCT _tablename FROM {} WHERE _height = $1;",
            self.qualify(LOG_TABLE)
        )
    }

    fn insert_log_sql(&self) -> String {
        format!(
            "INSERT INTO {} (_timestamp, _tablename, _eventname, _eventfilter, _rowcount, _height) \
             VALUES (CURRENT_TIMESTAMP, $1, $2, $3, $4, $5);",
            self.qualify(LOG_TABLE)
        )
    }

    fn insert_dictionary_sql(&self) -> String {
        format!(
            "INSERT INTO {} (_tablename, _columnname, _columntype, _columnlength, _primarykey, _columnorder) \
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING;",
            self.qualify(crate::types::DICTIONARY_TABLE)
        )
    }

    fn last_height_sql(&self) -> String {
        let log = self.qualify(LOG_TABLE);
        format!(
            "WITH ll AS (SELECT MAX(_id) AS _id FROM {log}) \
             SELECT COALESCE(l._height, '0') FROM ll LEFT OUTER JOIN {log} l ON ll._id = l._id;"
        )
    }
}

/// Bind-value wrapper so heterogeneous parameters share one `ToSql` type.
#[derive(Debug)]
enum SqlParam {
    Null,
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl ToSql for SqlParam {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlParam::Null => Ok(IsNull::Yes),
            SqlParam::Bool(v) => v.to_sql(ty, out),
            SqlParam::Int(v) => v.to_sql(ty, out),
            SqlParam::BigInt(v) => v.to_sql(ty, out),
            SqlParam::Text(v) => v.to_sql(ty, out),
            SqlParam::Bytes(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        <bool as ToSql>::accepts(ty)
            || <i32 as ToSql>::accepts(ty)
            || <i64 as ToSql>::accepts(ty)
            || <String as ToSql>::accepts(ty)
            || <Vec<u8> as ToSql>::accepts(ty)
    }

    tokio_postgres::types::to_sql_checked!();
}

fn convert_params(values: &[SqlValue]) -> Vec<SqlParam> {
    values
        .iter()
        .map(|value| match value {
            SqlValue::Null => SqlParam::Null,
            SqlValue::Bool(v) => SqlParam::Bool(*v),
            SqlValue::Int(v) => SqlParam::Int(*v),
            SqlValue::BigInt(v) => SqlParam::BigInt(*v),
            // NUMERIC parameters travel as text behind a server-side cast.
            SqlValue::Numeric(v) => SqlParam::Text(v.clone()),
            SqlValue::Text(v) => SqlParam::Text(v.clone()),
            SqlValue::Bytes(v) => SqlParam::Bytes(v.clone()),
        })
        .collect()
}

fn convert_row(row: &tokio_postgres::Row) -> Result<SqlRow, DbError> {
    let mut values = Vec::with_capacity(row.columns().len());
    for (i, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::BOOL => row
                .try_get::<_, Option<bool>>(i)
                .map(|v| v.map(SqlValue::Bool))
                .map_err(row_err)?,
            Type::INT2 => row
                .try_get::<_, Option<i16>>(i)
                .map(|v| v.map(|n| SqlValue::Int(n as i32)))
                .map_err(row_err)?,
            Type::INT4 => row
                .try_get::<_, Option<i32>>(i)
                .map(|v| v.map(SqlValue::Int))
                .map_err(row_err)?,
            Type::INT8 => row
                .try_get::<_, Option<i64>>(i)
                .map(|v| v.map(SqlValue::BigInt))
                .map_err(row_err)?,
            Type::BYTEA => row
                .try_get::<_, Option<Vec<u8>>>(i)
                .map(|v| v.map(SqlValue::Bytes))
                .map_err(row_err)?,
            _ => row
                .try_get::<_, Option<String>>(i)
                .map(|v| v.map(SqlValue::Text))
                .map_err(row_err)?,
        };
        values.push(value.unwrap_or(SqlValue::Null));
    }
    Ok(SqlRow { values })
}

fn row_err(e: tokio_postgres::Error) -> DbError {
    DbError::Row(e.to_string())
}

impl From<tokio_postgres::Error> for DbError {
    fn from(e: tokio_postgres::Error) -> Self {
        let kind = match e.as_db_error().map(|db| db.code().code()) {
            Some(ERR_DUP_SCHEMA) => SqlErrorKind::DuplicateSchema,
            Some(ERR_DUP_TABLE) => SqlErrorKind::DuplicateTable,
            Some(ERR_DUP_COLUMN) => SqlErrorKind::DuplicateColumn,
            Some(ERR_UNDEFINED_TABLE) => SqlErrorKind::UndefinedTable,
            Some(ERR_UNDEFINED_COLUMN) => SqlErrorKind::UndefinedColumn,
            Some(ERR_INVALID_TYPE) => SqlErrorKind::InvalidType,
            _ => SqlErrorKind::Generic,
        };
        DbError::Sql { kind, message: format_pg_error(&e) }
    }
}

fn format_pg_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_err) = e.as_db_error() {
        let mut msg = format!("[{}] {}", db_err.code().code(), db_err.message());
        if let Some(detail) = db_err.detail() {
            msg.push_str(&format!("; detail: {detail}"));
        }
        if let Some(table) = db_err.table() {
            msg.push_str(&format!("; table: {table}"));
        }
        if let Some(column) = db_err.column() {
            msg.push_str(&format!("; column: {column}"));
        }
        msg
    } else {
        e.to_string()
    }
}

/// Pooled PostgreSQL client.
pub struct PostgresClient {
    pool: Pool,
    dialect: PostgresDialect,
}

impl PostgresClient {
    pub async fn connect(database_url: &str, schema: &str) -> Result<Self, DbError> {
        let config = database_url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| DbError::InvalidConnectionString(e.to_string()))?;

        let manager_config = ManagerConfig { recycling_method: RecyclingMethod::Fast };
        let manager = Manager::from_config(config, NoTls, manager_config);

        let pool = Pool::builder(manager).max_size(16).runtime(Runtime::Tokio1).build()?;

        // Fail fast if the database is unreachable.
        let _conn = pool.get().await?;
        tracing::info!(schema, "connected to postgres");

        Ok(Self { pool, dialect: PostgresDialect::new(schema) })
    }
}

#[async_trait]
impl SqlClient for PostgresClient {
    fn dialect(&self) -> &dyn SqlDialect {
        &self.dialect
    }

    async fn ping(&self) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        client.execute("SELECT 1;", &[]).await?;
        Ok(())
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        let client = self.pool.get().await?;
        let converted = convert_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> =
            converted.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        Ok(client.execute(sql, &refs[..]).await?)
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        let client = self.pool.get().await?;
        let converted = convert_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> =
            converted.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = client.query(sql, &refs[..]).await?;
        rows.iter().map(convert_row).collect()
    }

    async fn execute_transaction(&self, stmts: Vec<SqlStmt>) -> Result<(), DbError> {
        if stmts.is_empty() {
            return Ok(());
        }

        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;

        for stmt in &stmts {
            let converted = convert_params(&stmt.params);
            let refs: Vec<&(dyn ToSql + Sync)> =
                converted.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            if let Err(e) = transaction.execute(&stmt.sql, &refs[..]).await {
                tracing::debug!(sql = %stmt.sql, error = %e, "statement failed, rolling back");
                return Err(e.into());
            }
        }

        transaction.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::types::{log_table, system_columns, SqlColumn, SqlColumnType, TableSchema};

    use super::*;

    fn sample_table() -> TableSchema {
        let mut columns = system_columns();
        let mut key = SqlColumn::new("testkey", SqlColumnType::Numeric, 0, true, 5);
        key.evm_type = "uint256".to_string();
        columns.push(key);
        columns.push(SqlColumn::new("testdescription", SqlColumnType::Text, 0, false, 6));
        TableSchema {
            name: "eventtest".to_string(),
            event_name: "UpdateTestEvents".to_string(),
            filter: "EventType = 'LogEvent'".to_string(),
            columns,
        }
    }

    #[test]
    fn test_create_table_sql() {
        let dialect = PostgresDialect::new("vent");
        let sql = dialect.create_table_sql(&sample_table());
        assert_eq!(
            sql,
            "CREATE TABLE vent.eventtest (_height VARCHAR(100), _txhash VARCHAR(40), \
             _eventtype VARCHAR(100), _eventname VARCHAR(100), testkey NUMERIC NOT NULL, \
             testdescription TEXT, CONSTRAINT eventtest_pkey PRIMARY KEY (testkey));"
        );
    }

    #[test]
    fn test_upsert_layout() {
        let dialect = PostgresDialect::new("vent");
        let spec = dialect.upsert_sql(&sample_table());

        // 6 insert positions plus 5 update positions for the non-key columns.
        assert_eq!(spec.param_len, 11);
        assert!(spec.sql.contains("ON CONFLICT ON CONSTRAINT eventtest_pkey DO UPDATE SET"));
        assert!(spec.sql.contains("CAST($5 AS NUMERIC)"));

        let key = spec.columns.iter().find(|c| c.name == "testkey").unwrap();
        assert!(key.primary);
        assert_eq!(key.insert_pos, 4);
        assert_eq!(key.update_pos, None);

        let height = spec.columns.iter().find(|c| c.name == "_height").unwrap();
        assert_eq!(height.insert_pos, 0);
        assert_eq!(height.update_pos, Some(6));

        let desc = spec.columns.iter().find(|c| c.name == "testdescription").unwrap();
        assert_eq!(desc.insert_pos, 5);
        assert_eq!(desc.update_pos, Some(10));
    }

    #[test]
    fn test_upsert_without_primary_key_appends() {
        let dialect = PostgresDialect::new("vent");
        let mut table = sample_table();
        for column in &mut table.columns {
            column.primary = false;
        }
        let spec = dialect.upsert_sql(&table);
        assert!(spec.sql.ends_with("ON CONFLICT DO NOTHING;"));
        assert_eq!(spec.param_len, table.columns.len());
        assert!(spec.columns.iter().all(|c| c.update_pos.is_none()));
    }

    #[test]
    fn test_delete_sql_binds_primary_keys() {
        let dialect = PostgresDialect::new("vent");
        let spec = dialect.delete_sql(&sample_table());
        assert_eq!(spec.sql, "DELETE FROM vent.eventtest WHERE testkey = CAST($1 AS NUMERIC);");
        assert_eq!(spec.columns, vec!["testkey".to_string()]);
    }

    #[test]
    fn test_alter_add_column_names_the_column() {
        let dialect = PostgresDialect::new("vent");
        let column = SqlColumn::new("newcol", SqlColumnType::Varchar, 100, false, 7);
        let sql = dialect.alter_add_column_sql("eventtest", &column);
        assert_eq!(sql, "ALTER TABLE vent.eventtest ADD COLUMN newcol VARCHAR(100);");
    }

    #[test]
    fn test_quote_strips_unsafe_characters() {
        let dialect = PostgresDialect::new("vent");
        assert_eq!(dialect.quote("evil; drop--"), "evildrop");
        assert_eq!(dialect.quote("_height"), "_height");
    }

    #[test]
    fn test_log_table_ddl_uses_serial_key() {
        let dialect = PostgresDialect::new("vent");
        let sql = dialect.create_table_sql(&log_table());
        assert!(sql.starts_with("CREATE TABLE vent._vent_log (_id SERIAL NOT NULL"));
        assert!(sql.contains("CONSTRAINT _vent_log_pkey PRIMARY KEY (_id)"));
    }

    #[test]
    fn test_last_height_defaults_to_zero() {
        let dialect = PostgresDialect::new("vent");
        let sql = dialect.last_height_sql();
        assert!(sql.contains("COALESCE(l._height, '0')"));
        assert!(sql.contains("MAX(_id)"));
    }

    #[test]
    fn test_select_row_casts_to_text() {
        let dialect = PostgresDialect::new("vent");
        let sql = dialect
            .select_row_sql("eventtest", &["_height".to_string(), "testkey".to_string()]);
        assert_eq!(
            sql,
            "SELECT CAST(_height AS TEXT), CAST(testkey AS TEXT) FROM vent.eventtest \
             WHERE _height = $1;"
        );
    }
}
