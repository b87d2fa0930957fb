use std::fmt;
use std::str::FromStr;

/// Internal table holding one row per committed block, per projection table.
pub const LOG_TABLE: &str = "_vent_log";
/// Internal table describing every column this process has created.
pub const DICTIONARY_TABLE: &str = "_vent_dictionary";
/// Optional raw capture table for block headers.
pub const BLOCK_TABLE: &str = "_vent_block";
/// Optional raw capture table for transactions.
pub const TX_TABLE: &str = "_vent_tx";

// Fixed column names used by the internal tables and the system columns.
pub const COL_ID: &str = "_id";
pub const COL_TIMESTAMP: &str = "_timestamp";
pub const COL_TABLE_NAME: &str = "_tablename";
pub const COL_EVENT_NAME: &str = "_eventname";
pub const COL_EVENT_FILTER: &str = "_eventfilter";
pub const COL_ROW_COUNT: &str = "_rowcount";
pub const COL_HEIGHT: &str = "_height";
pub const COL_TX_HASH: &str = "_txhash";
pub const COL_EVENT_TYPE: &str = "_eventtype";

// Dictionary columns.
pub const COL_COLUMN_NAME: &str = "_columnname";
pub const COL_COLUMN_TYPE: &str = "_columntype";
pub const COL_COLUMN_LENGTH: &str = "_columnlength";
pub const COL_PRIMARY_KEY: &str = "_primarykey";
pub const COL_COLUMN_ORDER: &str = "_columnorder";

// Raw capture columns.
pub const COL_INDEX: &str = "_index";
pub const COL_BLOCK_HEADER: &str = "_blockheader";
pub const COL_TX_TYPE: &str = "_txtype";
pub const COL_ENVELOPE: &str = "_envelope";
pub const COL_EVENTS: &str = "_events";
pub const COL_RESULT: &str = "_result";
pub const COL_RECEIPT: &str = "_receipt";
pub const COL_EXCEPTION: &str = "_exception";

/// Column names a table spec may not map user data onto.
pub const RESERVED_COLUMNS: &[&str] = &[
    COL_ID,
    COL_TIMESTAMP,
    COL_HEIGHT,
    COL_TX_HASH,
    COL_EVENT_TYPE,
    COL_EVENT_NAME,
    COL_EVENT_FILTER,
    COL_TABLE_NAME,
    COL_ROW_COUNT,
    "_action",
    COL_INDEX,
    COL_BLOCK_HEADER,
    COL_TX_TYPE,
    COL_ENVELOPE,
    COL_EVENTS,
    COL_RESULT,
    COL_RECEIPT,
    COL_EXCEPTION,
];

/// Generic SQL column types; each dialect adapter maps these to its own
/// type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlColumnType {
    Bool,
    ByteA,
    Int,
    Numeric,
    Text,
    Varchar,
    Timestamp,
    Serial,
}

impl SqlColumnType {
    pub fn is_numeric(self) -> bool {
        matches!(self, SqlColumnType::Int | SqlColumnType::Numeric | SqlColumnType::Serial)
    }
}

impl fmt::Display for SqlColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlColumnType::Bool => "BOOL",
            SqlColumnType::ByteA => "BYTEA",
            SqlColumnType::Int => "INT",
            SqlColumnType::Numeric => "NUMERIC",
            SqlColumnType::Text => "TEXT",
            SqlColumnType::Varchar => "VARCHAR",
            SqlColumnType::Timestamp => "TIMESTAMP",
            SqlColumnType::Serial => "SERIAL",
        };
        f.write_str(name)
    }
}

impl FromStr for SqlColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BOOL" => Ok(SqlColumnType::Bool),
            "BYTEA" => Ok(SqlColumnType::ByteA),
            "INT" => Ok(SqlColumnType::Int),
            "NUMERIC" => Ok(SqlColumnType::Numeric),
            "TEXT" => Ok(SqlColumnType::Text),
            "VARCHAR" => Ok(SqlColumnType::Varchar),
            "TIMESTAMP" => Ok(SqlColumnType::Timestamp),
            "SERIAL" => Ok(SqlColumnType::Serial),
            other => Err(format!("unknown column type {other}")),
        }
    }
}

/// One column of an effective SQL table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlColumn {
    /// Lowercased SQL column name.
    pub name: String,
    pub sql_type: SqlColumnType,
    /// Length for VARCHAR columns, 0 otherwise.
    pub length: usize,
    pub primary: bool,
    /// Source event input type signature; empty for system and internal columns.
    pub evm_type: String,
    pub bytes_to_string: bool,
    /// 1-based, dense position used as the physical column order.
    pub order: usize,
}

impl SqlColumn {
    pub fn new(
        name: &str,
        sql_type: SqlColumnType,
        length: usize,
        primary: bool,
        order: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            sql_type,
            length,
            primary,
            evm_type: String::new(),
            bytes_to_string: false,
            order,
        }
    }
}

/// The effective structure of one SQL table: user columns plus the fixed
/// system columns, sorted by `order`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Lowercased table name.
    pub name: String,
    /// Declared event name routed to this table; empty for internal tables.
    pub event_name: String,
    /// Filter string of the binding; empty for internal tables.
    pub filter: String,
    pub columns: Vec<SqlColumn>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&SqlColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_columns(&self) -> impl Iterator<Item = &SqlColumn> {
        self.columns.iter().filter(|c| c.primary)
    }

    pub fn has_primary_key(&self) -> bool {
        self.columns.iter().any(|c| c.primary)
    }
}

/// The fixed column prefix present on every projection table.
pub fn system_columns() -> Vec<SqlColumn> {
    vec![
        SqlColumn::new(COL_HEIGHT, SqlColumnType::Varchar, 100, false, 1),
        SqlColumn::new(COL_TX_HASH, SqlColumnType::Varchar, 40, false, 2),
        SqlColumn::new(COL_EVENT_TYPE, SqlColumnType::Varchar, 100, false, 3),
        SqlColumn::new(COL_EVENT_NAME, SqlColumnType::Varchar, 100, false, 4),
    ]
}

/// Structure of the `_vent_log` progress table.
pub fn log_table() -> TableSchema {
    TableSchema {
        name: LOG_TABLE.to_string(),
        event_name: String::new(),
        filter: String::new(),
        columns: vec![
            SqlColumn::new(COL_ID, SqlColumnType::Serial, 0, true, 1),
            SqlColumn::new(COL_TIMESTAMP, SqlColumnType::Timestamp, 0, false, 2),
            SqlColumn::new(COL_TABLE_NAME, SqlColumnType::Varchar, 100, false, 3),
            SqlColumn::new(COL_EVENT_NAME, SqlColumnType::Varchar, 100, false, 4),
            SqlColumn::new(COL_EVENT_FILTER, SqlColumnType::Varchar, 100, false, 5),
            SqlColumn::new(COL_ROW_COUNT, SqlColumnType::Int, 0, false, 6),
            SqlColumn::new(COL_HEIGHT, SqlColumnType::Varchar, 100, false, 7),
        ],
    }
}

/// Structure of the `_vent_dictionary` schema dictionary.
pub fn dictionary_table() -> TableSchema {
    TableSchema {
        name: DICTIONARY_TABLE.to_string(),
        event_name: String::new(),
        filter: String::new(),
        columns: vec![
            SqlColumn::new(COL_TABLE_NAME, SqlColumnType::Varchar, 100, true, 1),
            SqlColumn::new(COL_COLUMN_NAME, SqlColumnType::Varchar, 100, true, 2),
            SqlColumn::new(COL_COLUMN_TYPE, SqlColumnType::Varchar, 100, false, 3),
            SqlColumn::new(COL_COLUMN_LENGTH, SqlColumnType::Int, 0, false, 4),
            SqlColumn::new(COL_PRIMARY_KEY, SqlColumnType::Int, 0, false, 5),
            SqlColumn::new(COL_COLUMN_ORDER, SqlColumnType::Int, 0, false, 6),
        ],
    }
}

/// Structure of the optional `_vent_block` raw capture table.
pub fn block_capture_table() -> TableSchema {
    TableSchema {
        name: BLOCK_TABLE.to_string(),
        event_name: String::new(),
        filter: String::new(),
        columns: vec![
            SqlColumn::new(COL_HEIGHT, SqlColumnType::Varchar, 100, true, 1),
            SqlColumn::new(COL_BLOCK_HEADER, SqlColumnType::Text, 0, false, 2),
        ],
    }
}

/// Structure of the optional `_vent_tx` raw capture table.
pub fn tx_capture_table() -> TableSchema {
    TableSchema {
        name: TX_TABLE.to_string(),
        event_name: String::new(),
        filter: String::new(),
        columns: vec![
            SqlColumn::new(COL_HEIGHT, SqlColumnType::Varchar, 100, true, 1),
            SqlColumn::new(COL_TX_HASH, SqlColumnType::Varchar, 40, true, 2),
            SqlColumn::new(COL_INDEX, SqlColumnType::Int, 0, false, 3),
            SqlColumn::new(COL_TX_TYPE, SqlColumnType::Varchar, 100, false, 4),
            SqlColumn::new(COL_ENVELOPE, SqlColumnType::Text, 0, false, 5),
            SqlColumn::new(COL_EVENTS, SqlColumnType::Text, 0, false, 6),
            SqlColumn::new(COL_RESULT, SqlColumnType::Text, 0, false, 7),
            SqlColumn::new(COL_RECEIPT, SqlColumnType::Text, 0, false, 8),
            SqlColumn::new(COL_EXCEPTION, SqlColumnType::Text, 0, false, 9),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_columns_fixed_order() {
        let cols = system_columns();
        let names: Vec<&str> = cols.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec![COL_HEIGHT, COL_TX_HASH, COL_EVENT_TYPE, COL_EVENT_NAME]);
        for (i, col) in cols.iter().enumerate() {
            assert_eq!(col.order, i + 1);
            assert!(!col.primary);
        }
        assert_eq!(cols[0].length, 100);
        assert_eq!(cols[1].length, 40);
    }

    #[test]
    fn test_column_type_round_trip() {
        for t in [
            SqlColumnType::Bool,
            SqlColumnType::ByteA,
            SqlColumnType::Int,
            SqlColumnType::Numeric,
            SqlColumnType::Text,
            SqlColumnType::Varchar,
            SqlColumnType::Timestamp,
            SqlColumnType::Serial,
        ] {
            assert_eq!(t.to_string().parse::<SqlColumnType>().unwrap(), t);
        }
        assert!("VARCHAR2".parse::<SqlColumnType>().is_err());
    }

    #[test]
    fn test_reserved_columns_cover_internal_tables() {
        for table in [log_table(), block_capture_table(), tx_capture_table()] {
            for col in &table.columns {
                assert!(
                    RESERVED_COLUMNS.contains(&col.name.as_str()),
                    "{} is not reserved",
                    col.name
                );
            }
        }
    }
}
