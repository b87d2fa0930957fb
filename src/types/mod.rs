mod event;
mod schema;
mod value;

pub use event::{BlockBatch, CrudAction, EventRow};
pub use schema::{
    block_capture_table, dictionary_table, log_table, system_columns, SqlColumn, SqlColumnType,
    TableSchema, tx_capture_table, BLOCK_TABLE, COL_BLOCK_HEADER, COL_COLUMN_LENGTH,
    COL_COLUMN_NAME, COL_COLUMN_ORDER, COL_COLUMN_TYPE, COL_ENVELOPE, COL_EVENTS,
    COL_EVENT_FILTER, COL_EVENT_NAME, COL_EVENT_TYPE, COL_EXCEPTION, COL_HEIGHT, COL_ID,
    COL_INDEX, COL_PRIMARY_KEY, COL_RECEIPT, COL_RESULT, COL_ROW_COUNT, COL_TABLE_NAME,
    COL_TIMESTAMP, COL_TX_HASH, COL_TX_TYPE, DICTIONARY_TABLE, LOG_TABLE, RESERVED_COLUMNS,
    TX_TABLE,
};
pub use value::SqlValue;
