//! Schema/ABI binding layer: parses declarative table specs, validates them
//! against the event input types and produces the catalog of SQL table
//! schemas plus the event-to-table bindings the projection loop routes on.

mod filter;
mod parser;
mod type_map;

use thiserror::Error;

pub use filter::{Filter, TagMap};
pub use parser::{parse_bytes, parse_file, parse_folder, Catalog, EventBinding, EventInput};
pub use type_map::map_type;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("error parsing spec document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("error reading spec document: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing or empty field {field} in table spec {table:?}")]
    MissingField { table: String, field: &'static str },

    #[error("duplicated table name: {0}")]
    DuplicatedTable(String),

    #[error("column mapping in table {table} references unknown event field {field}")]
    UnknownField { table: String, field: String },

    #[error("don't know how to map type signature: {0}")]
    UnknownType(String),

    #[error("duplicated column name {column} in table {table}")]
    DuplicatedColumn { table: String, column: String },

    #[error("column name {column} in table {table} is reserved")]
    ReservedColumn { table: String, column: String },

    #[error("invalid filter {filter:?}: {reason}")]
    BadFilter { filter: String, reason: String },

    #[error("invalid schema: {0}")]
    BadSchema(String),
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Spec documents shared by the parser, writer and projection tests.

    pub const GOOD_SPEC: &str = r#"[
        {
            "TableName": "UserAccounts",
            "Filter": "LOG0 = 'UserAccounts'",
            "Event": {
                "anonymous": false,
                "inputs": [
                    {"indexed": false, "name": "userName", "type": "string"},
                    {"indexed": false, "name": "userAddress", "type": "address"},
                    {"indexed": false, "name": "userBool", "type": "bool"},
                    {"indexed": false, "name": "userId", "type": "uint"}
                ],
                "name": "UpdateUserAccount",
                "type": "event"
            },
            "Columns": {
                "userAddress": {"name": "address", "primary": true},
                "userName": {"name": "username", "primary": false},
                "userId": {"name": "userid", "primary": false},
                "userBool": {"name": "userbool", "primary": false}
            }
        },
        {
            "TableName": "TEST_TABLE",
            "Filter": "Log1Text = 'EVENT_TEST'",
            "Event": {
                "anonymous": false,
                "inputs": [
                    {"indexed": true, "name": "name", "type": "string"},
                    {"indexed": false, "name": "key", "type": "uint256"},
                    {"indexed": false, "name": "blocknum", "type": "uint256"},
                    {"indexed": false, "name": "somestr", "type": "string"},
                    {"indexed": false, "name": "this", "type": "address"},
                    {"indexed": false, "name": "instance", "type": "uint256"}
                ],
                "name": "UpdateTable",
                "type": "event"
            },
            "Columns": {
                "key": {"name": "Index", "primary": true},
                "blocknum": {"name": "Block", "primary": false},
                "somestr": {"name": "String", "primary": false},
                "instance": {"name": "Instance", "primary": false}
            }
        }
    ]"#;

    pub const EVENT_TEST_SPEC: &str = r#"[
        {
            "TableName": "EventTest",
            "Filter": "EventType = 'LogEvent'",
            "Event": {
                "anonymous": false,
                "inputs": [
                    {"indexed": false, "name": "key", "type": "uint256"},
                    {"indexed": false, "name": "description", "type": "string"}
                ],
                "name": "UpdateTestEvents",
                "type": "event"
            },
            "Columns": {
                "key": {"name": "testkey", "primary": true},
                "description": {"name": "testdescription", "primary": false}
            }
        }
    ]"#;

    pub const DUPLICATED_TABLE_SPEC: &str = r#"[
        {
            "TableName": "DUPLICATED",
            "Filter": "LOG0 = 'UserAccounts'",
            "Event": {
                "inputs": [{"indexed": false, "name": "userName", "type": "string"}],
                "name": "UpdateUserAccount",
                "type": "event"
            },
            "Columns": {"userName": {"name": "username", "primary": true}}
        },
        {
            "TableName": "duplicated",
            "Filter": "Log1Text = 'EVENT_TEST'",
            "Event": {
                "inputs": [{"indexed": false, "name": "key", "type": "uint256"}],
                "name": "UpdateTable",
                "type": "event"
            },
            "Columns": {"key": {"name": "Index", "primary": true}}
        }
    ]"#;

    pub const UNKNOWN_TYPE_SPEC: &str = r#"[
        {
            "TableName": "UserAccounts",
            "Filter": "LOG0 = 'UserAccounts'",
            "Event": {
                "inputs": [
                    {"indexed": false, "name": "userName", "type": "typeunknown"},
                    {"indexed": false, "name": "userAddress", "type": "address"}
                ],
                "name": "UpdateUserAccount",
                "type": "event"
            },
            "Columns": {
                "userAddress": {"name": "address", "primary": true},
                "userName": {"name": "username", "primary": false}
            }
        }
    ]"#;

    pub const DUPLICATED_COLUMN_SPEC: &str = r#"[
        {
            "TableName": "DUPLICATED_COLUMN",
            "Filter": "LOG0 = 'UserAccounts'",
            "Event": {
                "inputs": [
                    {"indexed": false, "name": "userName", "type": "string"},
                    {"indexed": false, "name": "userAddress", "type": "address"}
                ],
                "name": "UpdateUserAccount",
                "type": "event"
            },
            "Columns": {
                "userAddress": {"name": "duplicated", "primary": true},
                "userName": {"name": "Duplicated", "primary": false}
            }
        }
    ]"#;

    pub const MISSING_FIELDS_SPEC: &str = r#"[
        {
            "TableName": "UserAccounts",
            "Event": {
                "inputs": [{"indexed": false, "name": "userName", "type": "string"}],
                "type": "event"
            },
            "Columns": {"userName": {"name": "username", "primary": true}}
        }
    ]"#;

    pub const RESERVED_COLUMN_SPEC: &str = r#"[
        {
            "TableName": "UserAccounts",
            "Filter": "LOG0 = 'UserAccounts'",
            "Event": {
                "inputs": [{"indexed": false, "name": "userName", "type": "string"}],
                "name": "UpdateUserAccount",
                "type": "event"
            },
            "Columns": {"userName": {"name": "_height", "primary": true}}
        }
    ]"#;
}
