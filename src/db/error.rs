use thiserror::Error;

/// Fixed classification of SQL failures. Each dialect adapter maps its
/// driver's codes into this taxonomy; everything above the adapter branches
/// on these kinds, never on driver errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlErrorKind {
    DuplicateSchema,
    DuplicateTable,
    DuplicateColumn,
    UndefinedTable,
    UndefinedColumn,
    InvalidType,
    Generic,
}

impl SqlErrorKind {
    /// Drift between the declared catalog and the live schema, recovered by
    /// re-running synchronization.
    pub fn is_drift(self) -> bool {
        matches!(self, SqlErrorKind::UndefinedTable | SqlErrorKind::UndefinedColumn)
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sql error [{kind:?}]: {message}")]
    Sql { kind: SqlErrorKind, message: String },

    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("pool build error: {0}")]
    Build(#[from] deadpool_postgres::BuildError),

    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("null primary key for column {0}")]
    MissingPrimaryKey(String),

    #[error("table {0} is not part of the catalog")]
    UnknownTable(String),

    #[error("invalid schema for table {table}: {reason}")]
    BadSchema { table: String, reason: String },

    #[error("unexpected result shape: {0}")]
    Row(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl DbError {
    pub fn sql(kind: SqlErrorKind, message: impl Into<String>) -> Self {
        DbError::Sql { kind, message: message.into() }
    }

    pub fn kind(&self) -> Option<SqlErrorKind> {
        match self {
            DbError::Sql { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_drift(&self) -> bool {
        self.kind().map(SqlErrorKind::is_drift).unwrap_or(false)
    }
}
