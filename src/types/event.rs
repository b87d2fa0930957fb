use std::collections::{BTreeMap, HashMap};

use super::SqlValue;

/// Effect of a projected row on its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrudAction {
    Upsert,
    Delete,
}

/// One row produced by one event/binding match, keyed by SQL column name.
/// Upserts must carry every primary-key column; deletes only bind the
/// primary-key columns.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub action: CrudAction,
    pub data: HashMap<String, SqlValue>,
}

impl EventRow {
    pub fn upsert(data: HashMap<String, SqlValue>) -> Self {
        Self { action: CrudAction::Upsert, data }
    }

    pub fn delete(data: HashMap<String, SqlValue>) -> Self {
        Self { action: CrudAction::Delete, data }
    }
}

/// All rows produced by the events of a single source block, committed
/// atomically. Rows preserve emission order within each table; tables are
/// kept sorted by name so commits are deterministic.
#[derive(Debug, Clone)]
pub struct BlockBatch {
    /// Source block height as a string.
    pub height: String,
    pub tables: BTreeMap<String, Vec<EventRow>>,
}

impl BlockBatch {
    pub fn new(height: impl Into<String>) -> Self {
        Self { height: height.into(), tables: BTreeMap::new() }
    }

    pub fn add_row(&mut self, table: &str, row: EventRow) {
        self.tables.entry(table.to_string()).or_default().push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_preserves_row_order() {
        let mut batch = BlockBatch::new("7");
        for i in 0..3 {
            let mut data = HashMap::new();
            data.insert("n".to_string(), SqlValue::Int(i));
            batch.add_row("t", EventRow::upsert(data));
        }
        let rows = &batch.tables["t"];
        let ns: Vec<&SqlValue> = rows.iter().map(|r| &r.data["n"]).collect();
        assert_eq!(ns, vec![&SqlValue::Int(0), &SqlValue::Int(1), &SqlValue::Int(2)]);
        assert_eq!(batch.row_count(), 3);
    }

    #[test]
    fn test_batch_tables_sorted() {
        let mut batch = BlockBatch::new("1");
        batch.add_row("zeta", EventRow::upsert(HashMap::new()));
        batch.add_row("alpha", EventRow::upsert(HashMap::new()));
        let names: Vec<&String> = batch.tables.keys().collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
