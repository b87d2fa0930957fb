use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::types::{system_columns, SqlColumn, TableSchema, RESERVED_COLUMNS};

use super::{map_type, Filter, SpecError};

/// One entry of a spec document, as written by the user. Unknown fields are
/// ignored; required fields are validated explicitly so load failures name
/// what is missing.
#[derive(Debug, Deserialize)]
struct TableSpecDoc {
    #[serde(rename = "TableName", default)]
    table_name: String,
    #[serde(rename = "Filter", default)]
    filter: String,
    #[serde(rename = "Event", default)]
    event: EventDoc,
    #[serde(rename = "Columns", default)]
    columns: HashMap<String, ColumnDoc>,
}

#[derive(Debug, Default, Deserialize)]
struct EventDoc {
    #[serde(default)]
    name: String,
    #[serde(default)]
    inputs: Vec<InputDoc>,
}

#[derive(Debug, Clone, Deserialize)]
struct InputDoc {
    #[serde(default)]
    indexed: bool,
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    signature: String,
}

#[derive(Debug, Deserialize)]
struct ColumnDoc {
    name: String,
    #[serde(default)]
    primary: bool,
    #[serde(rename = "bytesToString", default)]
    bytes_to_string: bool,
}

/// One input of the declared event signature.
#[derive(Debug, Clone)]
pub struct EventInput {
    pub name: String,
    pub evm_type: String,
    pub indexed: bool,
}

/// Routes a decoded event to one projection table: the filter selecting the
/// events, the declared signature used to decode them, and the field to
/// column mapping.
#[derive(Debug, Clone)]
pub struct EventBinding {
    pub event_name: String,
    /// Lowercased target table name.
    pub table_name: String,
    /// Compiled filter predicate; `filter.source()` is the raw string.
    pub filter: Filter,
    pub inputs: Vec<EventInput>,
    /// Event field name to SQL column name.
    pub columns: HashMap<String, String>,
}

/// The validated output of a spec load: table schemas keyed by lowercased
/// table name and bindings keyed by event name. Immutable once built,
/// except that the projection loop may register the raw capture tables.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub schemas: BTreeMap<String, TableSchema>,
    pub bindings: BTreeMap<String, EventBinding>,
}

impl Catalog {
    /// Target table for a declared event name.
    pub fn get_table(&self, event_name: &str) -> Option<&str> {
        self.bindings.get(event_name).map(|b| b.table_name.as_str())
    }

    /// Column an event field maps to.
    pub fn get_column(&self, event_name: &str, field: &str) -> Option<&SqlColumn> {
        let binding = self.bindings.get(event_name)?;
        let sql_name = binding.columns.get(field)?;
        self.schemas.get(&binding.table_name)?.column(sql_name)
    }

    pub fn schema(&self, table: &str) -> Option<&TableSchema> {
        self.schemas.get(table)
    }

    /// Register an internal table (the raw capture tables) in the catalog.
    pub fn insert_schema(&mut self, schema: TableSchema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    /// Render the catalog back into the spec document format. Parsing the
    /// result reproduces this catalog.
    pub fn serialize(&self) -> serde_json::Value {
        let docs: Vec<serde_json::Value> = self
            .bindings
            .values()
            .filter_map(|binding| {
                let schema = self.schemas.get(&binding.table_name)?;
                let inputs: Vec<serde_json::Value> = binding
                    .inputs
                    .iter()
                    .map(|input| {
                        serde_json::json!({
                            "indexed": input.indexed,
                            "name": input.name,
                            "type": input.evm_type,
                        })
                    })
                    .collect();
                let columns: serde_json::Map<String, serde_json::Value> = binding
                    .columns
                    .iter()
                    .filter_map(|(field, column_name)| {
                        let column = schema.column(column_name)?;
                        Some((
                            field.clone(),
                            serde_json::json!({
                                "name": column.name,
                                "primary": column.primary,
                                "bytesToString": column.bytes_to_string,
                            }),
                        ))
                    })
                    .collect();
                Some(serde_json::json!({
                    "TableName": schema.name,
                    "Filter": schema.filter,
                    "Event": {
                        "anonymous": false,
                        "name": binding.event_name,
                        "type": "event",
                        "inputs": inputs,
                    },
                    "Columns": columns,
                }))
            })
            .collect();
        serde_json::Value::Array(docs)
    }
}

/// Parse a spec document from raw bytes.
pub fn parse_bytes(bytes: &[u8]) -> Result<Catalog, SpecError> {
    let docs: Vec<TableSpecDoc> = serde_json::from_slice(bytes)?;
    build(docs)
}

/// Parse a spec document file.
pub fn parse_file(path: &Path) -> Result<Catalog, SpecError> {
    let bytes = fs::read(path)?;
    parse_bytes(&bytes)
}

/// Parse a folder of spec documents: every `.json` file found recursively
/// is merged into one concatenated spec list. Files are visited in sorted
/// path order so repeated loads see the same document sequence.
pub fn parse_folder(folder: &Path) -> Result<Catalog, SpecError> {
    let mut files = Vec::new();
    collect_json_files(folder, &mut files)?;
    files.sort();

    let mut docs = Vec::new();
    for file in files {
        let bytes = fs::read(&file)?;
        let file_docs: Vec<TableSpecDoc> = serde_json::from_slice(&bytes)?;
        docs.extend(file_docs);
    }
    build(docs)
}

fn collect_json_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), SpecError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_json_files(&path, out)?;
        } else if path.extension().map(|e| e == "json").unwrap_or(false) {
            out.push(path);
        }
    }
    Ok(())
}

fn build(docs: Vec<TableSpecDoc>) -> Result<Catalog, SpecError> {
    let mut catalog = Catalog::default();
    let mut seen_tables: HashSet<String> = HashSet::new();

    for doc in docs {
        require(&doc.table_name, &doc.table_name, "TableName")?;
        require(&doc.filter, &doc.table_name, "Filter")?;
        require(&doc.event.name, &doc.table_name, "Event.name")?;
        if doc.event.inputs.is_empty() {
            return Err(SpecError::MissingField {
                table: doc.table_name.clone(),
                field: "Event.inputs",
            });
        }

        let table_name = doc.table_name.to_lowercase();
        if !seen_tables.insert(table_name.clone()) {
            return Err(SpecError::DuplicatedTable(table_name));
        }

        for field in doc.columns.keys() {
            if !doc.event.inputs.iter().any(|input| &input.name == field) {
                return Err(SpecError::UnknownField {
                    table: table_name.clone(),
                    field: field.clone(),
                });
            }
        }

        // System columns first in their fixed order, then the mapped user
        // columns in event input order, so repeated loads of the same spec
        // produce identical DDL.
        let mut columns = system_columns();
        let mut binding_columns = HashMap::new();

        for input in &doc.event.inputs {
            let mapped = doc.columns.get(&input.name);
            let bytes_to_string = mapped.map(|c| c.bytes_to_string).unwrap_or(false);
            let (sql_type, length) = map_type(&input.signature.to_lowercase(), bytes_to_string)?;

            let Some(mapped) = mapped else { continue };
            let sql_name = mapped.name.to_lowercase();
            if RESERVED_COLUMNS.contains(&sql_name.as_str()) {
                return Err(SpecError::ReservedColumn {
                    table: table_name.clone(),
                    column: sql_name,
                });
            }

            let order = columns.len() + 1;
            columns.push(SqlColumn {
                name: sql_name.clone(),
                sql_type,
                length,
                primary: mapped.primary,
                evm_type: input.signature.clone(),
                bytes_to_string: mapped.bytes_to_string,
                order,
            });
            binding_columns.insert(input.name.clone(), sql_name);
        }

        let mut seen_columns: HashSet<&str> = HashSet::new();
        for column in &columns {
            if !seen_columns.insert(&column.name) {
                return Err(SpecError::DuplicatedColumn {
                    table: table_name.clone(),
                    column: column.name.clone(),
                });
            }
        }

        let filter = Filter::parse(&doc.filter)?;

        if catalog.bindings.contains_key(&doc.event.name) {
            return Err(SpecError::BadSchema(format!(
                "event {} is bound more than once",
                doc.event.name
            )));
        }

        catalog.schemas.insert(
            table_name.clone(),
            TableSchema {
                name: table_name.clone(),
                event_name: doc.event.name.clone(),
                filter: doc.filter.clone(),
                columns,
            },
        );
        catalog.bindings.insert(
            doc.event.name.clone(),
            EventBinding {
                event_name: doc.event.name,
                table_name,
                filter,
                inputs: doc
                    .event
                    .inputs
                    .iter()
                    .map(|input| EventInput {
                        name: input.name.clone(),
                        evm_type: input.signature.clone(),
                        indexed: input.indexed,
                    })
                    .collect(),
                columns: binding_columns,
            },
        );
    }

    Ok(catalog)
}

fn require(value: &str, table: &str, field: &'static str) -> Result<(), SpecError> {
    if value.trim().is_empty() {
        return Err(SpecError::MissingField { table: table.to_string(), field });
    }
    Ok(())
}
