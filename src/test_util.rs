#![allow(missing_docs)]

//! Shared helpers for unit tests.

use indexmap::IndexMap;

use crate::config::schema::TableSchema;
use crate::event::ParsedRow;

/// Parse a schema fragment, attach the table name, and validate it.
pub fn schema_from_toml(table: &str, toml: &str) -> TableSchema {
    let mut schema: TableSchema = ::toml::from_str(toml).expect("valid schema TOML");
    schema.table = table.to_string();
    schema.validate().expect("valid schema");
    schema
}

/// A minimal row covering the given byte range of `source`.
pub fn row_for(source: &str, start: u64, end: u64) -> ParsedRow {
    let mut fields = IndexMap::new();
    fields.insert(
        "message".to_string(),
        crate::event::Value::String(format!("{source}:{start}")),
    );
    ParsedRow {
        schema_version: 1,
        fields,
        source_id: source.to_string(),
        start_offset: start,
        end_offset: end,
        warnings: Vec::new(),
    }
}
