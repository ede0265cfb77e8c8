//! Core data model for the pipeline: raw records as read from a source, and
//! the typed rows the parser produces from them.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;

/// Timestamp layout ClickHouse accepts for `DateTime` columns over the HTTP
/// interface.
pub const CLICKHOUSE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single raw record as produced by a source reader.
///
/// Offsets are byte positions into the underlying stream: `start_offset` is
/// where the record begins and `end_offset` is one past its final byte
/// (including the delimiter). A record is immutable once created and is
/// consumed exactly once by the parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawRecord {
    pub source_id: String,
    pub start_offset: u64,
    pub end_offset: u64,
    pub bytes: Bytes,
    pub ingest_timestamp: DateTime<Utc>,
}

/// A typed value destined for a ClickHouse column.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    String(String),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    Bool(bool),
    DateTime(DateTime<Utc>),
    Null,
}

impl Value {
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render the value in the shape the JSONEachRow insert format expects.
    /// `DateTime` is formatted as text since ClickHouse parses it from a
    /// string column-side.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Int64(i) => serde_json::Value::from(*i),
            Value::UInt64(u) => serde_json::Value::from(*u),
            Value::Float64(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::DateTime(ts) => {
                serde_json::Value::String(ts.format(CLICKHOUSE_DATETIME_FORMAT).to_string())
            }
            Value::Null => serde_json::Value::Null,
        }
    }

    /// Rough encoded size used for batch byte accounting. Precise sizing
    /// happens at encode time; this only has to be stable and cheap.
    pub fn size_hint(&self) -> usize {
        match self {
            Value::String(s) => s.len() + 2,
            Value::Int64(_) | Value::UInt64(_) | Value::Float64(_) => 20,
            Value::Bool(_) => 5,
            Value::DateTime(_) => 21,
            Value::Null => 4,
        }
    }
}

/// Non-fatal issues attached to a row during parsing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseWarning {
    /// A multi-line record exceeded the buffering window and was flushed
    /// incomplete.
    TruncatedMultiline,
    /// A coercion error was demoted to null because the column is declared
    /// `nullable_on_error`.
    CoercedToNull { column: String },
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseWarning::TruncatedMultiline => write!(f, "multi-line record truncated"),
            ParseWarning::CoercedToNull { column } => {
                write!(f, "column `{}` coerced to null after type error", column)
            }
        }
    }
}

/// A schema-conformant row, owned by the batcher until flushed.
///
/// `fields` is ordered to match the destination schema's column order. Every
/// required column is present; nullable columns may hold `Value::Null`.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedRow {
    pub schema_version: u32,
    pub fields: IndexMap<String, Value>,
    pub source_id: String,
    pub start_offset: u64,
    pub end_offset: u64,
    pub warnings: Vec<ParseWarning>,
}

impl ParsedRow {
    /// Estimated JSONEachRow-encoded size of this row, used for batch byte
    /// thresholds.
    pub fn size_hint(&self) -> usize {
        let fields: usize = self
            .fields
            .iter()
            .map(|(name, value)| name.len() + 3 + value.size_hint())
            .sum();
        // Braces, separators, and the trailing newline.
        fields + self.fields.len() + 3
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn datetime_renders_in_clickhouse_layout() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap();
        assert_eq!(
            Value::DateTime(ts).to_json(),
            serde_json::json!("2024-05-17 08:30:00")
        );
    }

    #[test]
    fn nan_floats_degrade_to_null() {
        assert_eq!(Value::Float64(f64::NAN).to_json(), serde_json::Value::Null);
    }

    #[test]
    fn row_size_hint_tracks_field_content() {
        let mut fields = IndexMap::new();
        fields.insert("message".to_string(), Value::String("hello".into()));
        let small = ParsedRow {
            schema_version: 1,
            fields: fields.clone(),
            source_id: "s".into(),
            start_offset: 0,
            end_offset: 6,
            warnings: vec![],
        };
        fields.insert("extra".to_string(), Value::String("x".repeat(100)));
        let large = ParsedRow { fields, ..small.clone() };
        assert!(large.size_hint() > small.size_hint() + 100);
    }
}
