//! Type coercion from raw grammar fields into schema column types.
//!
//! Coercion fails closed: an unparseable value is an error, never a silent
//! null. The normalizer decides whether an error demotes the row or only the
//! column (`nullable_on_error`).

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use snafu::Snafu;

use crate::config::schema::{Column, ColumnType};
use crate::event::{Value, CLICKHOUSE_DATETIME_FORMAT};

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum CoerceError {
    #[snafu(display(
        "column `{}`: cannot coerce {} to {}",
        column,
        found,
        expected
    ))]
    Incompatible {
        column: String,
        expected: &'static str,
        found: String,
    },
    #[snafu(display(
        "column `{}`: cannot parse {:?} as a timestamp",
        column,
        input
    ))]
    BadTimestamp { column: String, input: String },
}

fn incompatible(column: &Column, raw: &serde_json::Value) -> CoerceError {
    let found = match raw {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    };
    CoerceError::Incompatible {
        column: column.name.clone(),
        expected: column.ty.as_str(),
        found: found.to_string(),
    }
}

/// Coerce one raw field into the column's declared type.
///
/// JSON nulls are handled by the caller (missing-vs-nullable policy), so a
/// null reaching this function is a type error.
pub fn coerce(column: &Column, raw: &serde_json::Value) -> Result<Value, CoerceError> {
    match column.ty {
        ColumnType::String => match raw {
            serde_json::Value::String(s) => Ok(Value::String(s.clone())),
            // Numbers and booleans render losslessly into a string column.
            serde_json::Value::Number(n) => Ok(Value::String(n.to_string())),
            serde_json::Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(incompatible(column, raw)),
        },
        ColumnType::Int64 => match raw {
            serde_json::Value::Number(n) => {
                n.as_i64().map(Value::Int64).ok_or_else(|| incompatible(column, raw))
            }
            serde_json::Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int64)
                .map_err(|_| incompatible(column, raw)),
            _ => Err(incompatible(column, raw)),
        },
        ColumnType::UInt64 => match raw {
            serde_json::Value::Number(n) => {
                n.as_u64().map(Value::UInt64).ok_or_else(|| incompatible(column, raw))
            }
            serde_json::Value::String(s) => s
                .trim()
                .parse::<u64>()
                .map(Value::UInt64)
                .map_err(|_| incompatible(column, raw)),
            _ => Err(incompatible(column, raw)),
        },
        ColumnType::Float64 => match raw {
            serde_json::Value::Number(n) => {
                n.as_f64().map(Value::Float64).ok_or_else(|| incompatible(column, raw))
            }
            serde_json::Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float64)
                .map_err(|_| incompatible(column, raw)),
            _ => Err(incompatible(column, raw)),
        },
        ColumnType::Bool => match raw {
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(incompatible(column, raw)),
            },
            serde_json::Value::String(s) => match s.trim() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(incompatible(column, raw)),
            },
            _ => Err(incompatible(column, raw)),
        },
        ColumnType::DateTime => match raw {
            serde_json::Value::String(s) => parse_timestamp(column, s),
            // Integers are interpreted as epoch seconds.
            serde_json::Value::Number(n) => n
                .as_i64()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .map(Value::DateTime)
                .ok_or_else(|| incompatible(column, raw)),
            _ => Err(incompatible(column, raw)),
        },
    }
}

fn parse_timestamp(column: &Column, input: &str) -> Result<Value, CoerceError> {
    let input = input.trim();
    if let Some(format) = &column.format {
        // An explicit format is authoritative: no fallbacks.
        if let Ok(ts) = DateTime::parse_from_str(input, format) {
            return Ok(Value::DateTime(ts.with_timezone(&Utc)));
        }
        return NaiveDateTime::parse_from_str(input, format)
            .map(|naive| Value::DateTime(naive.and_utc()))
            .map_err(|_| CoerceError::BadTimestamp {
                column: column.name.clone(),
                input: input.to_string(),
            });
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(input, CLICKHOUSE_DATETIME_FORMAT) {
        return Ok(Value::DateTime(naive.and_utc()));
    }
    DateTime::parse_from_rfc3339(input)
        .map(|ts| Value::DateTime(ts.with_timezone(&Utc)))
        .map_err(|_| CoerceError::BadTimestamp {
            column: column.name.clone(),
            input: input.to_string(),
        })
}
