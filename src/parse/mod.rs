//! Parser/normalizer: turns raw records into schema-conformant rows.

pub mod coerce;
pub mod grammar;
pub mod multiline;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use indexmap::IndexMap;
use serde::Deserialize;

use crate::config::schema::TableSchema;
use crate::event::{ParseWarning, ParsedRow, RawRecord, Value};
use crate::parse::grammar::{Grammar, GrammarConfig};

/// What to do with a record that fails to parse.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Discard the record and count it.
    #[default]
    Drop,
    /// Append the record to the dead-letter sink.
    DeadLetter,
    /// Abort the pipeline. For strict schemas where a malformed record
    /// indicates corruption upstream.
    Abort,
}

/// A record that matched no grammar or violated the schema, tagged with the
/// raw bytes and the reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseFailure {
    pub source_id: String,
    pub start_offset: u64,
    pub end_offset: u64,
    pub raw: Bytes,
    pub reason: String,
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "record at {}:{} failed to parse: {}",
            self.source_id, self.start_offset, self.reason
        )
    }
}

/// Compiled parser for one source: an ordered grammar set plus the
/// destination schema.
///
/// Parsing is deterministic: the same raw record always yields the same row
/// or the same failure.
pub struct Parser {
    grammars: Vec<Grammar>,
    schema: Arc<TableSchema>,
}

impl Parser {
    pub fn build(
        configs: &[GrammarConfig],
        schema: Arc<TableSchema>,
    ) -> Result<Self, grammar::GrammarBuildError> {
        let grammars = configs
            .iter()
            .map(GrammarConfig::build)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { grammars, schema })
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Parse one record. `truncated` marks records flushed out of an
    /// exhausted multi-line window.
    pub fn parse(&self, record: &RawRecord, truncated: bool) -> Result<ParsedRow, ParseFailure> {
        let fields = self
            .grammars
            .iter()
            .find_map(|grammar| grammar.apply(&record.bytes))
            .ok_or_else(|| self.failure(record, "no grammar matched".to_string()))?;

        let mut warnings = Vec::new();
        if truncated {
            warnings.push(ParseWarning::TruncatedMultiline);
        }

        let mut row = IndexMap::with_capacity(self.schema.columns.len());
        for column in &self.schema.columns {
            if Some(&column.name) == self.schema.ingest_time_column.as_ref() {
                row.insert(
                    column.name.clone(),
                    Value::DateTime(record.ingest_timestamp),
                );
                continue;
            }
            let raw = fields.get(&column.name).filter(|v| !v.is_null());
            let value = match raw {
                None => {
                    if column.nullable {
                        Value::Null
                    } else {
                        return Err(self.failure(
                            record,
                            format!("required column `{}` is missing", column.name),
                        ));
                    }
                }
                Some(raw) => match coerce::coerce(column, raw) {
                    Ok(value) => value,
                    Err(error) if column.nullable_on_error => {
                        warnings.push(ParseWarning::CoercedToNull {
                            column: column.name.clone(),
                        });
                        debug!(
                            message = "Coercion error demoted to null.",
                            column = %column.name,
                            error = %error,
                        );
                        Value::Null
                    }
                    Err(error) => return Err(self.failure(record, error.to_string())),
                },
            };
            row.insert(column.name.clone(), value);
        }

        Ok(ParsedRow {
            schema_version: self.schema.version,
            fields: row,
            source_id: record.source_id.clone(),
            start_offset: record.start_offset,
            end_offset: record.end_offset,
            warnings,
        })
    }

    fn failure(&self, record: &RawRecord, reason: String) -> ParseFailure {
        ParseFailure {
            source_id: record.source_id.clone(),
            start_offset: record.start_offset,
            end_offset: record.end_offset,
            raw: record.bytes.clone(),
            reason,
        }
    }
}
