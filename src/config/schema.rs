//! Declared destination table schemas.
//!
//! A schema is loaded once at pipeline start and is immutable at runtime.
//! Column mismatches are detected at parse time, not at write time.

use serde::Deserialize;
use snafu::Snafu;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum SchemaError {
    #[snafu(display("table `{}` declares no columns", table))]
    EmptyColumns { table: String },
    #[snafu(display("table `{}` declares column `{}` more than once", table, column))]
    DuplicateColumn { table: String, column: String },
    #[snafu(display(
        "table `{}`: `ingest_time_column` `{}` is not a declared column",
        table,
        column
    ))]
    UnknownIngestTimeColumn { table: String, column: String },
    #[snafu(display(
        "table `{}`: `ingest_time_column` `{}` must have type `date_time`",
        table,
        column
    ))]
    IngestTimeColumnNotDateTime { table: String, column: String },
    #[snafu(display(
        "table `{}`: column `{}` sets `format` but is not a `date_time` column",
        table,
        column
    ))]
    FormatOnNonDateTime { table: String, column: String },
}

/// ClickHouse column types the schema language exposes.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Int64,
    UInt64,
    Float64,
    Bool,
    DateTime,
}

impl ColumnType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "String",
            ColumnType::Int64 => "Int64",
            ColumnType::UInt64 => "UInt64",
            ColumnType::Float64 => "Float64",
            ColumnType::Bool => "Bool",
            ColumnType::DateTime => "DateTime",
        }
    }
}

/// A single destination column.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Column {
    pub name: String,

    #[serde(rename = "type")]
    pub ty: ColumnType,

    /// Whether the destination column accepts nulls. Missing source fields
    /// for nullable columns become explicit nulls.
    #[serde(default)]
    pub nullable: bool,

    /// Demote a failed type coercion for this column to null instead of
    /// failing the whole row. Implies the destination column is nullable.
    #[serde(default)]
    pub nullable_on_error: bool,

    /// strftime-style layout used when parsing a `date_time` column from
    /// text. When unset, the ClickHouse layout `%Y-%m-%d %H:%M:%S` and
    /// RFC 3339 are tried.
    #[serde(default)]
    pub format: Option<String>,
}

/// Schema of one destination table: an ordered list of typed columns.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TableSchema {
    /// Destination table name. Populated from the config map key.
    #[serde(skip)]
    pub table: String,

    /// Schema version stamped on every row parsed against this schema.
    #[serde(default = "default_schema_version")]
    pub version: u32,

    pub columns: Vec<Column>,

    /// Name of a declared `date_time` column that receives the record's
    /// ingest timestamp, overwriting any parsed value.
    #[serde(default)]
    pub ingest_time_column: Option<String>,
}

const fn default_schema_version() -> u32 {
    1
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.columns.is_empty() {
            return EmptyColumnsSnafu { table: &self.table }.fail();
        }
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == column.name) {
                return DuplicateColumnSnafu {
                    table: &self.table,
                    column: &column.name,
                }
                .fail();
            }
            if column.format.is_some() && column.ty != ColumnType::DateTime {
                return FormatOnNonDateTimeSnafu {
                    table: &self.table,
                    column: &column.name,
                }
                .fail();
            }
        }
        if let Some(name) = &self.ingest_time_column {
            match self.column(name) {
                None => {
                    return UnknownIngestTimeColumnSnafu {
                        table: &self.table,
                        column: name,
                    }
                    .fail()
                }
                Some(column) if column.ty != ColumnType::DateTime => {
                    return IngestTimeColumnNotDateTimeSnafu {
                        table: &self.table,
                        column: name,
                    }
                    .fail()
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(toml: &str) -> TableSchema {
        let mut schema: TableSchema = ::toml::from_str(toml).unwrap();
        schema.table = "t".into();
        schema
    }

    #[test]
    fn accepts_well_formed_schema() {
        let schema = schema(
            r#"
            columns = [
                { name = "user_id", type = "int64" },
                { name = "ts", type = "date_time", format = "%d/%b/%Y:%H:%M:%S" },
                { name = "update_time", type = "date_time" },
            ]
            ingest_time_column = "update_time"
            "#,
        );
        assert!(schema.validate().is_ok());
        assert_eq!(schema.version, 1);
    }

    #[test]
    fn rejects_duplicate_columns() {
        let schema = schema(
            r#"
            columns = [
                { name = "a", type = "string" },
                { name = "a", type = "int64" },
            ]
            "#,
        );
        assert_eq!(
            schema.validate(),
            Err(SchemaError::DuplicateColumn {
                table: "t".into(),
                column: "a".into()
            })
        );
    }

    #[test]
    fn rejects_non_datetime_ingest_time_column() {
        let schema = schema(
            r#"
            columns = [{ name = "when", type = "string" }]
            ingest_time_column = "when"
            "#,
        );
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::IngestTimeColumnNotDateTime { .. })
        ));
    }

    #[test]
    fn rejects_format_on_integer_column() {
        let schema = schema(
            r#"
            columns = [{ name = "n", type = "int64", format = "%s" }]
            "#,
        );
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::FormatOnNonDateTime { .. })
        ));
    }
}
