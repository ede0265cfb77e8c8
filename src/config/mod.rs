//! Pipeline configuration: a single TOML file declaring sources, table
//! schemas, batching, retry, and the destination connection.

pub mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_with::serde_as;
use snafu::{ResultExt, Snafu};

use crate::batcher::BatchConfig;
use crate::parse::FailurePolicy;
use crate::sinks::clickhouse::ClickhouseConfig;
use crate::sinks::util::retries::RetryConfig;
use crate::sources::FileSourceConfig;
use schema::TableSchema;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Failed to read config file {:?}: {}", path, source))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to parse config file {:?}: {}", path, source))]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("no sources configured"))]
    NoSources,
    #[snafu(display("duplicate source id `{}`", id))]
    DuplicateSource { id: String },
    #[snafu(display("source `{}` targets table `{}`, which has no schema", id, table))]
    UnknownTable { id: String, table: String },
    #[snafu(display("source `{}` declares no grammars", id))]
    NoGrammars { id: String },
    #[snafu(display("source `{}`: {}", id, source))]
    InvalidGrammar {
        id: String,
        source: crate::parse::grammar::GrammarBuildError,
    },
    #[snafu(display("source `{}`: {}", id, source))]
    InvalidMultiline {
        id: String,
        source: crate::parse::multiline::MultilineBuildError,
    },
    #[snafu(display(
        "source `{}` uses on_failure = \"dead_letter\" but no `dead_letter_path` is set",
        id
    ))]
    MissingDeadLetterPath { id: String },
    #[snafu(display("table `{}`: {}", table, source))]
    InvalidSchema {
        table: String,
        source: schema::SchemaError,
    },
}

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding the checkpoint file.
    pub data_dir: PathBuf,

    /// NDJSON file receiving unparseable records and terminally failed
    /// batches. Required when any source uses the dead-letter policy.
    #[serde(default)]
    pub dead_letter_path: Option<PathBuf>,

    /// How long a graceful shutdown may spend flushing and committing
    /// in-flight batches before work is abandoned.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    #[serde(rename = "drain_deadline_ms", default = "default_drain_deadline")]
    pub drain_deadline: Duration,

    #[serde(default)]
    pub batch: BatchConfig,

    pub sink: ClickhouseConfig,

    #[serde(default)]
    pub request: RetryConfig,

    /// Destination table schemas, keyed by table name.
    pub tables: IndexMap<String, TableSchema>,

    pub sources: Vec<FileSourceConfig>,
}

const fn default_drain_deadline() -> Duration {
    Duration::from_secs(10)
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        let mut config: Config =
            toml::from_str(&contents).context(ParseFileSnafu { path })?;
        for (name, schema) in &mut config.tables {
            schema.table = name.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// Structural checks beyond what deserialization enforces. Grammars,
    /// multi-line patterns, and schemas are compiled here so a bad config
    /// fails at startup instead of mid-stream.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return NoSourcesSnafu.fail();
        }
        for (name, schema) in &self.tables {
            schema
                .validate()
                .context(InvalidSchemaSnafu { table: name })?;
        }
        for (i, source) in self.sources.iter().enumerate() {
            if self.sources[..i].iter().any(|s| s.id == source.id) {
                return DuplicateSourceSnafu { id: &source.id }.fail();
            }
            if !self.tables.contains_key(&source.table) {
                return UnknownTableSnafu {
                    id: &source.id,
                    table: &source.table,
                }
                .fail();
            }
            if source.grammars.is_empty() {
                return NoGrammarsSnafu { id: &source.id }.fail();
            }
            for grammar in &source.grammars {
                grammar
                    .build()
                    .map(drop)
                    .context(InvalidGrammarSnafu { id: &source.id })?;
            }
            if let Some(multiline) = &source.multiline {
                multiline
                    .build()
                    .map(drop)
                    .context(InvalidMultilineSnafu { id: &source.id })?;
            }
            if source.on_failure == FailurePolicy::DeadLetter && self.dead_letter_path.is_none() {
                return MissingDeadLetterPathSnafu { id: &source.id }.fail();
            }
        }
        Ok(())
    }
}
