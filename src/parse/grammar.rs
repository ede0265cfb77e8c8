//! Declarative record grammars.
//!
//! A source declares one or more grammars, tried in priority order against
//! each assembled record; the first one that matches wins. A grammar either
//! produces a set of raw named fields or declines, leaving typing and schema
//! conformance to the normalizer.

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum GrammarBuildError {
    #[snafu(display("pattern {:?} is not a valid regex: {}", pattern, source))]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
    #[snafu(display("pattern {:?} declares no named capture groups", pattern))]
    NoNamedCaptures { pattern: String },
}

/// Configuration of a single grammar.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum GrammarConfig {
    /// The record is a JSON object, one field per column.
    Json {
        /// Skip any prefix before the first `{`, so records like
        /// `2024-05-17 INFO {"user_id": 7}` still parse. Matches the behavior
        /// of log emitters that prepend a plain-text preamble.
        #[serde(default = "default_true")]
        scan_to_brace: bool,
    },

    /// The record matches a regex; named capture groups become fields.
    Regex { pattern: String },
}

const fn default_true() -> bool {
    true
}

impl GrammarConfig {
    pub fn build(&self) -> Result<Grammar, GrammarBuildError> {
        match self {
            GrammarConfig::Json { scan_to_brace } => Ok(Grammar::Json {
                scan_to_brace: *scan_to_brace,
            }),
            GrammarConfig::Regex { pattern } => {
                let regex = Regex::new(pattern).context(InvalidPatternSnafu { pattern })?;
                if regex.capture_names().flatten().next().is_none() {
                    return NoNamedCapturesSnafu { pattern }.fail();
                }
                Ok(Grammar::Regex { regex })
            }
        }
    }
}

/// Untyped fields extracted by a grammar, in extraction order.
pub type RawFields = IndexMap<String, serde_json::Value>;

/// A compiled grammar.
#[derive(Clone, Debug)]
pub enum Grammar {
    Json { scan_to_brace: bool },
    Regex { regex: Regex },
}

impl Grammar {
    /// Apply the grammar to an assembled record. `None` means the grammar
    /// declines and the next one in priority order should be tried.
    pub fn apply(&self, bytes: &[u8]) -> Option<RawFields> {
        let text = std::str::from_utf8(bytes).ok()?;
        match self {
            Grammar::Json { scan_to_brace } => {
                let text = if *scan_to_brace {
                    &text[text.find('{')?..]
                } else {
                    text
                };
                match serde_json::from_str(text).ok()? {
                    serde_json::Value::Object(map) => Some(map.into_iter().collect()),
                    _ => None,
                }
            }
            Grammar::Regex { regex } => {
                let captures = regex.captures(text)?;
                Some(
                    regex
                        .capture_names()
                        .flatten()
                        .filter_map(|name| {
                            captures.name(name).map(|m| {
                                (
                                    name.to_string(),
                                    serde_json::Value::String(m.as_str().to_string()),
                                )
                            })
                        })
                        .collect(),
                )
            }
        }
    }
}
