//! Multi-line record assembly.
//!
//! Continuation lines are folded into the previous record according to a
//! configurable predicate. Buffering is bounded by line count, byte size, and
//! a wall-clock timeout; an aggregate that exceeds the window is flushed as-is
//! and flagged with a truncation warning rather than blocking the stream.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;
use serde::Deserialize;
use serde_with::serde_as;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum MultilineBuildError {
    #[snafu(display("`{}` {:?} is not a valid regex: {}", field, pattern, source))]
    InvalidPattern {
        field: &'static str,
        pattern: String,
        source: regex::Error,
    },
}

/// Mode of operation of the line aggregator.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// All consecutive lines matching the condition pattern are included in
    /// the group. Useful for stack traces, where leading whitespace marks an
    /// extension of the previous line.
    ContinueThrough,

    /// All consecutive lines matching the condition pattern, plus one
    /// additional line, are included in the group. Useful where a message
    /// ends with a continuation marker such as a backslash.
    ContinuePast,

    /// All consecutive lines not matching the condition pattern are included
    /// in the group. Useful where a marker indicates the start of a new
    /// message.
    HaltBefore,

    /// All consecutive lines, up to and including the first line matching the
    /// condition pattern, are included in the group. Useful where a message
    /// ends with a termination marker such as a semicolon.
    HaltWith,
}

/// Configuration of multi-line aggregation for a source.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MultilineConfig {
    /// Regex matching the start of a new aggregated record. Lines that match
    /// neither this nor an open aggregate pass through unchanged.
    pub start_pattern: String,

    /// Regex deciding whether more lines belong to the open aggregate,
    /// interpreted per `mode`.
    pub condition_pattern: String,

    pub mode: Mode,

    /// How long to wait for the next continuation line before flushing.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    #[serde(rename = "timeout_ms", default = "default_timeout")]
    pub timeout: Duration,

    /// Maximum number of lines buffered into one record.
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,

    /// Maximum byte size buffered into one record.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

const fn default_timeout() -> Duration {
    Duration::from_millis(1000)
}

const fn default_max_lines() -> usize {
    1000
}

fn default_max_bytes() -> usize {
    bytesize::kib(256u64) as usize
}

impl MultilineConfig {
    pub fn build(&self) -> Result<LineAgg, MultilineBuildError> {
        let start = Regex::new(&self.start_pattern).context(InvalidPatternSnafu {
            field: "start_pattern",
            pattern: &self.start_pattern,
        })?;
        let condition = Regex::new(&self.condition_pattern).context(InvalidPatternSnafu {
            field: "condition_pattern",
            pattern: &self.condition_pattern,
        })?;
        Ok(LineAgg {
            start,
            condition,
            mode: self.mode,
            timeout: self.timeout,
            max_lines: self.max_lines,
            max_bytes: self.max_bytes,
            pending: None,
        })
    }
}

/// An assembled record, covering one or more input lines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregatedLine {
    pub bytes: Bytes,
    pub start_offset: u64,
    pub end_offset: u64,
    pub truncated: bool,
    pub lines: usize,
}

struct Aggregate {
    buffer: BytesMut,
    start_offset: u64,
    end_offset: u64,
    since: Instant,
    lines: usize,
}

impl Aggregate {
    fn new(bytes: &[u8], start_offset: u64, end_offset: u64) -> Self {
        Self {
            buffer: BytesMut::from(bytes),
            start_offset,
            end_offset,
            since: Instant::now(),
            lines: 1,
        }
    }

    fn append(&mut self, bytes: &[u8], end_offset: u64) {
        self.buffer.extend_from_slice(b"\n");
        self.buffer.extend_from_slice(bytes);
        self.end_offset = end_offset;
        self.lines += 1;
    }

    fn finish(self, truncated: bool) -> AggregatedLine {
        AggregatedLine {
            bytes: self.buffer.freeze(),
            start_offset: self.start_offset,
            end_offset: self.end_offset,
            truncated,
            lines: self.lines,
        }
    }
}

/// Stateful line aggregator for a single source.
///
/// Per-source input order is preserved: output records are emitted in the
/// offset order of their first line.
pub struct LineAgg {
    start: Regex,
    condition: Regex,
    mode: Mode,
    timeout: Duration,
    max_lines: usize,
    max_bytes: usize,
    pending: Option<Aggregate>,
}

impl LineAgg {
    /// Feed one line; returns zero, one, or two completed records.
    pub fn handle(
        &mut self,
        bytes: &[u8],
        start_offset: u64,
        end_offset: u64,
    ) -> Vec<AggregatedLine> {
        let mut out = Vec::new();
        match self.pending.take() {
            None => {
                if self.start.is_match(bytes) {
                    if self.mode == Mode::HaltWith && self.condition.is_match(bytes) {
                        // Start and terminator on the same line: complete record.
                        out.push(Aggregate::new(bytes, start_offset, end_offset).finish(false));
                    } else {
                        self.pending = Some(Aggregate::new(bytes, start_offset, end_offset));
                    }
                } else {
                    // Not part of any aggregation; pass through unchanged.
                    out.push(Aggregate::new(bytes, start_offset, end_offset).finish(false));
                }
            }
            Some(mut pending) => match self.mode {
                Mode::ContinueThrough => {
                    if self.condition.is_match(bytes) {
                        self.append_bounded(pending, bytes, start_offset, end_offset, &mut out);
                    } else {
                        out.push(pending.finish(false));
                        if self.start.is_match(bytes) {
                            self.pending = Some(Aggregate::new(bytes, start_offset, end_offset));
                        } else {
                            out.push(Aggregate::new(bytes, start_offset, end_offset).finish(false));
                        }
                    }
                }
                Mode::ContinuePast => {
                    if self.condition.is_match(bytes) {
                        self.append_bounded(pending, bytes, start_offset, end_offset, &mut out);
                    } else {
                        pending.append(bytes, end_offset);
                        out.push(pending.finish(false));
                    }
                }
                Mode::HaltBefore => {
                    if self.condition.is_match(bytes) {
                        out.push(pending.finish(false));
                        self.pending = Some(Aggregate::new(bytes, start_offset, end_offset));
                    } else {
                        self.append_bounded(pending, bytes, start_offset, end_offset, &mut out);
                    }
                }
                Mode::HaltWith => {
                    if self.condition.is_match(bytes) {
                        pending.append(bytes, end_offset);
                        out.push(pending.finish(false));
                    } else {
                        self.append_bounded(pending, bytes, start_offset, end_offset, &mut out);
                    }
                }
            },
        }
        out
    }

    /// Append to the open aggregate and keep it pending. If the window is
    /// exhausted, the aggregate is flushed truncated and the line opens a
    /// fresh one instead.
    fn append_bounded(
        &mut self,
        mut pending: Aggregate,
        bytes: &[u8],
        start_offset: u64,
        end_offset: u64,
        out: &mut Vec<AggregatedLine>,
    ) {
        if pending.lines + 1 > self.max_lines
            || pending.buffer.len() + bytes.len() + 1 > self.max_bytes
        {
            out.push(pending.finish(true));
            self.pending = Some(Aggregate::new(bytes, start_offset, end_offset));
        } else {
            pending.append(bytes, end_offset);
            self.pending = Some(pending);
        }
    }

    /// Flush the open aggregate if it has waited longer than the timeout.
    pub fn flush_expired(&mut self, now: Instant) -> Option<AggregatedLine> {
        if self
            .pending
            .as_ref()
            .is_some_and(|agg| now.duration_since(agg.since) >= self.timeout)
        {
            return self.pending.take().map(|agg| agg.finish(false));
        }
        None
    }

    /// Unconditionally flush the open aggregate (EOF in batch mode, drain).
    pub fn flush(&mut self) -> Option<AggregatedLine> {
        self.pending.take().map(|agg| agg.finish(false))
    }

    /// When the open aggregate must be flushed at the latest.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|agg| agg.since + self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg(toml: &str) -> LineAgg {
        let config: MultilineConfig = ::toml::from_str(toml).unwrap();
        config.build().unwrap()
    }

    fn feed(agg: &mut LineAgg, lines: &[&str]) -> Vec<AggregatedLine> {
        let mut offset = 0u64;
        let mut out = Vec::new();
        for line in lines {
            let start = offset;
            offset += line.len() as u64 + 1;
            out.extend(agg.handle(line.as_bytes(), start, offset));
        }
        out
    }

    #[test]
    fn continue_through_folds_indented_continuations() {
        let mut agg = agg(
            r#"
            start_pattern = '^[^\s]'
            condition_pattern = '^\s+'
            mode = "continue_through"
            "#,
        );
        let out = feed(
            &mut agg,
            &["error: boom", "  at foo()", "  at bar()", "next record"],
        );
        // "next record" starts a fresh aggregate, still pending.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, Bytes::from("error: boom\n  at foo()\n  at bar()"));
        assert_eq!(out[0].lines, 3);
        assert_eq!(out[0].start_offset, 0);
        assert_eq!(out[0].end_offset, 34);
        let last = agg.flush().unwrap();
        assert_eq!(last.bytes, Bytes::from("next record"));
    }

    #[test]
    fn continue_past_takes_one_extra_line() {
        let mut agg = agg(
            r#"
            start_pattern = '\\$'
            condition_pattern = '\\$'
            mode = "continue_past"
            "#,
        );
        let out = feed(&mut agg, &["part one \\", "part two \\", "part three", "solo"]);
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0].bytes,
            Bytes::from("part one \\\npart two \\\npart three")
        );
        assert_eq!(out[1].bytes, Bytes::from("solo"));
    }

    #[test]
    fn halt_before_starts_new_record_on_marker() {
        let mut agg = agg(
            r#"
            start_pattern = '^\['
            condition_pattern = '^\['
            mode = "halt_before"
            "#,
        );
        let out = feed(&mut agg, &["[rec a", "cont 1", "cont 2", "[rec b"]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, Bytes::from("[rec a\ncont 1\ncont 2"));
        assert!(agg.flush().is_some());
    }

    #[test]
    fn halt_with_completes_on_terminator() {
        let mut agg = agg(
            r#"
            start_pattern = '^SELECT'
            condition_pattern = ';$'
            mode = "halt_with"
            "#,
        );
        let out = feed(&mut agg, &["SELECT *", "FROM t", "WHERE x = 1;"]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, Bytes::from("SELECT *\nFROM t\nWHERE x = 1;"));

        // Single-line record carrying its own terminator.
        let out = feed(&mut agg, &["SELECT 1;"]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, Bytes::from("SELECT 1;"));
    }

    #[test]
    fn window_overflow_flushes_truncated() {
        let mut agg = agg(
            r#"
            start_pattern = '^start'
            condition_pattern = '^\s'
            mode = "continue_through"
            max_lines = 2
            "#,
        );
        let out = feed(&mut agg, &["start", " one", " two", " three"]);
        assert_eq!(out.len(), 1);
        assert!(out[0].truncated);
        assert_eq!(out[0].bytes, Bytes::from("start\n one"));
        // The overflowing line opened a fresh aggregate.
        let rest = agg.flush().unwrap();
        assert_eq!(rest.bytes, Bytes::from(" two\n three"));
    }

    #[test]
    fn expiry_flushes_after_timeout_only() {
        let mut agg = agg(
            r#"
            start_pattern = '^start'
            condition_pattern = '^\s'
            mode = "continue_through"
            timeout_ms = 50
            "#,
        );
        assert!(agg.handle(b"start", 0, 6).is_empty());
        let opened = Instant::now();
        assert!(agg.flush_expired(opened).is_none());
        let flushed = agg
            .flush_expired(opened + Duration::from_millis(100))
            .unwrap();
        assert_eq!(flushed.bytes, Bytes::from("start"));
        assert!(agg.next_deadline().is_none());
    }

    #[test]
    fn non_matching_lines_pass_through() {
        let mut agg = agg(
            r#"
            start_pattern = '^start'
            condition_pattern = '^\s'
            mode = "continue_through"
            "#,
        );
        let out = feed(&mut agg, &["plain line"]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].lines, 1);
        assert!(!out[0].truncated);
    }
}
