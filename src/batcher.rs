//! Bounded per-table accumulator decoupling parse throughput from insert
//! latency.
//!
//! Flush triggers are OR-combined: row count, byte size, or the age of the
//! oldest unflushed row. A returned [`Batch`] is immutable and the
//! accumulator is reset before any subsequent row is accepted, so a row can
//! never land in two batches.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_with::serde_as;

use crate::event::ParsedRow;
use crate::internal_events::{BatchFlushed, FlushReason};

/// Batch thresholds, shared by every destination table.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,

    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Upper bound on how long a row may sit unflushed, even under zero
    /// subsequent traffic.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    #[serde(rename = "flush_interval_ms", default = "default_flush_interval")]
    pub flush_interval: Duration,

    /// Capacity of the bounded queue feeding each table's consumer task.
    /// A full queue suspends the source reader rather than dropping records.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

const fn default_max_rows() -> usize {
    10_000
}

const fn default_max_bytes() -> usize {
    10_000_000
}

const fn default_flush_interval() -> Duration {
    Duration::from_millis(1000)
}

const fn default_queue_capacity() -> usize {
    1024
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            max_bytes: default_max_bytes(),
            flush_interval: default_flush_interval(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// An immutable group of rows bound for one destination table.
#[derive(Clone, Debug)]
pub struct Batch {
    pub table: String,
    pub rows: Vec<ParsedRow>,
    pub byte_size: usize,
    /// Highest end offset per source contained in this batch; drives
    /// checkpoint advancement after the store acknowledges the write.
    pub max_offsets: HashMap<String, u64>,
    pub created_at: Instant,
}

impl Batch {
    /// Deterministic identity for this batch, derived from the destination
    /// table and the per-source offset ranges. Retrying the same batch
    /// produces the same token, which ClickHouse uses for insert
    /// deduplication; delivery is otherwise at-least-once.
    pub fn dedup_token(&self) -> String {
        let mut min_starts: HashMap<&str, u64> = HashMap::new();
        for row in &self.rows {
            min_starts
                .entry(row.source_id.as_str())
                .and_modify(|min| *min = (*min).min(row.start_offset))
                .or_insert(row.start_offset);
        }
        let mut sources: Vec<(&String, &u64)> = self.max_offsets.iter().collect();
        sources.sort();
        let mut canonical = self.table.clone();
        for (source_id, max_offset) in sources {
            let min_start = min_starts.get(source_id.as_str()).copied().unwrap_or(0);
            canonical.push_str(&format!("|{}:{}-{}", source_id, min_start, max_offset));
        }
        format!("{:016x}", seahash::hash(canonical.as_bytes()))
    }
}

/// Result of offering a row to the accumulator.
#[must_use]
#[derive(Debug)]
pub enum PushResult {
    /// Row was accepted; `full` signals the batch should flush now.
    Ok { full: bool },
    /// Row would overflow the byte budget and must be pushed again after a
    /// flush. Ownership returns to the caller.
    Overflow(ParsedRow),
}

/// Accumulator for a single destination table.
///
/// Owned by exactly one consumer task, which serializes `push` and `flush`,
/// keeping per-table commit order intact.
pub struct Batcher {
    table: String,
    config: BatchConfig,
    rows: Vec<ParsedRow>,
    byte_size: usize,
    oldest_row_at: Option<Instant>,
    max_offsets: HashMap<String, u64>,
}

impl Batcher {
    pub fn new(table: String, config: BatchConfig) -> Self {
        Self {
            table,
            config,
            rows: Vec::new(),
            byte_size: 0,
            oldest_row_at: None,
            max_offsets: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, row: ParsedRow) -> PushResult {
        let row_size = row.size_hint();
        if !self.rows.is_empty() && self.byte_size + row_size > self.config.max_bytes {
            return PushResult::Overflow(row);
        }
        self.byte_size += row_size;
        self.oldest_row_at.get_or_insert_with(Instant::now);
        let offset = self.max_offsets.entry(row.source_id.clone()).or_insert(0);
        *offset = (*offset).max(row.end_offset);
        self.rows.push(row);
        PushResult::Ok {
            full: self.rows.len() >= self.config.max_rows
                || self.byte_size >= self.config.max_bytes,
        }
    }

    /// When the accumulator must flush at the latest, based on its oldest row.
    pub fn deadline(&self) -> Option<Instant> {
        self.oldest_row_at
            .map(|oldest| oldest + self.config.flush_interval)
    }

    /// Return the accumulated batch and atomically reset the accumulator.
    pub fn flush(&mut self, reason: FlushReason) -> Option<Batch> {
        if self.rows.is_empty() {
            return None;
        }
        let batch = Batch {
            table: self.table.clone(),
            rows: std::mem::take(&mut self.rows),
            byte_size: std::mem::take(&mut self.byte_size),
            max_offsets: std::mem::take(&mut self.max_offsets),
            created_at: Instant::now(),
        };
        self.oldest_row_at = None;
        emit!(BatchFlushed {
            table: &self.table,
            rows: batch.rows.len(),
            byte_size: batch.byte_size,
            reason,
        });
        Some(batch)
    }
}
