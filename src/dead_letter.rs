//! Append-only NDJSON sink for records and batches the pipeline gave up on.
//!
//! Nothing is ever read back from this file at runtime; it exists for
//! offline inspection and manual replay.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use snafu::{ResultExt, Snafu};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::batcher::Batch;
use crate::internal_events::{DeadLetterWriteError, DeadLetterWritten};
use crate::parse::ParseFailure;

#[derive(Debug, Snafu)]
#[snafu(display("Failed to open dead letter file {:?}: {}", path, source))]
pub struct DeadLetterOpenError {
    path: PathBuf,
    source: std::io::Error,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
enum Entry<'a> {
    /// A single record that could not be parsed.
    ParseFailure {
        source_id: &'a str,
        start_offset: u64,
        end_offset: u64,
        raw: &'a str,
        reason: &'a str,
        timestamp: chrono::DateTime<Utc>,
    },
    /// A whole batch the destination rejected terminally.
    FailedBatch {
        table: &'a str,
        source_id: &'a str,
        max_offset: u64,
        rows: Vec<serde_json::Map<String, serde_json::Value>>,
        reason: &'a str,
        timestamp: chrono::DateTime<Utc>,
    },
}

/// Serialized appender over a single dead-letter file.
pub struct DeadLetterSink {
    file: Mutex<tokio::fs::File>,
}

impl DeadLetterSink {
    pub async fn open(path: &Path) -> Result<Self, DeadLetterOpenError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(DeadLetterOpenSnafu { path })?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .context(DeadLetterOpenSnafu { path })?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one unparseable record. Write failures are logged and counted
    /// but do not stop the pipeline; the dead letter channel is best-effort.
    pub async fn write_failure(&self, failure: &ParseFailure) {
        let raw = String::from_utf8_lossy(&failure.raw);
        let entry = Entry::ParseFailure {
            source_id: &failure.source_id,
            start_offset: failure.start_offset,
            end_offset: failure.end_offset,
            raw: &raw,
            reason: &failure.reason,
            timestamp: Utc::now(),
        };
        if self.append(&entry).await {
            emit!(DeadLetterWritten {
                source_id: &failure.source_id,
                count: 1,
            });
        }
    }

    /// Append every row of a terminally failed batch, grouped per source so
    /// entries stay attributable to their origin.
    pub async fn write_batch(&self, batch: &Batch, reason: &str) {
        for (source_id, &max_offset) in &batch.max_offsets {
            let rows: Vec<_> = batch
                .rows
                .iter()
                .filter(|row| row.source_id == *source_id)
                .map(|row| {
                    row.fields
                        .iter()
                        .map(|(name, value)| (name.clone(), value.to_json()))
                        .collect()
                })
                .collect();
            let count = rows.len();
            let entry = Entry::FailedBatch {
                table: &batch.table,
                source_id,
                max_offset,
                rows,
                reason,
                timestamp: Utc::now(),
            };
            if self.append(&entry).await {
                emit!(DeadLetterWritten { source_id, count });
            }
        }
    }

    async fn append(&self, entry: &Entry<'_>) -> bool {
        let mut line = serde_json::to_vec(entry).expect("dead letter entry serializes");
        line.push(b'\n');
        let mut file = self.file.lock().await;
        let result = async {
            file.write_all(&line).await?;
            file.flush().await
        }
        .await;
        match result {
            Ok(()) => true,
            Err(error) => {
                emit!(DeadLetterWriteError { error: &error });
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::internal_events::FlushReason;
    use crate::test_util::row_for;

    fn failure() -> ParseFailure {
        ParseFailure {
            source_id: "web".into(),
            start_offset: 10,
            end_offset: 30,
            raw: Bytes::from("garbage line"),
            reason: "no grammar matched".into(),
        }
    }

    async fn read_entries(path: &Path) -> Vec<serde_json::Value> {
        tokio::fs::read_to_string(path)
            .await
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn parse_failures_append_as_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead_letter.ndjson");
        let sink = DeadLetterSink::open(&path).await.unwrap();
        sink.write_failure(&failure()).await;
        sink.write_failure(&failure()).await;

        let entries = read_entries(&path).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["kind"], "parse_failure");
        assert_eq!(entries[0]["source_id"], "web");
        assert_eq!(entries[0]["raw"], "garbage line");
        assert_eq!(entries[0]["reason"], "no grammar matched");
    }

    #[tokio::test]
    async fn failed_batches_keep_rows_and_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead_letter.ndjson");
        let sink = DeadLetterSink::open(&path).await.unwrap();

        let mut batcher =
            crate::batcher::Batcher::new("events".into(), crate::batcher::BatchConfig::default());
        let _ = batcher.push(row_for("web", 0, 10));
        let _ = batcher.push(row_for("web", 10, 20));
        let batch = batcher.flush(FlushReason::Drain).unwrap();

        sink.write_batch(&batch, "retries exhausted").await;

        let entries = read_entries(&path).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["kind"], "failed_batch");
        assert_eq!(entries[0]["table"], "events");
        assert_eq!(entries[0]["max_offset"], 20);
        assert_eq!(entries[0]["rows"].as_array().unwrap().len(), 2);
        assert_eq!(entries[0]["reason"], "retries exhausted");
    }

    #[tokio::test]
    async fn open_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deep/dead_letter.ndjson");
        let sink = DeadLetterSink::open(&path).await.unwrap();
        sink.write_failure(&failure()).await;
        assert_eq!(read_entries(&path).await.len(), 1);
    }
}
