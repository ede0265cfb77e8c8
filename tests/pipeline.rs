//! End-to-end pipeline tests with an in-memory batch writer standing in for
//! the destination store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log2clickhouse::batcher::Batch;
use log2clickhouse::config::Config;
use log2clickhouse::sinks::{BatchWriter, CommitResult, WriteError};
use log2clickhouse::topology::{self, PipelineState};

#[derive(Debug, Clone, PartialEq)]
struct WrittenBatch {
    table: String,
    offsets: Vec<(String, u64, u64)>,
    user_ids: Vec<i64>,
    max_offsets: HashMap<String, u64>,
}

/// Fails the first `fail_first` write attempts with backpressure, then
/// records every accepted batch.
struct FakeStore {
    fail_first: AtomicUsize,
    written: Mutex<Vec<WrittenBatch>>,
}

impl FakeStore {
    fn new(fail_first: usize) -> Self {
        Self {
            fail_first: AtomicUsize::new(fail_first),
            written: Mutex::new(Vec::new()),
        }
    }

    fn written(&self) -> Vec<WrittenBatch> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchWriter for FakeStore {
    async fn write(&self, batch: &Batch) -> Result<CommitResult, WriteError> {
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.fetch_sub(1, Ordering::SeqCst);
            return Err(WriteError::Backpressure { status: 503 });
        }
        self.written.lock().unwrap().push(WrittenBatch {
            table: batch.table.clone(),
            offsets: batch
                .rows
                .iter()
                .map(|row| (row.source_id.clone(), row.start_offset, row.end_offset))
                .collect(),
            user_ids: batch
                .rows
                .iter()
                .map(|row| match &row.fields["user_id"] {
                    log2clickhouse::event::Value::Int64(id) => *id,
                    other => panic!("unexpected value: {other:?}"),
                })
                .collect(),
            max_offsets: batch.max_offsets.clone(),
        });
        Ok(CommitResult {
            rows: batch.rows.len(),
            max_offsets: batch.max_offsets.clone(),
        })
    }
}

fn write_config(dir: &Path, log_path: &Path, mode: &str, extra: &str) -> Config {
    let toml = format!(
        r#"
        data_dir = "{data_dir}"
        dead_letter_path = "{dead_letter}"
        drain_deadline_ms = 2000

        [batch]
        max_rows = 100
        flush_interval_ms = 50

        [request]
        retry_attempts = 3
        retry_initial_backoff_ms = 10
        retry_max_backoff_ms = 50
        jitter = "none"

        [sink]
        endpoint = "http://localhost:8123"
        database = "logs"

        [tables.enrollment]
        columns = [
            {{ name = "user_id", type = "int64" }},
            {{ name = "course_id", type = "int64" }},
        ]

        [[sources]]
        id = "enrollment"
        path = "{log}"
        table = "enrollment"
        mode = "{mode}"
        grammars = [{{ type = "json" }}]
        {extra}
        "#,
        data_dir = dir.join("data").display(),
        dead_letter = dir.join("dead_letter.ndjson").display(),
        log = log_path.display(),
    );
    let path = dir.join("config.toml");
    std::fs::write(&path, toml).unwrap();
    Config::load_from_path(&path).unwrap()
}

fn committed_offset(dir: &Path, source_id: &str) -> u64 {
    let state: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.join("data/checkpoints.json")).unwrap(),
    )
    .unwrap();
    state["checkpoints"][source_id]["offset"].as_u64().unwrap()
}

fn write_log(dir: &Path, lines: &[&str]) -> std::path::PathBuf {
    let path = dir.join("app.log");
    let mut contents = String::new();
    for line in lines {
        contents.push_str(line);
        contents.push('\n');
    }
    std::fs::write(&path, contents).unwrap();
    path
}

#[tokio::test]
async fn batch_pipeline_writes_rows_in_order_and_commits() {
    let dir = tempfile::tempdir().unwrap();
    let log = write_log(
        dir.path(),
        &[
            r#"{"user_id": 1, "course_id": 10}"#,
            r#"{"user_id": 2, "course_id": 20}"#,
            r#"{"user_id": 3, "course_id": 30}"#,
        ],
    );
    let config = write_config(dir.path(), &log, "batch", "");
    let store = std::sync::Arc::new(FakeStore::new(0));

    let mut topology = topology::start(&config, store.clone()).await.unwrap();
    assert_eq!(topology.state(), PipelineState::Running);
    tokio::time::timeout(Duration::from_secs(10), topology.wait())
        .await
        .expect("pipeline finishes")
        .unwrap();
    assert_eq!(topology.state(), PipelineState::Stopped);

    let written = store.written();
    let user_ids: Vec<i64> = written.iter().flat_map(|b| b.user_ids.clone()).collect();
    assert_eq!(user_ids, vec![1, 2, 3]);

    // Per-source order: every row's range starts where the previous ended.
    let offsets: Vec<_> = written.iter().flat_map(|b| b.offsets.clone()).collect();
    for pair in offsets.windows(2) {
        assert_eq!(pair[0].2, pair[1].1);
    }

    let end = offsets.last().unwrap().2;
    assert_eq!(committed_offset(dir.path(), "enrollment"), end);
    assert_eq!(std::fs::metadata(log).unwrap().len(), end);
}

#[tokio::test]
async fn backpressure_is_retried_and_committed_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let log = write_log(
        dir.path(),
        &[
            r#"{"user_id": 7, "course_id": 70}"#,
            r#"{"user_id": 8, "course_id": 80}"#,
        ],
    );
    let config = write_config(dir.path(), &log, "batch", "");
    // Two backpressure responses, then acceptance.
    let store = std::sync::Arc::new(FakeStore::new(2));

    let mut topology = topology::start(&config, store.clone()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), topology.wait())
        .await
        .expect("pipeline finishes")
        .unwrap();

    let written = store.written();
    let user_ids: Vec<i64> = written.iter().flat_map(|b| b.user_ids.clone()).collect();
    assert_eq!(user_ids, vec![7, 8]);
    assert!(committed_offset(dir.path(), "enrollment") > 0);
}

#[tokio::test]
async fn exhausted_retries_route_the_batch_to_dead_letter() {
    let dir = tempfile::tempdir().unwrap();
    let log = write_log(dir.path(), &[r#"{"user_id": 9, "course_id": 90}"#]);
    let config = write_config(dir.path(), &log, "batch", "");
    // More failures than the configured three retries.
    let store = std::sync::Arc::new(FakeStore::new(usize::MAX));

    let mut topology = topology::start(&config, store.clone()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), topology.wait())
        .await
        .expect("pipeline finishes")
        .unwrap();

    assert!(store.written().is_empty());
    let dead = std::fs::read_to_string(dir.path().join("dead_letter.ndjson")).unwrap();
    let entry: serde_json::Value = serde_json::from_str(dead.lines().next().unwrap()).unwrap();
    assert_eq!(entry["kind"], "failed_batch");
    assert_eq!(entry["table"], "enrollment");
    assert_eq!(entry["rows"][0]["user_id"], 9);

    // Offsets advance past dead-lettered rows so a restart does not loop.
    assert!(committed_offset(dir.path(), "enrollment") > 0);
}

#[tokio::test]
async fn unparseable_records_go_to_dead_letter_and_do_not_block_good_ones() {
    let dir = tempfile::tempdir().unwrap();
    let log = write_log(
        dir.path(),
        &["total garbage", r#"{"user_id": 4, "course_id": 40}"#],
    );
    let config = write_config(dir.path(), &log, "batch", "on_failure = \"dead_letter\"");
    let store = std::sync::Arc::new(FakeStore::new(0));

    let mut topology = topology::start(&config, store.clone()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), topology.wait())
        .await
        .expect("pipeline finishes")
        .unwrap();

    let user_ids: Vec<i64> = store
        .written()
        .iter()
        .flat_map(|b| b.user_ids.clone())
        .collect();
    assert_eq!(user_ids, vec![4]);

    let dead = std::fs::read_to_string(dir.path().join("dead_letter.ndjson")).unwrap();
    let entry: serde_json::Value = serde_json::from_str(dead.lines().next().unwrap()).unwrap();
    assert_eq!(entry["kind"], "parse_failure");
    assert_eq!(entry["raw"], "total garbage");
}

#[tokio::test]
async fn a_failed_source_suspends_without_stopping_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let log = write_log(dir.path(), &[r#"{"user_id": 5, "course_id": 50}"#]);
    let missing = dir.path().join("does-not-exist.log");
    let extra = format!(
        r#"read_retry_attempts = 0

        [[sources]]
        id = "missing"
        path = "{}"
        table = "enrollment"
        mode = "batch"
        grammars = [{{ type = "json" }}]
        read_retry_attempts = 0
        "#,
        missing.display(),
    );
    let config = write_config(dir.path(), &log, "batch", &extra);
    let store = std::sync::Arc::new(FakeStore::new(0));

    let mut topology = topology::start(&config, store.clone()).await.unwrap();
    // The unreadable source ends alone; the healthy one still delivers.
    tokio::time::timeout(Duration::from_secs(10), topology.wait())
        .await
        .expect("pipeline finishes")
        .unwrap();

    let user_ids: Vec<i64> = store
        .written()
        .iter()
        .flat_map(|b| b.user_ids.clone())
        .collect();
    assert_eq!(user_ids, vec![5]);
    assert!(committed_offset(dir.path(), "enrollment") > 0);
}

#[tokio::test]
async fn stop_after_a_cancelled_wait_still_tracks_every_task() {
    let dir = tempfile::tempdir().unwrap();
    let log = write_log(dir.path(), &[r#"{"user_id": 6, "course_id": 60}"#]);
    let config = write_config(dir.path(), &log, "tail", "");
    let store = std::sync::Arc::new(FakeStore::new(0));

    let mut topology = topology::start(&config, store.clone()).await.unwrap();
    // In tail mode wait() never resolves on its own; dropping it here mimics
    // a signal arriving mid-run. Every task must still drain on stop().
    let raced = tokio::time::timeout(Duration::from_millis(200), topology.wait()).await;
    assert!(raced.is_err());
    topology.stop().await.unwrap();

    let user_ids: Vec<i64> = store
        .written()
        .iter()
        .flat_map(|b| b.user_ids.clone())
        .collect();
    assert_eq!(user_ids, vec![6]);
    assert!(committed_offset(dir.path(), "enrollment") > 0);
}

#[tokio::test]
async fn restart_resumes_from_the_committed_offset() {
    let dir = tempfile::tempdir().unwrap();
    let log = write_log(dir.path(), &[r#"{"user_id": 1, "course_id": 10}"#]);
    let config = write_config(dir.path(), &log, "batch", "");

    let store = std::sync::Arc::new(FakeStore::new(0));
    let mut topology = topology::start(&config, store.clone()).await.unwrap();
    topology.wait().await.unwrap();
    assert_eq!(store.written().len(), 1);

    // Append one more record and run the pipeline again.
    let mut contents = std::fs::read_to_string(&log).unwrap();
    contents.push_str("{\"user_id\": 2, \"course_id\": 20}\n");
    std::fs::write(&log, contents).unwrap();

    let store = std::sync::Arc::new(FakeStore::new(0));
    let mut topology = topology::start(&config, store.clone()).await.unwrap();
    topology.wait().await.unwrap();

    let written = store.written();
    let user_ids: Vec<i64> = written.iter().flat_map(|b| b.user_ids.clone()).collect();
    assert_eq!(user_ids, vec![2], "already-committed rows must not replay");
}
