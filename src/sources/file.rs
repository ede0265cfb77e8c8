//! The file source: tails (or batch-reads) one log file, assembles records,
//! parses them, and feeds the destination table's queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;
use serde_with::serde_as;
use snafu::Snafu;
use tokio::sync::mpsc;

use super::file_watcher::{FileStatus, FileWatcher, RawLine};
use crate::checkpointer::{CheckpointError, Checkpointer};
use crate::dead_letter::DeadLetterSink;
use crate::event::{ParsedRow, RawRecord};
use crate::internal_events::{
    FileBytesReceived, FileReadError, FileRecordsReceived, FileRotated, FileTruncated,
    MultilineTruncated, ParseFailed,
};
use crate::parse::grammar::GrammarConfig;
use crate::parse::multiline::{AggregatedLine, LineAgg, MultilineBuildError, MultilineConfig};
use crate::parse::{FailurePolicy, Parser};
use crate::shutdown::ShutdownSignal;
use crate::sinks::util::retries::ExponentialBackoff;

const READ_RETRY_INITIAL: Duration = Duration::from_millis(500);
const READ_RETRY_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum SourceError {
    #[snafu(display("source `{}`: failed to open {:?}: {}", source_id, path, source))]
    Open {
        source_id: String,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "source `{}`: read failed after {} retries: {}",
        source_id,
        attempts,
        source
    ))]
    Read {
        source_id: String,
        attempts: usize,
        source: std::io::Error,
    },
    #[snafu(display("source `{}`: {}", source_id, source))]
    Checkpoint {
        source_id: String,
        source: CheckpointError,
    },
    #[snafu(display("aborting on parse failure: {}", failure))]
    Aborted { failure: String },
}

impl SourceError {
    /// Whether the failure must take the whole pipeline down. Open and read
    /// errors are stream-local: they end this source and nothing else.
    pub const fn is_fatal(&self) -> bool {
        match self {
            SourceError::Open { .. } | SourceError::Read { .. } => false,
            SourceError::Checkpoint { .. } | SourceError::Aborted { .. } => true,
        }
    }
}

/// Whether the source keeps following the file or stops at its current end.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// Follow the file indefinitely, surviving rotation and truncation.
    #[default]
    Tail,
    /// Read up to the current end of file, then finish. The trailing line is
    /// emitted even without a final newline.
    Batch,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSourceConfig {
    /// Stable identifier; checkpoints and metrics are keyed by it.
    pub id: String,

    pub path: PathBuf,

    /// Destination table. Must have a declared schema.
    pub table: String,

    #[serde(default)]
    pub mode: SourceMode,

    /// Lines longer than this are discarded whole.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    #[serde(default)]
    pub on_failure: FailurePolicy,

    #[serde(default)]
    pub multiline: Option<MultilineConfig>,

    /// Ordered grammar set; the first match wins.
    pub grammars: Vec<GrammarConfig>,

    /// How often to re-poll the file after reaching its end in tail mode.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    #[serde(rename = "poll_interval_ms", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Transient read errors tolerated before the source fails.
    #[serde(default = "default_read_retry_attempts")]
    pub read_retry_attempts: usize,
}

fn default_max_line_bytes() -> usize {
    bytesize::kib(100u64) as usize
}

const fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

const fn default_read_retry_attempts() -> usize {
    5
}

/// One running file source. Owns the reader, the line aggregator, and the
/// parser; everything downstream of the queue belongs to the table consumer.
pub struct FileSource {
    config: FileSourceConfig,
    parser: Parser,
    line_agg: Option<LineAgg>,
    checkpointer: Checkpointer,
    output: mpsc::Sender<ParsedRow>,
    dead_letter: Option<Arc<DeadLetterSink>>,
    shutdown: ShutdownSignal,
}

impl FileSource {
    pub fn new(
        config: FileSourceConfig,
        parser: Parser,
        checkpointer: Checkpointer,
        output: mpsc::Sender<ParsedRow>,
        dead_letter: Option<Arc<DeadLetterSink>>,
        shutdown: ShutdownSignal,
    ) -> Result<Self, MultilineBuildError> {
        let line_agg = config
            .multiline
            .as_ref()
            .map(MultilineConfig::build)
            .transpose()?;
        Ok(Self {
            config,
            parser,
            line_agg,
            checkpointer,
            output,
            dead_letter,
            shutdown,
        })
    }

    pub async fn run(mut self) -> Result<(), SourceError> {
        let start_offset = self.checkpointer.get(&self.config.id);
        let mut watcher = self.open_watcher(start_offset).await?;
        info!(
            message = "Source started.",
            source_id = %self.config.id,
            path = %self.config.path.display(),
            start_offset = %watcher.offset(),
        );

        let mut read_errors = 0usize;
        let mut backoff = ExponentialBackoff::new(READ_RETRY_INITIAL, READ_RETRY_MAX);

        loop {
            let deadline = self.line_agg.as_ref().and_then(LineAgg::next_deadline);
            let aggregate_timeout = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                _ = aggregate_timeout => {
                    let expired = self
                        .line_agg
                        .as_mut()
                        .and_then(|agg| agg.flush_expired(Instant::now()));
                    if let Some(line) = expired {
                        if !self.deliver(line).await? {
                            return Ok(());
                        }
                    }
                }
                result = watcher.read_line() => match result {
                    Ok(Some(line)) => {
                        read_errors = 0;
                        backoff = ExponentialBackoff::new(READ_RETRY_INITIAL, READ_RETRY_MAX);
                        emit!(FileBytesReceived {
                            source_id: &self.config.id,
                            byte_size: (line.end_offset - line.start_offset) as usize,
                        });
                        for record in self.aggregate(line) {
                            if !self.deliver(record).await? {
                                return Ok(());
                            }
                        }
                    }
                    Ok(None) => match self.config.mode {
                        SourceMode::Batch => {
                            if let Some(tail) = watcher.finish() {
                                for record in self.aggregate(tail) {
                                    if !self.deliver(record).await? {
                                        return Ok(());
                                    }
                                }
                            }
                            self.drain_aggregate().await?;
                            info!(
                                message = "Reached end of input.",
                                source_id = %self.config.id,
                                end_offset = %watcher.offset(),
                            );
                            return Ok(());
                        }
                        SourceMode::Tail => match watcher.status().await {
                            Ok(FileStatus::Unchanged) => self.poll_pause().await,
                            Ok(FileStatus::Rotated) => {
                                if let Some(tail) = watcher.finish() {
                                    for record in self.aggregate(tail) {
                                        if !self.deliver(record).await? {
                                            return Ok(());
                                        }
                                    }
                                }
                                self.drain_aggregate().await?;
                                emit!(FileRotated {
                                    source_id: &self.config.id,
                                    path: &self.config.path,
                                });
                                self.reset_checkpoint().await?;
                                watcher = self.open_watcher(0).await?;
                            }
                            Ok(FileStatus::Truncated { len }) => {
                                self.drain_aggregate().await?;
                                emit!(FileTruncated {
                                    source_id: &self.config.id,
                                    path: &self.config.path,
                                    new_len: len,
                                });
                                self.reset_checkpoint().await?;
                                watcher = self.open_watcher(0).await?;
                            }
                            // The path can be briefly absent mid-rotation.
                            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                                self.poll_pause().await
                            }
                            Err(error) => {
                                self.read_error(&error, &mut read_errors, &mut backoff)
                                    .await?
                            }
                        },
                    },
                    Err(error) => {
                        self.read_error(&error, &mut read_errors, &mut backoff)
                            .await?
                    }
                },
            }
        }

        // Graceful shutdown: complete the open aggregate, leave any partial
        // line unclaimed so its offset is never committed.
        self.drain_aggregate().await?;
        info!(message = "Source stopped.", source_id = %self.config.id);
        Ok(())
    }

    async fn open_watcher(&mut self, start_offset: u64) -> Result<FileWatcher, SourceError> {
        let mut backoff = ExponentialBackoff::new(READ_RETRY_INITIAL, READ_RETRY_MAX);
        let mut attempt = 0usize;
        loop {
            match FileWatcher::open(&self.config.path, start_offset, self.config.max_line_bytes)
                .await
            {
                Ok((watcher, truncated)) => {
                    if truncated {
                        emit!(FileTruncated {
                            source_id: &self.config.id,
                            path: &self.config.path,
                            new_len: watcher.offset(),
                        });
                        self.reset_checkpoint().await?;
                    }
                    return Ok(watcher);
                }
                Err(source) => {
                    attempt += 1;
                    emit!(FileReadError {
                        source_id: &self.config.id,
                        error: &source,
                        attempt,
                    });
                    if attempt > self.config.read_retry_attempts {
                        return Err(SourceError::Open {
                            source_id: self.config.id.clone(),
                            path: self.config.path.clone(),
                            source,
                        });
                    }
                    let delay = backoff.next().unwrap_or(READ_RETRY_MAX);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn read_error(
        &mut self,
        error: &std::io::Error,
        read_errors: &mut usize,
        backoff: &mut ExponentialBackoff,
    ) -> Result<(), SourceError> {
        *read_errors += 1;
        emit!(FileReadError {
            source_id: &self.config.id,
            error,
            attempt: *read_errors,
        });
        if *read_errors > self.config.read_retry_attempts {
            return Err(SourceError::Read {
                source_id: self.config.id.clone(),
                attempts: *read_errors - 1,
                source: std::io::Error::new(error.kind(), error.to_string()),
            });
        }
        let delay = backoff.next().unwrap_or(READ_RETRY_MAX);
        tokio::time::sleep(delay).await;
        Ok(())
    }

    async fn poll_pause(&mut self) {
        tokio::select! {
            _ = self.shutdown.wait() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    fn aggregate(&mut self, line: RawLine) -> Vec<AggregatedLine> {
        match self.line_agg.as_mut() {
            Some(agg) => agg.handle(&line.bytes, line.start_offset, line.end_offset),
            None => vec![AggregatedLine {
                bytes: line.bytes,
                start_offset: line.start_offset,
                end_offset: line.end_offset,
                truncated: false,
                lines: 1,
            }],
        }
    }

    async fn drain_aggregate(&mut self) -> Result<(), SourceError> {
        let pending = self.line_agg.as_mut().and_then(LineAgg::flush);
        if let Some(line) = pending {
            self.deliver(line).await?;
        }
        Ok(())
    }

    /// Parse and forward one assembled record. Returns `false` when the
    /// downstream queue has closed, meaning the pipeline is going away.
    async fn deliver(&mut self, line: AggregatedLine) -> Result<bool, SourceError> {
        if line.truncated {
            emit!(MultilineTruncated {
                source_id: &self.config.id,
                lines: line.lines,
            });
        }
        emit!(FileRecordsReceived {
            source_id: &self.config.id,
            count: 1,
        });
        let record = RawRecord {
            source_id: self.config.id.clone(),
            start_offset: line.start_offset,
            end_offset: line.end_offset,
            bytes: line.bytes,
            ingest_timestamp: Utc::now(),
        };
        match self.parser.parse(&record, line.truncated) {
            Ok(row) => Ok(self.output.send(row).await.is_ok()),
            Err(failure) => {
                emit!(ParseFailed {
                    source_id: &self.config.id,
                    reason: &failure.reason,
                });
                match self.config.on_failure {
                    FailurePolicy::Drop => Ok(true),
                    FailurePolicy::DeadLetter => {
                        if let Some(sink) = &self.dead_letter {
                            sink.write_failure(&failure).await;
                        }
                        Ok(true)
                    }
                    FailurePolicy::Abort => Err(SourceError::Aborted {
                        failure: failure.to_string(),
                    }),
                }
            }
        }
    }

    async fn reset_checkpoint(&mut self) -> Result<(), SourceError> {
        self.checkpointer
            .reset(&self.config.id)
            .await
            .map_err(|source| SourceError::Checkpoint {
                source_id: self.config.id.clone(),
                source,
            })
    }
}
