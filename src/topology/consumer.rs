//! Per-table consumer: batches rows from the queue and writes them with
//! bounded retry, committing checkpoints only after the store acknowledges.

use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;

use crate::batcher::{Batch, Batcher, PushResult};
use crate::checkpointer::{CheckpointError, Checkpointer};
use crate::dead_letter::DeadLetterSink;
use crate::event::ParsedRow;
use crate::internal_events::{BatchWriteFailed, BatchWriteRetry, BatchWritten, FlushReason};
use crate::shutdown::ShutdownSignal;
use crate::sinks::util::retries::RetryConfig;
use crate::sinks::{BatchWriter, WriteError};

#[derive(Debug, Snafu)]
pub(crate) enum ConsumerError {
    #[snafu(display("table `{}`: {}", table, source))]
    Checkpoint {
        table: String,
        source: CheckpointError,
    },
}

pub(super) struct TableConsumer {
    table: String,
    input: mpsc::Receiver<ParsedRow>,
    batcher: Batcher,
    writer: Arc<dyn BatchWriter>,
    retry: RetryConfig,
    checkpointer: Checkpointer,
    dead_letter: Option<Arc<DeadLetterSink>>,
    force_shutdown: ShutdownSignal,
}

impl TableConsumer {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        table: String,
        input: mpsc::Receiver<ParsedRow>,
        batcher: Batcher,
        writer: Arc<dyn BatchWriter>,
        retry: RetryConfig,
        checkpointer: Checkpointer,
        dead_letter: Option<Arc<DeadLetterSink>>,
        force_shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            table,
            input,
            batcher,
            writer,
            retry,
            checkpointer,
            dead_letter,
            force_shutdown,
        }
    }

    /// Runs until the queue closes (all sources for this table are done) and
    /// the final batch has been written, or until forced shutdown.
    pub(super) async fn run(mut self) -> Result<(), ConsumerError> {
        loop {
            let deadline = self.batcher.deadline();
            let flush_timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = self.force_shutdown.wait() => {
                    if !self.batcher.is_empty() {
                        warn!(
                            message = "Forced shutdown, abandoning unflushed rows.",
                            table = %self.table,
                        );
                    }
                    return Ok(());
                }
                _ = flush_timer => {
                    if let Some(batch) = self.batcher.flush(FlushReason::Interval) {
                        if !self.write(batch).await? {
                            return Ok(());
                        }
                    }
                }
                row = self.input.recv() => match row {
                    Some(row) => {
                        if !self.accept(row).await? {
                            return Ok(());
                        }
                    }
                    None => {
                        if let Some(batch) = self.batcher.flush(FlushReason::Drain) {
                            if !self.write(batch).await? {
                                return Ok(());
                            }
                        }
                        info!(message = "Table consumer drained.", table = %self.table);
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn accept(&mut self, row: ParsedRow) -> Result<bool, ConsumerError> {
        let mut pending = Some(row);
        while let Some(row) = pending.take() {
            match self.batcher.push(row) {
                PushResult::Ok { full } => {
                    if full {
                        if let Some(batch) = self.batcher.flush(FlushReason::Rows) {
                            if !self.write(batch).await? {
                                return Ok(false);
                            }
                        }
                    }
                }
                PushResult::Overflow(row) => {
                    if let Some(batch) = self.batcher.flush(FlushReason::Bytes) {
                        if !self.write(batch).await? {
                            return Ok(false);
                        }
                    }
                    pending = Some(row);
                }
            }
        }
        Ok(true)
    }

    /// Write one batch, retrying retriable failures with backoff. Returns
    /// `false` when forced shutdown interrupted the attempt; the batch is
    /// then abandoned uncommitted and will replay after restart.
    async fn write(&mut self, batch: Batch) -> Result<bool, ConsumerError> {
        let mut policy = self.retry.policy();
        let mut attempt = 0usize;
        loop {
            match self.writer.write(&batch).await {
                Ok(commit) => {
                    emit!(BatchWritten {
                        table: &self.table,
                        rows: commit.rows,
                        byte_size: batch.byte_size,
                    });
                    self.checkpointer
                        .commit(&commit.max_offsets)
                        .await
                        .context(CheckpointSnafu { table: &self.table })?;
                    return Ok(true);
                }
                Err(error) if error.is_retriable() => {
                    attempt += 1;
                    let Some(delay) = policy.next_delay() else {
                        self.give_up(batch, &error).await?;
                        return Ok(true);
                    };
                    emit!(BatchWriteRetry {
                        table: &self.table,
                        attempt,
                        error: &error.to_string(),
                        delay,
                    });
                    tokio::select! {
                        _ = self.force_shutdown.wait() => return Ok(false),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => {
                    self.give_up(batch, &error).await?;
                    return Ok(true);
                }
            }
        }
    }

    /// Terminal failure: record the batch in the dead letter sink and move
    /// on. Offsets still advance so a restart does not replay the stream
    /// into the same rejection.
    async fn give_up(&mut self, batch: Batch, error: &WriteError) -> Result<(), ConsumerError> {
        let reason = error.to_string();
        emit!(BatchWriteFailed {
            table: &self.table,
            error: &reason,
            rows: batch.rows.len(),
        });
        if let Some(sink) = &self.dead_letter {
            sink.write_batch(&batch, &reason).await;
        }
        self.checkpointer
            .commit(&batch.max_offsets)
            .await
            .context(CheckpointSnafu { table: &self.table })
    }
}
