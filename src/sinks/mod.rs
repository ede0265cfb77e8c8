//! Ingestion writers.

pub mod clickhouse;
pub mod util;

use std::collections::HashMap;

use async_trait::async_trait;
use snafu::Snafu;

use crate::batcher::Batch;

/// Failure modes of a batch write, split into retriable and terminal classes.
#[derive(Debug, Snafu)]
pub enum WriteError {
    #[snafu(display("transport error: {}", source))]
    Transport { source: crate::http::HttpError },

    /// The destination signalled overload. Not an error in itself; it
    /// throttles upstream admission via the retry loop.
    #[snafu(display("destination overloaded (HTTP {})", status))]
    Backpressure { status: u16 },

    #[snafu(display(
        "destination rejected batch (exception code {:?}): {}",
        code,
        message
    ))]
    Rejected {
        code: Option<u32>,
        message: String,
        retriable: bool,
    },

    #[snafu(display("no schema declared for table `{}`", table))]
    UnknownTable { table: String },
}

impl WriteError {
    pub fn is_retriable(&self) -> bool {
        match self {
            WriteError::Transport { source } => source.is_retriable(),
            WriteError::Backpressure { .. } => true,
            WriteError::Rejected { retriable, .. } => *retriable,
            WriteError::UnknownTable { .. } => false,
        }
    }
}

/// Acknowledgement of a durably written batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitResult {
    pub rows: usize,
    /// Highest end offset per source actually committed; drives checkpoint
    /// advancement.
    pub max_offsets: HashMap<String, u64>,
}

/// Seam between the per-table consumer task and the destination store.
/// Production uses the ClickHouse HTTP service; tests inject fakes.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    async fn write(&self, batch: &Batch) -> Result<CommitResult, WriteError>;
}
