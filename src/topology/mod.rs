//! Wiring and lifecycle of a running pipeline.
//!
//! One task per source reads, assembles, and parses records in order. One
//! task per destination table consumes its bounded queue, batches rows, and
//! writes them with retry. The queue between the two is the backpressure
//! boundary: a slow destination suspends its sources instead of dropping.

mod builder;
mod consumer;
mod running;

pub use builder::start;
pub use running::{PipelineState, RunningTopology};

use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum TopologyError {
    #[snafu(display("failed to load checkpoints: {}", source))]
    Checkpoint {
        source: crate::checkpointer::CheckpointError,
    },
    #[snafu(display("failed to open dead letter sink: {}", source))]
    DeadLetter {
        source: crate::dead_letter::DeadLetterOpenError,
    },
    #[snafu(display("source `{}`: {}", id, source))]
    BuildGrammar {
        id: String,
        source: crate::parse::grammar::GrammarBuildError,
    },
    #[snafu(display("source `{}`: {}", id, source))]
    BuildMultiline {
        id: String,
        source: crate::parse::multiline::MultilineBuildError,
    },
    #[snafu(display("task `{}` failed: {}", name, message))]
    TaskFailed { name: String, message: String },
    #[snafu(display("task `{}` panicked", name))]
    TaskPanicked { name: String },
    #[snafu(display("tasks did not stop within the drain deadline"))]
    DrainTimedOut,
}
