#![deny(unreachable_pub)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![allow(clippy::type_complexity)]

//! Log-to-ClickHouse ingestion pipeline.
//!
//! Tails log files from durable per-source offsets, normalizes each record
//! against a declared table schema, batches rows per destination table, and
//! bulk-inserts them over the ClickHouse HTTP interface. Checkpoints advance
//! only after the store has acknowledged a batch.

#[macro_use]
extern crate tracing;

#[macro_use]
pub mod internal_events;

pub mod app;
pub mod batcher;
pub mod checkpointer;
pub mod cli;
pub mod config;
pub mod dead_letter;
pub mod event;
pub mod http;
pub mod parse;
pub mod shutdown;
pub mod sinks;
pub mod sources;
pub mod topology;

#[cfg(test)]
pub mod test_util;

/// Boxed error type used at module seams, as the underlying error enums are
/// component-specific.
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type with the crate-wide boxed error.
pub type Result<T> = std::result::Result<T, Error>;

pub fn get_version() -> String {
    let pkg_version = env!("CARGO_PKG_VERSION");
    let debug_info = if cfg!(debug_assertions) { " debug" } else { "" };
    format!("{}{}", pkg_version, debug_info)
}
