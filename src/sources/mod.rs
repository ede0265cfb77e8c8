//! Record producers. Each configured source runs as its own task, keeping
//! per-source read order intact end to end.

pub mod file;
pub mod file_watcher;

pub use file::{FileSource, FileSourceConfig, SourceError, SourceMode};
