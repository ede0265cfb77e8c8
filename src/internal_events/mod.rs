#![allow(missing_docs)]

//! Internal observability events.
//!
//! Components construct an event struct and hand it to [`emit!`], which logs
//! it and updates the corresponding `metrics` counters. Failures inside the
//! pipeline are visible through these counters and the dead-letter sink; they
//! never escalate past their stage.

mod batch;
mod checkpointer;
mod clickhouse;
mod dead_letter;
mod file;
mod parser;

pub use batch::*;
pub use checkpointer::*;
pub use clickhouse::*;
pub use dead_letter::*;
pub use file::*;
pub use parser::*;

pub trait InternalEvent: Sized {
    fn emit(self);
}

#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::internal_events::InternalEvent::emit($event)
    };
}
