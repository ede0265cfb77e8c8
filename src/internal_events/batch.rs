use metrics::counter;

use super::InternalEvent;

/// Why a batch left the accumulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushReason {
    Rows,
    Bytes,
    Interval,
    Drain,
}

impl FlushReason {
    const fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Rows => "rows",
            FlushReason::Bytes => "bytes",
            FlushReason::Interval => "interval",
            FlushReason::Drain => "drain",
        }
    }
}

#[derive(Debug)]
pub struct BatchFlushed<'a> {
    pub table: &'a str,
    pub rows: usize,
    pub byte_size: usize,
    pub reason: FlushReason,
}

impl InternalEvent for BatchFlushed<'_> {
    fn emit(self) {
        debug!(
            message = "Batch flushed.",
            table = %self.table,
            rows = %self.rows,
            byte_size = %self.byte_size,
            reason = %self.reason.as_str(),
        );
        counter!(
            "batches_flushed_total",
            "table" => self.table.to_owned(),
            "reason" => self.reason.as_str(),
        )
        .increment(1);
    }
}
