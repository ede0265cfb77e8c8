use std::time::Duration;

use metrics::counter;

use super::InternalEvent;

#[derive(Debug)]
pub struct BatchWritten<'a> {
    pub table: &'a str,
    pub rows: usize,
    pub byte_size: usize,
}

impl InternalEvent for BatchWritten<'_> {
    fn emit(self) {
        debug!(
            message = "Batch written.",
            table = %self.table,
            rows = %self.rows,
            byte_size = %self.byte_size,
        );
        counter!("sink_written_rows_total", "table" => self.table.to_owned())
            .increment(self.rows as u64);
        counter!("sink_written_bytes_total", "table" => self.table.to_owned())
            .increment(self.byte_size as u64);
    }
}

#[derive(Debug)]
pub struct BatchWriteRetry<'a> {
    pub table: &'a str,
    pub attempt: usize,
    pub error: &'a str,
    pub delay: Duration,
}

impl InternalEvent for BatchWriteRetry<'_> {
    fn emit(self) {
        warn!(
            message = "Retriable write failure, backing off.",
            table = %self.table,
            attempt = %self.attempt,
            error = %self.error,
            delay_ms = %self.delay.as_millis(),
        );
        counter!("sink_write_retries_total", "table" => self.table.to_owned()).increment(1);
    }
}

#[derive(Debug)]
pub struct BatchWriteFailed<'a> {
    pub table: &'a str,
    pub error: &'a str,
    pub rows: usize,
}

impl InternalEvent for BatchWriteFailed<'_> {
    fn emit(self) {
        error!(
            message = "Batch rejected by destination, routing to dead letter.",
            table = %self.table,
            error = %self.error,
            rows = %self.rows,
        );
        counter!("sink_write_failures_total", "table" => self.table.to_owned()).increment(1);
    }
}
