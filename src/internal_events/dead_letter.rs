use metrics::counter;

use super::InternalEvent;

#[derive(Debug)]
pub struct DeadLetterWritten<'a> {
    pub source_id: &'a str,
    pub count: usize,
}

impl InternalEvent for DeadLetterWritten<'_> {
    fn emit(self) {
        debug!(
            message = "Records routed to dead letter sink.",
            source_id = %self.source_id,
            count = %self.count,
        );
        counter!("dead_letter_records_total", "source_id" => self.source_id.to_owned())
            .increment(self.count as u64);
    }
}

#[derive(Debug)]
pub struct DeadLetterWriteError<'a> {
    pub error: &'a std::io::Error,
}

impl InternalEvent for DeadLetterWriteError<'_> {
    fn emit(self) {
        error!(message = "Failed to append to dead letter sink.", error = %self.error);
        counter!("dead_letter_write_errors_total").increment(1);
    }
}
