use metrics::counter;

use super::InternalEvent;

#[derive(Debug)]
pub struct ParseFailed<'a> {
    pub source_id: &'a str,
    pub reason: &'a str,
}

impl InternalEvent for ParseFailed<'_> {
    fn emit(self) {
        debug!(
            message = "Record failed to parse.",
            source_id = %self.source_id,
            reason = %self.reason,
        );
        counter!("parse_failures_total", "source_id" => self.source_id.to_owned()).increment(1);
    }
}

#[derive(Debug)]
pub struct MultilineTruncated<'a> {
    pub source_id: &'a str,
    pub lines: usize,
}

impl InternalEvent for MultilineTruncated<'_> {
    fn emit(self) {
        warn!(
            message = "Multi-line record exceeded the buffering window, flushed incomplete.",
            source_id = %self.source_id,
            lines = %self.lines,
        );
        counter!("parse_multiline_truncations_total", "source_id" => self.source_id.to_owned())
            .increment(1);
    }
}
