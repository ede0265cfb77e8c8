use metrics::counter;

use super::InternalEvent;

#[derive(Debug)]
pub struct FileBytesReceived<'a> {
    pub source_id: &'a str,
    pub byte_size: usize,
}

impl InternalEvent for FileBytesReceived<'_> {
    fn emit(self) {
        trace!(
            message = "Bytes received.",
            byte_size = %self.byte_size,
            source_id = %self.source_id,
        );
        counter!("source_received_bytes_total", "source_id" => self.source_id.to_owned())
            .increment(self.byte_size as u64);
    }
}

#[derive(Debug)]
pub struct FileRecordsReceived<'a> {
    pub source_id: &'a str,
    pub count: usize,
}

impl InternalEvent for FileRecordsReceived<'_> {
    fn emit(self) {
        trace!(
            message = "Records received.",
            count = %self.count,
            source_id = %self.source_id,
        );
        counter!("source_received_records_total", "source_id" => self.source_id.to_owned())
            .increment(self.count as u64);
    }
}

#[derive(Debug)]
pub struct FileRotated<'a> {
    pub source_id: &'a str,
    pub path: &'a std::path::Path,
}

impl InternalEvent for FileRotated<'_> {
    fn emit(self) {
        info!(
            message = "File rotated, resuming from new file start.",
            source_id = %self.source_id,
            path = %self.path.display(),
        );
        counter!("source_file_rotations_total", "source_id" => self.source_id.to_owned())
            .increment(1);
    }
}

#[derive(Debug)]
pub struct FileTruncated<'a> {
    pub source_id: &'a str,
    pub path: &'a std::path::Path,
    pub new_len: u64,
}

impl InternalEvent for FileTruncated<'_> {
    fn emit(self) {
        warn!(
            message = "File truncated below committed offset, resetting to start.",
            source_id = %self.source_id,
            path = %self.path.display(),
            new_len = %self.new_len,
        );
        counter!("source_file_truncations_total", "source_id" => self.source_id.to_owned())
            .increment(1);
    }
}

#[derive(Debug)]
pub struct SourceSuspended<'a> {
    pub source_id: &'a str,
    pub error: &'a str,
}

impl InternalEvent for SourceSuspended<'_> {
    fn emit(self) {
        error!(
            message = "Source failed after exhausting retries, suspending it.",
            source_id = %self.source_id,
            error = %self.error,
        );
        counter!("source_suspensions_total", "source_id" => self.source_id.to_owned())
            .increment(1);
    }
}

#[derive(Debug)]
pub struct FileReadError<'a> {
    pub source_id: &'a str,
    pub error: &'a std::io::Error,
    pub attempt: usize,
}

impl InternalEvent for FileReadError<'_> {
    fn emit(self) {
        warn!(
            message = "Transient read error, will retry with backoff.",
            source_id = %self.source_id,
            error = %self.error,
            attempt = %self.attempt,
        );
        counter!("source_read_errors_total", "source_id" => self.source_id.to_owned())
            .increment(1);
    }
}
