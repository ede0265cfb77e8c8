use metrics::counter;

use super::InternalEvent;

#[derive(Debug)]
pub struct CheckpointCommitted<'a> {
    pub source_id: &'a str,
    pub offset: u64,
}

impl InternalEvent for CheckpointCommitted<'_> {
    fn emit(self) {
        trace!(
            message = "Checkpoint committed.",
            source_id = %self.source_id,
            offset = %self.offset,
        );
        counter!("checkpoints_committed_total", "source_id" => self.source_id.to_owned())
            .increment(1);
    }
}

#[derive(Debug)]
pub struct CheckpointWriteError<'a> {
    pub error: &'a std::io::Error,
}

impl InternalEvent for CheckpointWriteError<'_> {
    fn emit(self) {
        error!(message = "Failed to persist checkpoints.", error = %self.error);
        counter!("checkpoint_write_errors_total").increment(1);
    }
}
