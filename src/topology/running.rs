//! Handle over a spawned pipeline: completion tracking and two-phase stop.

use std::time::Duration;

use tokio::task::JoinHandle;

use super::TopologyError;
use crate::shutdown::ShutdownCoordinator;

/// Grace period after the force signal before remaining tasks are aborted.
const FORCE_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

pub(super) struct TaskHandle {
    name: String,
    handle: JoinHandle<Result<(), crate::Error>>,
}

impl TaskHandle {
    pub(super) fn spawn<F>(name: String, future: F) -> Self
    where
        F: std::future::Future<Output = Result<(), crate::Error>> + Send + 'static,
    {
        Self {
            name,
            handle: tokio::spawn(future),
        }
    }
}

pub struct RunningTopology {
    state: PipelineState,
    tasks: Vec<TaskHandle>,
    shutdown: ShutdownCoordinator,
    drain_deadline: Duration,
}

impl RunningTopology {
    pub(super) fn new(
        tasks: Vec<TaskHandle>,
        shutdown: ShutdownCoordinator,
        drain_deadline: Duration,
    ) -> Self {
        Self {
            state: PipelineState::Starting,
            tasks,
            shutdown,
            drain_deadline,
        }
    }

    pub(super) fn mark_running(&mut self) {
        self.state = PipelineState::Running;
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Wait for every task to finish on its own. In batch mode this resolves
    /// once all sources hit end of input and the consumers drain; in tail
    /// mode it only resolves on failure.
    ///
    /// The first task failure forces the rest of the pipeline down and is
    /// returned once all tasks have stopped.
    ///
    /// Cancel-safe: a handle leaves `tasks` only after its result has been
    /// consumed, so a caller racing `wait` against a signal can drop this
    /// future and still stop or abort every remaining task later.
    pub async fn wait(&mut self) -> Result<(), TopologyError> {
        let mut first_error = None;
        while let Some(task) = self.tasks.last_mut() {
            let result = (&mut task.handle).await;
            let name = std::mem::take(&mut task.name);
            self.tasks.pop();
            match result {
                Ok(Ok(())) => debug!(message = "Task finished.", task = %name),
                Ok(Err(error)) => {
                    error!(message = "Task failed.", task = %name, error = %error);
                    if first_error.is_none() {
                        first_error = Some(TopologyError::TaskFailed {
                            name,
                            message: error.to_string(),
                        });
                        self.shutdown.force_shutdown();
                    }
                }
                Err(join_error) if join_error.is_cancelled() => {}
                Err(_) => {
                    error!(message = "Task panicked.", task = %name);
                    if first_error.is_none() {
                        first_error = Some(TopologyError::TaskPanicked { name });
                        self.shutdown.force_shutdown();
                    }
                }
            }
        }
        match first_error {
            Some(error) => {
                self.state = PipelineState::Failed;
                Err(error)
            }
            None => {
                self.state = PipelineState::Stopped;
                Ok(())
            }
        }
    }

    /// Two-phase stop. The graceful phase stops sources and lets consumers
    /// flush and commit within the drain deadline; past the deadline, the
    /// force signal abandons in-flight work, and anything still running
    /// shortly after is aborted.
    pub async fn stop(mut self) -> Result<(), TopologyError> {
        self.state = PipelineState::Draining;
        info!(
            message = "Draining pipeline.",
            deadline_ms = %self.drain_deadline.as_millis(),
        );
        self.shutdown.begin_shutdown();
        if let Ok(result) = tokio::time::timeout(self.drain_deadline, self.wait()).await {
            return result;
        }

        warn!(message = "Drain deadline elapsed, forcing shutdown.");
        self.shutdown.force_shutdown();
        match tokio::time::timeout(FORCE_SHUTDOWN_GRACE, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    message = "Tasks did not stop after force signal, aborting.",
                    remaining = %self.tasks.len(),
                );
                for task in &self.tasks {
                    task.handle.abort();
                }
                Err(TopologyError::DrainTimedOut)
            }
        }
    }
}
