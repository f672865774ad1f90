//! Error types for the cadence-runner crate.

use cadence_scheduler::TaskFault;
use thiserror::Error;

/// Failures of the shell runner itself, as opposed to a task exiting non-zero.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The shell could not be started.
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// Reading the child's output or waiting for it failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The task exceeded its wall-clock budget and was killed.
    #[error("Task timed out after {secs}s")]
    Timeout { secs: u64 },
}

pub type Result<T> = std::result::Result<T, RunnerError>;

impl From<RunnerError> for TaskFault {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Spawn(msg) => TaskFault::Spawn(msg),
            RunnerError::Io(e) => TaskFault::Io(e),
            RunnerError::Timeout { secs } => TaskFault::Timeout { secs },
        }
    }
}
