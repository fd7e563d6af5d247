//! Error types for executor operations

use std::io;
use thiserror::Error;

/// Result type for executor operations
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Errors that can occur while configuring, launching, or supervising a task
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Binary not executable: {0}")]
    NotExecutable(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Launch failed: {0}")]
    Launch(String),

    #[error("No process has been launched")]
    NoProcess,

    #[error("Process did not exit within {0} seconds of being killed")]
    ShutdownTimeout(u64),

    #[error("Wait deadline elapsed")]
    WaitDeadline,

    #[error("Stream IO error: {0}")]
    StreamIo(String),

    #[error("Unknown isolation kind: {0}")]
    UnknownIsolationKind(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("Recorded start time does not match live process {pid}: recorded {recorded}, found {found}")]
    PidReuse { pid: i32, recorded: u64, found: u64 },

    #[error("Shutdown completed with errors: {0}")]
    Aggregate(String),
}

impl ExecutorError {
    /// Combine several independent teardown failures into one error.
    /// Returns `Ok(())` when the list is empty.
    pub fn aggregate(errors: Vec<ExecutorError>) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        let joined = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Err(ExecutorError::Aggregate(joined))
    }
}
