//! taskexec: the task-execution core of a cluster-workload agent.
//!
//! A `TaskExecutor` launches one user command under a configurable Linux
//! isolation profile (accounting groups, namespaces, chroot, capabilities),
//! supervises it to completion, samples its resource usage, runs ad-hoc
//! commands in its context, and leaves behind a serialized cleanup handle
//! so a crashed agent can tear the task down after restart.

pub mod command;
pub mod error;
pub mod execution;
pub mod isolation;
pub mod recovery;
pub mod stats;

pub use command::{
    DeviceSpec, ExecCommand, IsolationMode, MountSpec, OutputDestination, PropagationMode,
    Resources,
};
pub use error::{ExecutorError, Result};
pub use execution::{
    session_pair, ExecInput, ExecOutput, ExecSession, ExitSignal, ProcessState, SessionSender,
    TaskExecutor,
};
pub use recovery::{CleanupHandle, RecoveryRegistry};
pub use stats::{StatsStream, TaskResourceUsage};

/// Executor API version recorded in every cleanup handle
pub const EXECUTOR_VERSION: &str = "2.0.0";
