//! Process execution: launching, supervision, kill backends and the two
//! exec surfaces (synchronous and streaming).

pub mod backend;
pub mod exec;
pub mod exec_streaming;
pub mod launcher;
pub mod stream;
pub mod supervisor;

pub use backend::{CgroupBackend, IsolationBackend, ProcessGroupBackend};
pub use exec::EXEC_OUTPUT_LIMIT;
pub use launcher::{lookup_bin, resolve_user, Credentials, RESTRICTED_PATH};
pub use stream::{session_pair, ExecInput, ExecOutput, ExecSession, SessionSender};
pub use supervisor::{ExitSignal, ProcessState, TaskExecutor, KILL_WAIT_SECS};
