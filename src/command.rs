//! Launch request types: the user command plus its isolation settings

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{ExecutorError, Result};

/// Namespace isolation mode requested for a single namespace kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationMode {
    /// Share the namespace with the host
    #[default]
    Host,
    /// Create a private namespace for the task
    Private,
}

impl IsolationMode {
    pub fn is_private(&self) -> bool {
        matches!(self, IsolationMode::Private)
    }
}

/// Resource limits requested for the task.
///
/// Memory values are megabytes; zero means unset. `memory_soft_mb` is a
/// reservation, `memory_hard_mb` is the enforced maximum.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resources {
    pub cpu_shares: u64,
    pub memory_hard_mb: u64,
    pub memory_soft_mb: u64,
    /// Cpuset specification, e.g. "0-3"; empty means unconstrained
    pub cpuset_cpus: String,
}

/// Mount propagation between host and task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropagationMode {
    /// No propagation in either direction
    #[default]
    Private,
    /// Host mounts propagate into the task, not the reverse
    HostToTask,
    /// Mounts propagate in both directions
    Bidirectional,
}

/// A host path to be made available inside the task filesystem
#[derive(Debug, Clone, PartialEq)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub task_path: PathBuf,
    pub readonly: bool,
    pub propagation: PropagationMode,
}

/// A device node to be created inside the task filesystem
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    pub host_path: PathBuf,
    pub task_path: PathBuf,
    /// Permission string in cgroup device notation, e.g. "rwm"
    pub permissions: String,
}

/// In-process capture buffer usable as an output destination
pub type OutputBuffer = Arc<Mutex<Vec<u8>>>;

/// Where a process output stream is written
#[derive(Debug, Clone, Default)]
pub enum OutputDestination {
    /// Drop the output
    #[default]
    Discard,
    /// Append to a file, created if missing
    File(PathBuf),
    /// Collect into an in-process buffer
    Buffer(OutputBuffer),
}

impl OutputDestination {
    /// Convenience constructor returning the destination and its buffer
    pub fn buffered() -> (Self, OutputBuffer) {
        let buf: OutputBuffer = Arc::new(Mutex::new(Vec::new()));
        (OutputDestination::Buffer(buf.clone()), buf)
    }
}

/// ExecCommand holds the user command, args, and isolation related settings.
/// Immutable once handed to `TaskExecutor::launch`.
#[derive(Debug, Clone, Default)]
pub struct ExecCommand {
    /// Command the user wants to run
    pub cmd: String,
    /// Arguments of the command
    pub args: Vec<String>,
    /// `KEY=val` environment variable pairs
    pub env: Vec<String>,
    /// Directory on the host allocated to the task
    pub task_dir: PathBuf,
    /// User to run the command as; empty means the current user
    pub user: String,
    /// Destination for the process stdout
    pub stdout: OutputDestination,
    /// Destination for the process stderr
    pub stderr: OutputDestination,
    /// Requested resource limits
    pub resources: Resources,
    /// Whether resource limits are enforced (full container isolation)
    pub resource_limits: bool,
    /// Place the process in an accounting group without enforcing limits.
    /// Allows precise cleanup of the whole process tree.
    pub basic_process_cgroup: bool,
    /// Disable pivot_root and fall back to chroot, for root filesystems
    /// that do not support pivot_root (e.g. ramdisk)
    pub no_pivot_root: bool,
    /// Host paths to be made available inside the task filesystem
    pub mounts: Vec<MountSpec>,
    /// Device nodes to be created inside the task filesystem
    pub devices: Vec<DeviceSpec>,
    /// PID namespace isolation mode
    pub mode_pid: IsolationMode,
    /// IPC namespace isolation mode
    pub mode_ipc: IsolationMode,
    /// Linux capabilities to grant, e.g. `CAP_NET_BIND_SERVICE`
    pub capabilities: Vec<String>,
}

impl ExecCommand {
    pub fn new(cmd: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args,
            ..Default::default()
        }
    }

    /// Look up a variable in the launch environment
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            if k == key {
                Some(v)
            } else {
                None
            }
        })
    }

    /// Working subdirectory for task-local files
    pub fn local_dir(&self) -> PathBuf {
        self.task_dir.join("local")
    }

    /// Translate a task-internal path to its host path using the declared
    /// mounts. Returns `None` when no mount covers the path.
    pub fn host_path_for(&self, task_path: &Path) -> Option<PathBuf> {
        self.mounts.iter().find_map(|m| {
            task_path
                .strip_prefix(&m.task_path)
                .ok()
                .map(|rest| m.host_path.join(rest))
        })
    }

    /// Whether any accounting group is requested for this task
    pub fn wants_cgroup(&self) -> bool {
        self.resource_limits || self.basic_process_cgroup
    }

    pub fn validate(&self) -> Result<()> {
        if self.cmd.is_empty() {
            return Err(ExecutorError::Configuration(
                "command cannot be empty".to_string(),
            ));
        }
        if self.task_dir.as_os_str().is_empty() {
            return Err(ExecutorError::Configuration(
                "task directory is required".to_string(),
            ));
        }
        Ok(())
    }
}
