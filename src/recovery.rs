//! Crash recovery: a serialized cleanup record written after launch, and a
//! registry of per-isolation-kind teardown routines an agent runs at startup
//! for tasks whose supervisor died.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use log::{debug, warn};
use nix::errno::Errno;
use nix::mount::{umount2, MntFlags};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::error::{ExecutorError, Result};
use crate::isolation::cgroup::Cgroup;
use crate::isolation::mount::mandatory_mounts;

/// Isolation schemes a cleanup record can name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationKind {
    /// Accounting group only, no private filesystem
    Cgroup,
    /// Full containment: chroot plus accounting group
    Container,
    /// Plain process group
    ProcessGroup,
}

impl IsolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationKind::Cgroup => "cgroup",
            IsolationKind::Container => "container",
            IsolationKind::ProcessGroup => "process_group",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "cgroup" => Ok(IsolationKind::Cgroup),
            "container" => Ok(IsolationKind::Container),
            "process_group" => Ok(IsolationKind::ProcessGroup),
            other => Err(ExecutorError::UnknownIsolationKind(other.to_string())),
        }
    }
}

/// Accounting-group paths recorded for teardown
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CgroupCleanup {
    pub v2_path: Option<PathBuf>,
    pub v1_paths: BTreeMap<String, PathBuf>,
}

impl CgroupCleanup {
    pub fn from_cgroup(cg: &Cgroup) -> Self {
        Self {
            v2_path: cg.unified_path().map(|p| p.to_path_buf()),
            v1_paths: cg.controller_paths().clone(),
        }
    }

    fn to_cgroup(&self) -> Cgroup {
        Cgroup::from_paths(self.v2_path.clone(), self.v1_paths.clone())
    }
}

/// Chroot record for contained tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerCleanup {
    pub root: PathBuf,
    pub cgroup: CgroupCleanup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessGroupCleanup {
    pub pgid: i32,
}

/// Everything a fresh agent process needs to tear a task down.
/// Serialized to JSON right after launch; the store it lives in is the
/// caller's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupHandle {
    /// Executor API version that wrote the record
    pub version: String,
    /// Isolation kind, dispatched through the recovery registry
    pub executor_type: String,
    pub pid: i32,
    /// Process start time, milliseconds since the epoch; guards against
    /// pid reuse
    pub start_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroup: Option<CgroupCleanup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerCleanup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_group: Option<ProcessGroupCleanup>,
}

impl CleanupHandle {
    pub fn persist(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| ExecutorError::Configuration(format!("cleanup handle encode: {}", e)))
    }

    pub fn parse(serialized: &str) -> Result<Self> {
        serde_json::from_str(serialized)
            .map_err(|e| ExecutorError::Configuration(format!("cleanup handle decode: {}", e)))
    }

    pub fn kind(&self) -> Result<IsolationKind> {
        IsolationKind::from_str(&self.executor_type)
    }
}

type Routine = fn(&CleanupHandle) -> Result<()>;

/// Teardown routines keyed by isolation kind, built once at agent startup
pub struct RecoveryRegistry {
    routines: Vec<(IsolationKind, Routine)>,
}

impl RecoveryRegistry {
    pub fn new() -> Self {
        Self {
            routines: Vec::new(),
        }
    }

    /// Registry covering every kind this crate can launch
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(IsolationKind::Cgroup, cleanup_cgroup);
        reg.register(IsolationKind::Container, cleanup_container);
        reg.register(IsolationKind::ProcessGroup, cleanup_process_group);
        reg
    }

    pub fn register(&mut self, kind: IsolationKind, routine: Routine) {
        self.routines.retain(|(k, _)| *k != kind);
        self.routines.push((kind, routine));
    }

    fn routine_for(&self, kind: IsolationKind) -> Option<Routine> {
        self.routines
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, r)| *r)
    }

    /// Recover one serialized handle: verify the recorded pid is still the
    /// same process, then run the kind's teardown routine.
    pub fn recover(&self, serialized: &str) -> Result<()> {
        let handle = CleanupHandle::parse(serialized)?;
        let kind = handle.kind()?;

        if handle.pid > 0 {
            match process_start_time_ms(handle.pid) {
                Ok(found) if found != handle.start_time => {
                    return Err(ExecutorError::PidReuse {
                        pid: handle.pid,
                        recorded: handle.start_time,
                        found,
                    });
                }
                Ok(_) => {}
                // process already gone; filesystem teardown still runs
                Err(_) => {
                    debug!("recovery: pid {} no longer exists", handle.pid);
                }
            }
        }

        let routine = self
            .routine_for(kind)
            .ok_or_else(|| ExecutorError::UnknownIsolationKind(kind.as_str().to_string()))?;
        routine(&handle)
    }
}

impl Default for RecoveryRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn cleanup_cgroup(handle: &CleanupHandle) -> Result<()> {
    let payload = handle
        .cgroup
        .as_ref()
        .ok_or_else(|| ExecutorError::Configuration("cgroup handle without paths".to_string()))?;
    let cg = payload.to_cgroup();
    cg.kill_all()?;
    cg.remove()
}

fn cleanup_container(handle: &CleanupHandle) -> Result<()> {
    let payload = handle.container.as_ref().ok_or_else(|| {
        ExecutorError::Configuration("container handle without payload".to_string())
    })?;
    let cg = payload.cgroup.to_cgroup();
    cg.kill_all()?;

    // Detach whatever mandatory mounts survived inside the dead root.
    // The root directory itself belongs to the driver.
    for entry in mandatory_mounts().iter().rev() {
        let target = match entry.target.strip_prefix("/") {
            Ok(rel) => payload.root.join(rel),
            Err(_) => payload.root.join(&entry.target),
        };
        if target.exists() {
            if let Err(e) = umount2(&target, MntFlags::MNT_DETACH) {
                if e != Errno::EINVAL && e != Errno::ENOENT {
                    warn!("recovery: detach {} failed: {}", target.display(), e);
                }
            }
        }
    }
    cg.remove()
}

fn cleanup_process_group(handle: &CleanupHandle) -> Result<()> {
    let payload = handle.process_group.as_ref().ok_or_else(|| {
        ExecutorError::Configuration("process group handle without pgid".to_string())
    })?;
    match killpg(Pid::from_raw(payload.pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ExecutorError::Syscall(format!(
            "killpg({}): {}",
            payload.pgid, e
        ))),
    }
}

/// Start time of a live process, milliseconds since the epoch. Combines the
/// kernel boot time with the process start offset in clock ticks.
pub fn process_start_time_ms(pid: i32) -> Result<u64> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid))?;
    let ticks = stat_start_ticks(&stat).ok_or_else(|| {
        ExecutorError::Syscall(format!("malformed /proc/{}/stat", pid))
    })?;
    let btime = boot_time_secs()?;
    let tck = clk_tck();
    Ok(btime * 1000 + ticks * 1000 / tck)
}

// field 22 of /proc/<pid>/stat, counted past the parenthesized comm
fn stat_start_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}

fn boot_time_secs() -> Result<u64> {
    let content = fs::read_to_string("/proc/stat")?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| ExecutorError::Syscall("btime missing from /proc/stat".to_string()))
}

fn clk_tck() -> u64 {
    let tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if tck > 0 {
        tck as u64
    } else {
        100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            IsolationKind::Cgroup,
            IsolationKind::Container,
            IsolationKind::ProcessGroup,
        ] {
            assert_eq!(IsolationKind::from_str(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind_is_hard_error() {
        let err = IsolationKind::from_str("qemu").unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownIsolationKind(_)));
    }

    #[test]
    fn test_handle_persist_and_parse() {
        let handle = CleanupHandle {
            version: "2.0.0".to_string(),
            executor_type: "process_group".to_string(),
            pid: 4242,
            start_time: 1_700_000_000_000,
            cgroup: None,
            container: None,
            process_group: Some(ProcessGroupCleanup { pgid: 4242 }),
        };
        let serialized = handle.persist().unwrap();
        let parsed = CleanupHandle::parse(&serialized).unwrap();
        assert_eq!(parsed.pid, 4242);
        assert_eq!(parsed.kind().unwrap(), IsolationKind::ProcessGroup);
        assert_eq!(parsed.process_group.unwrap().pgid, 4242);
        assert!(parsed.cgroup.is_none());
    }

    #[test]
    fn test_recover_rejects_unknown_type() {
        let serialized = r#"{"version":"2.0.0","executor_type":"qemu","pid":1,"start_time":0}"#;
        let err = RecoveryRegistry::with_defaults()
            .recover(serialized)
            .unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownIsolationKind(_)));
    }

    #[test]
    fn test_recover_refuses_reused_pid() {
        // our own pid is alive with a start time that cannot be zero
        let pid = std::process::id() as i32;
        let handle = CleanupHandle {
            version: "2.0.0".to_string(),
            executor_type: "process_group".to_string(),
            pid,
            start_time: 1,
            cgroup: None,
            container: None,
            process_group: Some(ProcessGroupCleanup { pgid: pid }),
        };
        let err = RecoveryRegistry::with_defaults()
            .recover(&handle.persist().unwrap())
            .unwrap_err();
        assert!(matches!(err, ExecutorError::PidReuse { .. }));
    }

    #[test]
    fn test_recover_dead_process_group_is_success() {
        let handle = CleanupHandle {
            version: "2.0.0".to_string(),
            executor_type: "process_group".to_string(),
            pid: 0,
            start_time: 0,
            cgroup: None,
            container: None,
            process_group: Some(ProcessGroupCleanup { pgid: i32::MAX - 7 }),
        };
        RecoveryRegistry::with_defaults()
            .recover(&handle.persist().unwrap())
            .unwrap();
    }

    #[test]
    fn test_stat_start_ticks_handles_comm_with_spaces() {
        let stat = "1234 (my (odd) proc) S 1 1234 1234 0 -1 4194560 100 0 0 0 \
                    5 3 0 0 20 0 1 0 987654 1000000 200 18446744073709551615";
        assert_eq!(stat_start_ticks(stat), Some(987654));
    }

    #[test]
    fn test_own_start_time_is_sane() {
        let ms = process_start_time_ms(std::process::id() as i32).unwrap();
        // after 2020-01-01 in epoch milliseconds
        assert!(ms > 1_577_836_800_000);
    }
}
