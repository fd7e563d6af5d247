//! Kill and release strategies behind a single seam.
//!
//! A task is tracked either by an accounting group (authoritative member
//! list, freeze-and-enumerate force kill) or by its process group
//! (`killpg`). The supervisor never branches on which; it talks to the
//! trait.

use std::path::PathBuf;

use log::warn;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

use crate::error::{ExecutorError, Result};
use crate::isolation::cgroup::Cgroup;
use crate::recovery::{
    CgroupCleanup, CleanupHandle, ContainerCleanup, IsolationKind, ProcessGroupCleanup,
};

/// How a launched task is tracked, killed and released
pub trait IsolationBackend: Send + Sync {
    fn kind(&self) -> IsolationKind;

    /// Pids currently belonging to the task
    fn member_pids(&self) -> Vec<i32>;

    /// Deliver a signal to every tracked process
    fn signal_group(&self, sig: Signal) -> Result<()>;

    /// Force-kill the whole tracked tree
    fn kill_all(&self) -> Result<()>;

    fn oom_killed(&self) -> bool;

    /// Release tracking resources after the task has exited
    fn release(&self) -> Result<()>;

    /// Fill the kind-specific part of a cleanup record
    fn cleanup_payload(&self, handle: &mut CleanupHandle);
}

fn benign(e: Errno) -> bool {
    e == Errno::ESRCH
}

/// Accounting-group tracking; `root` is set when the task is also chrooted
pub struct CgroupBackend {
    cgroup: Cgroup,
    pid: Pid,
    root: Option<PathBuf>,
}

impl CgroupBackend {
    pub fn new(cgroup: Cgroup, pid: Pid, root: Option<PathBuf>) -> Self {
        Self { cgroup, pid, root }
    }

    pub fn cgroup(&self) -> &Cgroup {
        &self.cgroup
    }
}

impl IsolationBackend for CgroupBackend {
    fn kind(&self) -> IsolationKind {
        if self.root.is_some() {
            IsolationKind::Container
        } else {
            IsolationKind::Cgroup
        }
    }

    fn member_pids(&self) -> Vec<i32> {
        match self.cgroup.member_pids() {
            Ok(pids) => pids,
            Err(e) => {
                warn!("failed to list cgroup members: {}", e);
                vec![self.pid.as_raw()]
            }
        }
    }

    fn signal_group(&self, sig: Signal) -> Result<()> {
        let mut errors = Vec::new();
        for pid in self.member_pids() {
            match kill(Pid::from_raw(pid), sig) {
                Ok(()) => {}
                Err(e) if benign(e) => {}
                Err(e) => errors.push(ExecutorError::Syscall(format!(
                    "signal {} to {}: {}",
                    sig, pid, e
                ))),
            }
        }
        ExecutorError::aggregate(errors)
    }

    fn kill_all(&self) -> Result<()> {
        self.cgroup.kill_all().map(|_| ())
    }

    fn oom_killed(&self) -> bool {
        self.cgroup.oom_killed()
    }

    fn release(&self) -> Result<()> {
        self.cgroup.remove()
    }

    fn cleanup_payload(&self, handle: &mut CleanupHandle) {
        let cgroup = CgroupCleanup::from_cgroup(&self.cgroup);
        match &self.root {
            Some(root) => {
                handle.container = Some(ContainerCleanup {
                    root: root.clone(),
                    cgroup,
                });
            }
            None => handle.cgroup = Some(cgroup),
        }
    }
}

/// Plain process-group tracking for tasks without an accounting group
pub struct ProcessGroupBackend {
    pgid: Pid,
}

impl ProcessGroupBackend {
    pub fn new(pgid: Pid) -> Self {
        Self { pgid }
    }
}

impl IsolationBackend for ProcessGroupBackend {
    fn kind(&self) -> IsolationKind {
        IsolationKind::ProcessGroup
    }

    fn member_pids(&self) -> Vec<i32> {
        vec![self.pgid.as_raw()]
    }

    fn signal_group(&self, sig: Signal) -> Result<()> {
        match killpg(self.pgid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ExecutorError::Syscall(format!(
                "signal {} to group {}: {}",
                sig, self.pgid, e
            ))),
        }
    }

    fn kill_all(&self) -> Result<()> {
        self.signal_group(Signal::SIGKILL)
    }

    fn oom_killed(&self) -> bool {
        false
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }

    fn cleanup_payload(&self, handle: &mut CleanupHandle) {
        handle.process_group = Some(ProcessGroupCleanup {
            pgid: self.pgid.as_raw(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn empty_handle() -> CleanupHandle {
        CleanupHandle {
            version: "test".to_string(),
            executor_type: String::new(),
            pid: 0,
            start_time: 0,
            cgroup: None,
            container: None,
            process_group: None,
        }
    }

    #[test]
    fn test_process_group_kill_on_dead_group_is_success() {
        let backend = ProcessGroupBackend::new(Pid::from_raw(i32::MAX - 11));
        backend.kill_all().unwrap();
        backend.signal_group(Signal::SIGTERM).unwrap();
    }

    #[test]
    fn test_process_group_payload() {
        let backend = ProcessGroupBackend::new(Pid::from_raw(77));
        let mut handle = empty_handle();
        backend.cleanup_payload(&mut handle);
        assert_eq!(handle.process_group.unwrap().pgid, 77);
        assert_eq!(backend.kind(), IsolationKind::ProcessGroup);
    }

    #[test]
    fn test_cgroup_backend_kind_follows_root() {
        let cg = Cgroup::for_testing(PathBuf::from("/nonexistent/grp"));
        let bare = CgroupBackend::new(cg.clone(), Pid::from_raw(1), None);
        assert_eq!(bare.kind(), IsolationKind::Cgroup);

        let contained =
            CgroupBackend::new(cg, Pid::from_raw(1), Some(PathBuf::from("/tmp/task")));
        assert_eq!(contained.kind(), IsolationKind::Container);

        let mut handle = empty_handle();
        contained.cleanup_payload(&mut handle);
        let payload = handle.container.unwrap();
        assert_eq!(payload.root, PathBuf::from("/tmp/task"));
        assert!(handle.cgroup.is_none());
    }

    #[test]
    fn test_cgroup_backend_falls_back_to_main_pid() {
        let cg = Cgroup::for_testing(PathBuf::from("/nonexistent/grp"));
        let backend = CgroupBackend::new(cg, Pid::from_raw(42), None);
        assert_eq!(backend.member_pids(), vec![42]);
    }
}
