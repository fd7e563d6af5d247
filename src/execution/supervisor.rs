//! Task supervision: launch, wait, signal, shutdown and the exec surfaces,
//! built around a one-shot exit signal written by a single wait thread.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::command::{ExecCommand, Resources};
use crate::error::{ExecutorError, Result};
use crate::execution::backend::{CgroupBackend, IsolationBackend, ProcessGroupBackend};
use crate::execution::exec::exec_with_deadline;
use crate::execution::launcher::{lookup_bin, make_executable, resolve_user, spawn};
use crate::execution::stream::ExecSession;
use crate::execution::exec_streaming;
use crate::isolation::cgroup::Cgroup;
use crate::isolation::build_profile;
use crate::recovery::{process_start_time_ms, CleanupHandle};
use crate::stats::{self, StatsStream};
use crate::EXECUTOR_VERSION;

/// Bound on how long a shutdown waits after the force kill
pub const KILL_WAIT_SECS: u64 = 15;

/// (exit_code, signal) from a wait outcome. Signal deaths encode as
/// `128 + signal`; a failed wait reports the -2 "could not wait" sentinel,
/// distinct from the -1 "still running" value launch hands out.
fn decode_status(status: std::io::Result<std::process::ExitStatus>) -> (i32, i32) {
    use std::os::unix::process::ExitStatusExt;
    match status {
        Ok(status) => {
            let signal = status.signal().unwrap_or(0);
            (status.code().unwrap_or(128 + signal), signal)
        }
        Err(_) => (-2, 0),
    }
}

/// Terminal (or, for a freshly launched task, provisional) process state.
/// `exit_code` is `-1` while running; a process killed by a signal reports
/// `128 + signal`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessState {
    pub pid: i32,
    pub exit_code: i32,
    pub signal: i32,
    pub oom_killed: bool,
    pub time: DateTime<Utc>,
}

/// One-shot completion slot. The wait thread is the only writer; any number
/// of readers block on it and all observe the identical value.
pub struct ExitSignal {
    slot: Mutex<Option<ProcessState>>,
    cond: Condvar,
}

impl ExitSignal {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// First write wins; later writes are ignored
    pub(crate) fn set(&self, state: ProcessState) {
        let mut guard = match self.slot.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if guard.is_none() {
            *guard = Some(state);
            self.cond.notify_all();
        }
    }

    pub fn peek(&self) -> Option<ProcessState> {
        match self.slot.lock() {
            Ok(g) => *g,
            Err(p) => *p.into_inner(),
        }
    }

    pub fn wait(&self) -> ProcessState {
        let mut guard = match self.slot.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        loop {
            if let Some(state) = *guard {
                return state;
            }
            guard = match self.cond.wait(guard) {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<ProcessState> {
        let deadline = Instant::now() + timeout;
        let mut guard = match self.slot.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        loop {
            if let Some(state) = *guard {
                return Some(state);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            guard = match self.cond.wait_timeout(guard, remaining) {
                Ok((g, _)) => g,
                Err(p) => p.into_inner().0,
            };
        }
    }
}

impl Default for ExitSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Supervises exactly one task process from launch to release
pub struct TaskExecutor {
    command: Option<ExecCommand>,
    pid: Option<Pid>,
    cgroup: Option<Cgroup>,
    backend: Option<Arc<dyn IsolationBackend>>,
    exit: Arc<ExitSignal>,
    handle: Option<CleanupHandle>,
}

impl TaskExecutor {
    pub fn new() -> Self {
        Self {
            command: None,
            pid: None,
            cgroup: None,
            backend: None,
            exit: Arc::new(ExitSignal::new()),
            handle: None,
        }
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid.map(|p| p.as_raw())
    }

    /// Cleanup record registered at launch; serialize with
    /// `CleanupHandle::persist` and store it wherever recovery reads from.
    pub fn cleanup_handle(&self) -> Option<&CleanupHandle> {
        self.handle.as_ref()
    }

    /// Launch the task. On success the process is running under its full
    /// isolation profile and the returned state carries exit_code -1.
    pub fn launch(&mut self, command: ExecCommand) -> Result<ProcessState> {
        if self.pid.is_some() {
            return Err(ExecutorError::Launch(
                "a process has already been launched".to_string(),
            ));
        }

        let profile = build_profile(&command)?;

        // everything that can fail without touching the system comes first,
        // so a bad request never leaves accounting-group directories behind
        let bin = lookup_bin(&command)?;
        make_executable(&bin, &command.task_dir)?;
        let creds = resolve_user(&command.user)?;

        let remove_group = |cg: &crate::isolation::cgroup::Cgroup| {
            if let Err(re) = cg.remove() {
                warn!("failed to remove accounting group after launch error: {}", re);
            }
        };
        if let Some(cg) = &profile.cgroup {
            cg.create()?;
            if command.resource_limits {
                if let Err(e) = cg.apply(&profile.resources) {
                    remove_group(cg);
                    return Err(e);
                }
            }
        }

        let launched = match spawn(&bin, &command, &profile, creds) {
            Ok(l) => l,
            Err(e) => {
                if let Some(cg) = &profile.cgroup {
                    remove_group(cg);
                }
                return Err(e);
            }
        };
        let pid = Pid::from_raw(launched.child.id() as i32);

        let backend: Arc<dyn IsolationBackend> = match profile.cgroup.clone() {
            Some(cg) => Arc::new(CgroupBackend::new(
                cg,
                pid,
                profile.contained.then(|| profile.rootfs.clone()),
            )),
            None => Arc::new(ProcessGroupBackend::new(pid)),
        };

        let start_time = process_start_time_ms(pid.as_raw()).unwrap_or_else(|e| {
            warn!("could not read start time of {}: {}", pid, e);
            0
        });
        let mut handle = CleanupHandle {
            version: EXECUTOR_VERSION.to_string(),
            executor_type: backend.kind().as_str().to_string(),
            pid: pid.as_raw(),
            start_time,
            cgroup: None,
            container: None,
            process_group: None,
        };
        backend.cleanup_payload(&mut handle);

        self.spawn_wait_thread(launched, pid, backend.clone());

        self.cgroup = profile.cgroup;
        self.command = Some(command);
        self.pid = Some(pid);
        self.backend = Some(backend);
        self.handle = Some(handle);

        Ok(ProcessState {
            pid: pid.as_raw(),
            exit_code: -1,
            signal: 0,
            oom_killed: false,
            time: Utc::now(),
        })
    }

    fn spawn_wait_thread(
        &self,
        mut launched: crate::execution::launcher::LaunchedProcess,
        pid: Pid,
        backend: Arc<dyn IsolationBackend>,
    ) {
        let exit = self.exit.clone();
        std::thread::spawn(move || {
            let status = launched.child.wait();
            if let Err(e) = &status {
                warn!("wait on pid {} failed: {}", pid, e);
            }
            let (exit_code, signal) = decode_status(status);
            for t in launched.io_threads.drain(..) {
                let _ = t.join();
            }
            let oom_killed = backend.oom_killed();
            debug!(
                "pid {} exited: code {} signal {} oom {}",
                pid, exit_code, signal, oom_killed
            );
            exit.set(ProcessState {
                pid: pid.as_raw(),
                exit_code,
                signal,
                oom_killed,
                time: Utc::now(),
            });
        });
    }

    /// Block until the task exits, or the deadline elapses. The deadline
    /// does not consume or alter the terminal state; a later call still
    /// observes it.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<ProcessState> {
        if self.pid.is_none() {
            return Err(ExecutorError::NoProcess);
        }
        match timeout {
            None => Ok(self.exit.wait()),
            Some(t) => self.exit.wait_timeout(t).ok_or(ExecutorError::WaitDeadline),
        }
    }

    /// Deliver a signal to every process the task tracks. Goes through the
    /// isolation backend so accounting-group members (and, in a private pid
    /// namespace, the task behind its shim) all receive it. Processes that
    /// already exited count as success.
    pub fn signal(&self, sig: Signal) -> Result<()> {
        let backend = self.backend.as_ref().ok_or(ExecutorError::NoProcess)?;
        backend.signal_group(sig)
    }

    /// Stop the task: optional graceful signal (default SIGINT) with a grace
    /// period, then a force kill of the whole tracked group, a bounded wait,
    /// and resource release. Idempotent; a no-op when nothing was launched.
    /// Independent teardown failures are aggregated, never short-circuited.
    pub fn shutdown(&mut self, signal: Option<Signal>, grace: Duration) -> Result<()> {
        if self.pid.is_none() {
            return Ok(());
        }
        let backend = match &self.backend {
            Some(b) => b.clone(),
            None => return Ok(()),
        };
        let mut errors = Vec::new();

        if self.exit.peek().is_none() {
            if !grace.is_zero() {
                let sig = signal.unwrap_or(Signal::SIGINT);
                if let Err(e) = backend.signal_group(sig) {
                    errors.push(e);
                }
                self.exit.wait_timeout(grace);
            }
            if self.exit.peek().is_none() {
                if let Err(e) = backend.kill_all() {
                    errors.push(e);
                }
                if self
                    .exit
                    .wait_timeout(Duration::from_secs(KILL_WAIT_SECS))
                    .is_none()
                {
                    errors.push(ExecutorError::ShutdownTimeout(KILL_WAIT_SECS));
                }
            }
        }

        if let Err(e) = backend.release() {
            errors.push(e);
        }
        ExecutorError::aggregate(errors)
    }

    /// Reserved; limits cannot be changed on a live task yet
    pub fn update_resources(&mut self, _resources: &Resources) -> Result<()> {
        Ok(())
    }

    /// Ad-hoc command in the task context; combined output capped at 32 KiB,
    /// killed at the deadline.
    pub fn exec(
        &mut self,
        deadline: Instant,
        name: &str,
        args: &[String],
    ) -> Result<(Vec<u8>, i32)> {
        let command = self.command.as_ref().ok_or(ExecutorError::NoProcess)?;
        exec_with_deadline(command, self.cgroup.as_ref(), deadline, name, args)
    }

    /// Interactive exec session in the task context
    pub fn exec_streaming(
        &mut self,
        cmd_args: Vec<String>,
        tty: bool,
        session: ExecSession,
    ) -> Result<()> {
        let command = self.command.as_ref().ok_or(ExecutorError::NoProcess)?;
        exec_streaming::run(command, self.cgroup.as_ref(), cmd_args, tty, session)
    }

    /// Periodic resource usage sampling; first sample is immediate, then one
    /// per interval (default 5s). Dropping the stream stops the loop.
    pub fn stats(&self, interval: Option<Duration>) -> Result<StatsStream> {
        let pid = self.pid.ok_or(ExecutorError::NoProcess)?;
        Ok(stats::start(
            pid.as_raw(),
            self.cgroup.clone(),
            self.exit.clone(),
            interval,
        ))
    }
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}
