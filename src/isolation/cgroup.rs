//! Accounting-group (cgroup) management, v1 and v2
//!
//! The host exposes either the legacy per-controller hierarchies (v1) or the
//! unified hierarchy (v2). The choice is detected once per host and hidden
//! behind `Cgroup`; callers only see paths, membership, limits, freezing and
//! removal.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::command::Resources;
use crate::error::{ExecutorError, Result};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Parent directory all task accounting groups live under
pub const CGROUP_PARENT: &str = "taskexec";

/// Controllers managed on cgroup v1 hosts
pub const V1_CONTROLLERS: &[&str] = &["cpu", "memory", "freezer", "cpuset"];

/// Which accounting-group scheme the host kernel exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

/// Cgroup filesystem root, overridable for tests
pub fn cgroup_root() -> PathBuf {
    std::env::var("TASKEXEC_CGROUP_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(CGROUP_ROOT))
}

/// Detect the accounting-group scheme exposed by the host
pub fn detect_version() -> CgroupVersion {
    if cgroup_root().join("cgroup.controllers").exists() {
        CgroupVersion::V2
    } else {
        CgroupVersion::V1
    }
}

/// Memory accounting read from a cgroup
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryAccounting {
    pub rss: u64,
    pub cache: u64,
    pub swap: u64,
    pub usage: u64,
    pub max_usage: u64,
}

/// CPU accounting read from a cgroup
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuAccounting {
    /// Total CPU time consumed, milliseconds
    pub usage_ms: u64,
    pub throttled_periods: u64,
    /// Total throttled time, nanoseconds
    pub throttled_ns: u64,
}

/// One task's accounting group: a unified path on v2, one path per
/// controller on v1.
#[derive(Debug, Clone)]
pub struct Cgroup {
    version: CgroupVersion,
    unified: Option<PathBuf>,
    controllers: BTreeMap<String, PathBuf>,
}

impl Cgroup {
    /// Accounting group for a task, derived deterministically from the
    /// allocation and task identifiers.
    pub fn for_task(alloc_id: &str, task_name: &str) -> Self {
        Self::with_leaf(&format!("{}.{}", alloc_id, task_name))
    }

    /// Accounting group with an explicit leaf name
    pub fn with_leaf(leaf: &str) -> Self {
        let root = cgroup_root();
        match detect_version() {
            CgroupVersion::V2 => Self {
                version: CgroupVersion::V2,
                unified: Some(root.join(CGROUP_PARENT).join(format!("{}.scope", leaf))),
                controllers: BTreeMap::new(),
            },
            CgroupVersion::V1 => {
                let controllers = V1_CONTROLLERS
                    .iter()
                    .map(|ctl| {
                        (
                            ctl.to_string(),
                            root.join(ctl).join(CGROUP_PARENT).join(leaf),
                        )
                    })
                    .collect();
                Self {
                    version: CgroupVersion::V1,
                    unified: None,
                    controllers,
                }
            }
        }
    }

    /// Rebuild a group from recorded paths (crash recovery)
    pub fn from_paths(unified: Option<PathBuf>, controllers: BTreeMap<String, PathBuf>) -> Self {
        let version = if unified.is_some() {
            CgroupVersion::V2
        } else {
            CgroupVersion::V1
        };
        Self {
            version,
            unified,
            controllers,
        }
    }

    /// Group rooted at an arbitrary directory, for tests
    pub fn for_testing(path: PathBuf) -> Self {
        Self {
            version: CgroupVersion::V2,
            unified: Some(path),
            controllers: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    /// Unified path (v2) if this group has one
    pub fn unified_path(&self) -> Option<&Path> {
        self.unified.as_deref()
    }

    /// Per-controller paths (v1)
    pub fn controller_paths(&self) -> &BTreeMap<String, PathBuf> {
        &self.controllers
    }

    fn dirs(&self) -> Vec<&Path> {
        match self.version {
            CgroupVersion::V2 => self.unified.iter().map(PathBuf::as_path).collect(),
            CgroupVersion::V1 => self.controllers.values().map(PathBuf::as_path).collect(),
        }
    }

    /// Directory whose files are consulted for membership and freezing:
    /// the unified path on v2, the freezer hierarchy on v1.
    fn primary_dir(&self) -> Result<&Path> {
        match self.version {
            CgroupVersion::V2 => self
                .unified
                .as_deref()
                .ok_or_else(|| ExecutorError::Cgroup("no unified path".to_string())),
            CgroupVersion::V1 => self
                .controllers
                .get("freezer")
                .or_else(|| self.controllers.values().next())
                .map(PathBuf::as_path)
                .ok_or_else(|| ExecutorError::Cgroup("no controller paths".to_string())),
        }
    }

    pub fn exists(&self) -> bool {
        self.dirs().iter().any(|d| d.exists())
    }

    /// Create the group directories
    pub fn create(&self) -> Result<()> {
        for dir in self.dirs() {
            fs::create_dir_all(dir).map_err(|e| {
                ExecutorError::Cgroup(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }
        if self.version == CgroupVersion::V1 {
            self.init_v1_cpuset();
        }
        Ok(())
    }

    // v1 cpuset groups are unusable until cpus/mems are populated; copy them
    // from the parent.
    fn init_v1_cpuset(&self) {
        let Some(dir) = self.controllers.get("cpuset") else {
            return;
        };
        for file in ["cpuset.cpus", "cpuset.mems"] {
            let target = dir.join(file);
            if read_value(&target).map(|v| v.is_empty()).unwrap_or(false) {
                if let Some(parent) = dir.parent() {
                    if let Ok(v) = read_value(&parent.join(file)) {
                        let _ = write_value(&target, &v);
                    }
                }
            }
        }
    }

    /// Apply resource limits. Values are expected to already be clamped and
    /// promoted by the profile builder.
    pub fn apply(&self, res: &Resources) -> Result<()> {
        match self.version {
            CgroupVersion::V2 => self.apply_v2(res),
            CgroupVersion::V1 => self.apply_v1(res),
        }
    }

    fn apply_v2(&self, res: &Resources) -> Result<()> {
        let dir = self.primary_dir()?.to_path_buf();
        if res.memory_hard_mb > 0 {
            write_value(&dir.join("memory.max"), &mb_to_bytes(res.memory_hard_mb))?;
            // Swap is disabled to keep the limit meaningful
            let _ = write_value(&dir.join("memory.swap.max"), "0");
        }
        if res.memory_soft_mb > 0 {
            write_value(&dir.join("memory.low"), &mb_to_bytes(res.memory_soft_mb))?;
        }
        if res.cpu_shares > 0 {
            write_value(
                &dir.join("cpu.weight"),
                &shares_to_weight(res.cpu_shares).to_string(),
            )?;
        }
        if !res.cpuset_cpus.is_empty() {
            write_value(&dir.join("cpuset.cpus"), &res.cpuset_cpus)?;
        }
        Ok(())
    }

    fn apply_v1(&self, res: &Resources) -> Result<()> {
        if res.memory_hard_mb > 0 {
            if let Some(dir) = self.controllers.get("memory") {
                write_value(
                    &dir.join("memory.limit_in_bytes"),
                    &mb_to_bytes(res.memory_hard_mb),
                )?;
                let _ = write_value(&dir.join("memory.swappiness"), "0");
            }
        }
        if res.memory_soft_mb > 0 {
            if let Some(dir) = self.controllers.get("memory") {
                write_value(
                    &dir.join("memory.soft_limit_in_bytes"),
                    &mb_to_bytes(res.memory_soft_mb),
                )?;
            }
        }
        if res.cpu_shares > 0 {
            if let Some(dir) = self.controllers.get("cpu") {
                write_value(&dir.join("cpu.shares"), &res.cpu_shares.to_string())?;
            }
        }
        if !res.cpuset_cpus.is_empty() {
            if let Some(dir) = self.controllers.get("cpuset") {
                write_value(&dir.join("cpuset.cpus"), &res.cpuset_cpus)?;
            }
        }
        Ok(())
    }

    /// Files a process writes its own pid (or "0") into to join the group
    pub fn procs_files(&self) -> Vec<PathBuf> {
        self.dirs().iter().map(|d| d.join("cgroup.procs")).collect()
    }

    /// Move a process into the group
    pub fn attach(&self, pid: Pid) -> Result<()> {
        for file in self.procs_files() {
            write_value(&file, &pid.as_raw().to_string())?;
        }
        Ok(())
    }

    /// Member pids of the group
    pub fn member_pids(&self) -> Result<Vec<i32>> {
        let file = self.primary_dir()?.join("cgroup.procs");
        let content = fs::read_to_string(&file).map_err(|e| {
            ExecutorError::Cgroup(format!("failed to read {}: {}", file.display(), e))
        })?;
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .collect())
    }

    /// Freeze the group so members cannot fork while being killed
    pub fn freeze(&self) -> Result<()> {
        match self.version {
            CgroupVersion::V2 => {
                write_value(&self.primary_dir()?.join("cgroup.freeze"), "1")?;
                self.await_state(|| self.frozen_v2())
            }
            CgroupVersion::V1 => {
                let dir = self.primary_dir()?.to_path_buf();
                write_value(&dir.join("freezer.state"), "FROZEN")?;
                self.await_state(|| {
                    read_value(&dir.join("freezer.state"))
                        .map(|s| s == "FROZEN")
                        .unwrap_or(true)
                })
            }
        }
    }

    fn frozen_v2(&self) -> bool {
        self.primary_dir()
            .ok()
            .and_then(|d| read_value(&d.join("cgroup.events")).ok())
            .map(|content| content.lines().any(|l| l.trim() == "frozen 1"))
            .unwrap_or(true)
    }

    // Freezing is asynchronous; poll briefly, then proceed regardless.
    fn await_state(&self, done: impl Fn() -> bool) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if done() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        warn!("cgroup did not reach frozen state within 2s, continuing");
        Ok(())
    }

    pub fn thaw(&self) -> Result<()> {
        match self.version {
            CgroupVersion::V2 => write_value(&self.primary_dir()?.join("cgroup.freeze"), "0"),
            CgroupVersion::V1 => write_value(&self.primary_dir()?.join("freezer.state"), "THAWED"),
        }
    }

    /// Kill every process in the group: freeze, enumerate, SIGKILL, thaw.
    /// Catches detached descendants that escaped the process group.
    pub fn kill_all(&self) -> Result<usize> {
        if !self.exists() {
            return Ok(0);
        }
        self.freeze()?;
        let pids = self.member_pids()?;
        let mut killed = 0;
        for pid in &pids {
            match kill(Pid::from_raw(*pid), Signal::SIGKILL) {
                Ok(()) => killed += 1,
                // the desired end state already holds
                Err(Errno::ESRCH) => {}
                Err(e) => {
                    warn!("failed to kill cgroup member {}: {}", pid, e);
                }
            }
        }
        self.thaw()?;
        debug!("killed {} of {} cgroup members", killed, pids.len());
        Ok(killed)
    }

    /// Remove the group directories. Fails while members remain.
    pub fn remove(&self) -> Result<()> {
        let mut errors = Vec::new();
        for dir in self.dirs() {
            if !dir.exists() {
                continue;
            }
            if let Err(e) = fs::remove_dir(dir) {
                errors.push(ExecutorError::Cgroup(format!(
                    "failed to remove {}: {}",
                    dir.display(),
                    e
                )));
            }
        }
        ExecutorError::aggregate(errors)
    }

    /// Memory accounting for the whole group
    pub fn memory_accounting(&self) -> MemoryAccounting {
        match self.version {
            CgroupVersion::V2 => self.memory_accounting_v2(),
            CgroupVersion::V1 => self.memory_accounting_v1(),
        }
    }

    fn memory_accounting_v2(&self) -> MemoryAccounting {
        let Ok(dir) = self.primary_dir() else {
            return MemoryAccounting::default();
        };
        let stat = read_kv(&dir.join("memory.stat"));
        MemoryAccounting {
            rss: stat.get("anon").copied().unwrap_or(0),
            cache: stat.get("file").copied().unwrap_or(0),
            swap: read_u64(&dir.join("memory.swap.current")),
            usage: read_u64(&dir.join("memory.current")),
            max_usage: read_u64(&dir.join("memory.peak")),
        }
    }

    fn memory_accounting_v1(&self) -> MemoryAccounting {
        let Some(dir) = self.controllers.get("memory") else {
            return MemoryAccounting::default();
        };
        let stat = read_kv(&dir.join("memory.stat"));
        MemoryAccounting {
            rss: stat.get("rss").copied().unwrap_or(0),
            cache: stat.get("cache").copied().unwrap_or(0),
            swap: stat.get("swap").copied().unwrap_or(0),
            usage: read_u64(&dir.join("memory.usage_in_bytes")),
            max_usage: read_u64(&dir.join("memory.max_usage_in_bytes")),
        }
    }

    /// CPU accounting for the whole group
    pub fn cpu_accounting(&self) -> CpuAccounting {
        match self.version {
            CgroupVersion::V2 => {
                let Ok(dir) = self.primary_dir() else {
                    return CpuAccounting::default();
                };
                let stat = read_kv(&dir.join("cpu.stat"));
                CpuAccounting {
                    usage_ms: stat.get("usage_usec").copied().unwrap_or(0) / 1000,
                    throttled_periods: stat.get("nr_throttled").copied().unwrap_or(0),
                    throttled_ns: stat.get("throttled_usec").copied().unwrap_or(0) * 1000,
                }
            }
            CgroupVersion::V1 => {
                let Some(dir) = self.controllers.get("cpu") else {
                    return CpuAccounting::default();
                };
                let stat = read_kv(&dir.join("cpu.stat"));
                CpuAccounting {
                    usage_ms: read_u64(&dir.join("cpuacct.usage")) / 1_000_000,
                    throttled_periods: stat.get("nr_throttled").copied().unwrap_or(0),
                    throttled_ns: stat.get("throttled_time").copied().unwrap_or(0),
                }
            }
        }
    }

    /// Whether the kernel OOM killer fired inside this group
    pub fn oom_killed(&self) -> bool {
        let file = match self.version {
            CgroupVersion::V2 => match self.primary_dir() {
                Ok(dir) => dir.join("memory.events"),
                Err(_) => return false,
            },
            CgroupVersion::V1 => match self.controllers.get("memory") {
                Some(dir) => dir.join("memory.oom_control"),
                None => return false,
            },
        };
        read_kv(&file).get("oom_kill").copied().unwrap_or(0) > 0
    }
}

/// cpu.shares (v1 range 2..=262144) to cpu.weight (v2 range 1..=10000)
pub fn shares_to_weight(shares: u64) -> u64 {
    1 + ((shares.saturating_sub(2)) * 9999) / 262142
}

fn mb_to_bytes(mb: u64) -> String {
    (mb * 1024 * 1024).to_string()
}

fn write_value(path: &Path, value: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| ExecutorError::Cgroup(format!("failed to open {}: {}", path.display(), e)))?;
    file.write_all(value.as_bytes())
        .map_err(|e| ExecutorError::Cgroup(format!("failed to write {}: {}", path.display(), e)))
}

fn read_value(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| ExecutorError::Cgroup(format!("failed to read {}: {}", path.display(), e)))
}

fn read_u64(path: &Path) -> u64 {
    read_value(path)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn read_kv(path: &Path) -> BTreeMap<String, u64> {
    let mut map = BTreeMap::new();
    if let Ok(content) = fs::read_to_string(path) {
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(k), Some(v)) = (parts.next(), parts.next()) {
                if let Ok(n) = v.parse() {
                    map.insert(k.to_string(), n);
                }
            }
        }
    }
    map
}
