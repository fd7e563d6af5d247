//! Builds the concrete isolation profile a launch request resolves to:
//! namespaces, mount table, devices, capabilities and accounting group.

use std::path::PathBuf;

use log::warn;
use nix::sched::CloneFlags;
use uuid::Uuid;

use crate::command::{ExecCommand, Resources};
use crate::error::{ExecutorError, Result};
use crate::isolation::capability::CapabilitySet;
use crate::isolation::cgroup::Cgroup;
use crate::isolation::mount::{bind_entry, mandatory_mounts, MountEntry};

/// Kernel bounds for cpu.shares
pub const CPU_SHARES_MIN: u64 = 2;
pub const CPU_SHARES_MAX: u64 = 262_144;

/// Launch-environment key naming the allocation a task belongs to
pub const ENV_ALLOC_ID: &str = "ALLOC_ID";
/// Launch-environment key naming the task within its allocation
pub const ENV_TASK_NAME: &str = "TASK_NAME";

/// Which private namespaces the task gets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceSet {
    pub mount: bool,
    pub pid: bool,
    pub ipc: bool,
}

impl NamespaceSet {
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        flags
    }

    pub fn enabled_count(&self) -> usize {
        [self.mount, self.pid, self.ipc]
            .iter()
            .filter(|b| **b)
            .count()
    }
}

/// Resolved isolation settings for one launch
#[derive(Debug, Clone)]
pub struct IsolationProfile {
    /// Whether the task runs chrooted with namespaces and mounts
    pub contained: bool,
    /// Root of the task filesystem when contained
    pub rootfs: PathBuf,
    pub no_pivot_root: bool,
    pub namespaces: NamespaceSet,
    pub mounts: Vec<MountEntry>,
    pub devices: Vec<crate::command::DeviceSpec>,
    pub capabilities: CapabilitySet,
    pub cgroup: Option<Cgroup>,
    /// Limits after clamping and promotion
    pub resources: Resources,
}

/// Resolve a launch request into a concrete profile.
///
/// Full containment (namespaces, chroot, mounts, capabilities) applies only
/// when `resource_limits` is set; `basic_process_cgroup` alone yields an
/// uncontained process tracked by an accounting group.
pub fn build_profile(command: &ExecCommand) -> Result<IsolationProfile> {
    command.validate()?;

    let resources = normalize_resources(&command.resources);
    let cgroup = cgroup_for(command)?;

    if !command.resource_limits {
        return Ok(IsolationProfile {
            contained: false,
            rootfs: command.task_dir.clone(),
            no_pivot_root: command.no_pivot_root,
            namespaces: NamespaceSet::default(),
            mounts: Vec::new(),
            devices: Vec::new(),
            capabilities: CapabilitySet::all_supported(),
            cgroup,
            resources,
        });
    }

    for m in &command.mounts {
        if !m.host_path.exists() {
            return Err(ExecutorError::Configuration(format!(
                "mount source does not exist: {}",
                m.host_path.display()
            )));
        }
    }
    for d in &command.devices {
        if !d.host_path.exists() {
            return Err(ExecutorError::Configuration(format!(
                "device does not exist: {}",
                d.host_path.display()
            )));
        }
    }

    let mut mounts = mandatory_mounts();
    mounts.extend(command.mounts.iter().map(bind_entry));

    let capabilities = if command.capabilities.is_empty() {
        CapabilitySet::all_supported()
    } else {
        CapabilitySet::from_names(&command.capabilities)?
    };

    Ok(IsolationProfile {
        contained: true,
        rootfs: command.task_dir.clone(),
        no_pivot_root: command.no_pivot_root,
        namespaces: NamespaceSet {
            // mount namespace is unconditional for contained tasks
            mount: true,
            pid: command.mode_pid.is_private(),
            ipc: command.mode_ipc.is_private(),
        },
        mounts,
        devices: command.devices.clone(),
        capabilities,
        cgroup,
        resources,
    })
}

/// Clamp cpu shares to the kernel range and promote a soft memory limit to
/// a hard one when no hard limit is set.
fn normalize_resources(res: &Resources) -> Resources {
    let mut out = res.clone();
    if out.cpu_shares > 0 {
        let clamped = out.cpu_shares.clamp(CPU_SHARES_MIN, CPU_SHARES_MAX);
        if clamped != out.cpu_shares {
            warn!(
                "cpu shares {} outside {}..={}, clamped to {}",
                out.cpu_shares, CPU_SHARES_MIN, CPU_SHARES_MAX, clamped
            );
            out.cpu_shares = clamped;
        }
    }
    if out.memory_hard_mb == 0 && out.memory_soft_mb > 0 {
        out.memory_hard_mb = out.memory_soft_mb;
        out.memory_soft_mb = 0;
    }
    out
}

fn cgroup_for(command: &ExecCommand) -> Result<Option<Cgroup>> {
    if !command.wants_cgroup() {
        return Ok(None);
    }
    if command.resource_limits {
        let alloc_id = command.env_value(ENV_ALLOC_ID).filter(|v| !v.is_empty());
        let task_name = command.env_value(ENV_TASK_NAME).filter(|v| !v.is_empty());
        match (alloc_id, task_name) {
            (Some(alloc), Some(task)) => Ok(Some(Cgroup::for_task(alloc, task))),
            _ => Err(ExecutorError::Configuration(format!(
                "{} and {} must be set in the launch environment when resource limits are enforced",
                ENV_ALLOC_ID, ENV_TASK_NAME
            ))),
        }
    } else {
        // tracking only; any unique leaf will do
        Ok(Some(Cgroup::with_leaf(&Uuid::new_v4().to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{IsolationMode, MountSpec, PropagationMode};
    use std::path::Path;
    use tempfile::tempdir;

    fn base_command() -> ExecCommand {
        let mut cmd = ExecCommand::new("/bin/echo", vec!["hi".to_string()]);
        cmd.task_dir = PathBuf::from("/tmp/task");
        cmd
    }

    #[test]
    fn test_soft_limit_promoted_to_hard() {
        let res = normalize_resources(&Resources {
            memory_soft_mb: 100,
            ..Default::default()
        });
        assert_eq!(res.memory_hard_mb, 100);
        assert_eq!(res.memory_soft_mb, 0);
    }

    #[test]
    fn test_soft_limit_kept_when_hard_set() {
        let res = normalize_resources(&Resources {
            memory_hard_mb: 256,
            memory_soft_mb: 100,
            ..Default::default()
        });
        assert_eq!(res.memory_hard_mb, 256);
        assert_eq!(res.memory_soft_mb, 100);
    }

    #[test]
    fn test_cpu_shares_clamped() {
        let low = normalize_resources(&Resources {
            cpu_shares: 1,
            ..Default::default()
        });
        assert_eq!(low.cpu_shares, CPU_SHARES_MIN);

        let high = normalize_resources(&Resources {
            cpu_shares: 1_000_000,
            ..Default::default()
        });
        assert_eq!(high.cpu_shares, CPU_SHARES_MAX);

        let zero = normalize_resources(&Resources::default());
        assert_eq!(zero.cpu_shares, 0);
    }

    #[test]
    fn test_uncontained_profile_has_no_namespaces() {
        let profile = build_profile(&base_command()).unwrap();
        assert!(!profile.contained);
        assert_eq!(profile.namespaces.enabled_count(), 0);
        assert!(profile.mounts.is_empty());
        assert!(profile.cgroup.is_none());
    }

    #[test]
    fn test_contained_profile_always_has_mount_namespace() {
        let mut cmd = base_command();
        cmd.resource_limits = true;
        cmd.env = vec!["ALLOC_ID=a1".to_string(), "TASK_NAME=web".to_string()];
        let profile = build_profile(&cmd).unwrap();
        assert!(profile.contained);
        assert!(profile.namespaces.mount);
        assert!(!profile.namespaces.pid);
        assert!(!profile.namespaces.ipc);
    }

    #[test]
    fn test_private_modes_set_clone_flags() {
        let mut cmd = base_command();
        cmd.resource_limits = true;
        cmd.env = vec!["ALLOC_ID=a1".to_string(), "TASK_NAME=web".to_string()];
        cmd.mode_pid = IsolationMode::Private;
        cmd.mode_ipc = IsolationMode::Private;
        let profile = build_profile(&cmd).unwrap();
        let flags = profile.namespaces.to_clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
    }

    #[test]
    fn test_resource_limits_require_identity_env() {
        let mut cmd = base_command();
        cmd.resource_limits = true;
        let err = build_profile(&cmd).unwrap_err();
        assert!(matches!(err, ExecutorError::Configuration(_)));
    }

    #[test]
    fn test_mandatory_mounts_precede_binds() {
        let tmp = tempdir().unwrap();
        let mut cmd = base_command();
        cmd.resource_limits = true;
        cmd.env = vec!["ALLOC_ID=a1".to_string(), "TASK_NAME=web".to_string()];
        cmd.mounts = vec![MountSpec {
            host_path: tmp.path().to_path_buf(),
            task_path: PathBuf::from("/data"),
            readonly: false,
            propagation: PropagationMode::Private,
        }];
        let profile = build_profile(&cmd).unwrap();
        let targets: Vec<_> = profile
            .mounts
            .iter()
            .map(|m| m.target.as_path())
            .collect();
        let proc_idx = targets.iter().position(|t| *t == Path::new("/proc")).unwrap();
        let data_idx = targets.iter().position(|t| *t == Path::new("/data")).unwrap();
        assert!(proc_idx < data_idx);
    }

    #[test]
    fn test_unresolvable_mount_fails() {
        let mut cmd = base_command();
        cmd.resource_limits = true;
        cmd.env = vec!["ALLOC_ID=a1".to_string(), "TASK_NAME=web".to_string()];
        cmd.mounts = vec![MountSpec {
            host_path: PathBuf::from("/nonexistent/source"),
            task_path: PathBuf::from("/data"),
            readonly: false,
            propagation: PropagationMode::Private,
        }];
        assert!(build_profile(&cmd).is_err());
    }

    #[test]
    fn test_basic_cgroup_gets_random_leaf() {
        let mut cmd = base_command();
        cmd.basic_process_cgroup = true;
        let a = build_profile(&cmd).unwrap();
        let b = build_profile(&cmd).unwrap();
        let (Some(ca), Some(cb)) = (a.cgroup.clone(), b.cgroup.clone()) else {
            panic!("expected accounting groups");
        };
        let dirs = |cg: &Cgroup| {
            (
                cg.unified_path().map(|p| p.to_path_buf()),
                cg.controller_paths().clone(),
            )
        };
        assert_ne!(dirs(&ca), dirs(&cb));
        assert!(!a.contained);
    }
}
