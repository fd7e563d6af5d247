//! Task filesystem construction: mandatory mounts, bind mounts, masked and
//! readonly paths, and the pivot_root/chroot entry into the task root.
//!
//! Everything in this module past the table builders runs in the child
//! between `unshare(CLONE_NEWNS)` and `execve`; failures surface as
//! `io::Error` so they cross the `pre_exec` boundary intact.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chdir, chroot, pivot_root};

use crate::command::{DeviceSpec, MountSpec, PropagationMode};

/// Paths hidden from the task by bind-mounting /dev/null over them
pub const MASKED_PATHS: &[&str] = &["/proc/kcore", "/sys/firmware"];

/// Paths remounted read-only inside the task
pub const READONLY_PATHS: &[&str] = &[
    "/proc/sys",
    "/proc/sysrq-trigger",
    "/proc/irq",
    "/proc/bus",
];

/// One mount operation to perform inside the task root
#[derive(Debug, Clone)]
pub struct MountEntry {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
    /// Extra propagation remount applied after the mount itself
    pub propagation: Option<MsFlags>,
}

/// The fixed mount table every contained task receives, in order.
/// /dev must precede /dev/pts, /dev/shm and /dev/mqueue.
pub fn mandatory_mounts() -> Vec<MountEntry> {
    vec![
        MountEntry {
            source: PathBuf::from("tmpfs"),
            target: PathBuf::from("/dev"),
            fstype: Some("tmpfs".to_string()),
            flags: MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            data: Some("mode=755".to_string()),
            propagation: None,
        },
        MountEntry {
            source: PathBuf::from("proc"),
            target: PathBuf::from("/proc"),
            fstype: Some("proc".to_string()),
            flags: MsFlags::empty(),
            data: None,
            propagation: None,
        },
        MountEntry {
            source: PathBuf::from("devpts"),
            target: PathBuf::from("/dev/pts"),
            fstype: Some("devpts".to_string()),
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            data: Some("newinstance,ptmxmode=0666,mode=0620,gid=5".to_string()),
            propagation: None,
        },
        MountEntry {
            source: PathBuf::from("shm"),
            target: PathBuf::from("/dev/shm"),
            fstype: Some("tmpfs".to_string()),
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            data: Some("mode=1777,size=65536k".to_string()),
            propagation: None,
        },
        MountEntry {
            source: PathBuf::from("mqueue"),
            target: PathBuf::from("/dev/mqueue"),
            fstype: Some("mqueue".to_string()),
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            data: None,
            propagation: None,
        },
        MountEntry {
            source: PathBuf::from("sysfs"),
            target: PathBuf::from("/sys"),
            fstype: Some("sysfs".to_string()),
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV
                | MsFlags::MS_RDONLY,
            data: None,
            propagation: None,
        },
    ]
}

/// Map a requested propagation mode to the remount flag applied after the
/// bind mount.
pub fn propagation_flags(mode: PropagationMode) -> MsFlags {
    match mode {
        PropagationMode::Private => MsFlags::MS_PRIVATE,
        PropagationMode::HostToTask => MsFlags::MS_SLAVE,
        PropagationMode::Bidirectional => MsFlags::MS_SHARED,
    }
}

/// Bind mount entry for a user-declared mount
pub fn bind_entry(spec: &MountSpec) -> MountEntry {
    let mut flags = MsFlags::MS_BIND | MsFlags::MS_REC;
    if spec.readonly {
        flags |= MsFlags::MS_RDONLY;
    }
    MountEntry {
        source: spec.host_path.clone(),
        target: spec.task_path.clone(),
        fstype: None,
        flags,
        data: None,
        propagation: Some(propagation_flags(spec.propagation)),
    }
}

fn io_err(what: &str, e: nix::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{}: {}", what, e))
}

/// Resolve a task-internal absolute target against the root directory
fn target_in_root(root: &Path, target: &Path) -> PathBuf {
    match target.strip_prefix("/") {
        Ok(rel) => root.join(rel),
        Err(_) => root.join(target),
    }
}

fn apply_entry(root: &Path, entry: &MountEntry) -> io::Result<()> {
    let target = target_in_root(root, &entry.target);
    if entry.fstype.is_some() || entry.source.is_dir() {
        fs::create_dir_all(&target)?;
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if !target.exists() {
            fs::File::create(&target)?;
        }
    }
    mount(
        Some(entry.source.as_path()),
        &target,
        entry.fstype.as_deref(),
        entry.flags,
        entry.data.as_deref(),
    )
    .map_err(|e| io_err("mount", e))?;

    // MS_RDONLY on a bind mount needs a second remount pass
    if entry.flags.contains(MsFlags::MS_BIND) && entry.flags.contains(MsFlags::MS_RDONLY) {
        mount(
            Some(entry.source.as_path()),
            &target,
            None::<&str>,
            entry.flags | MsFlags::MS_REMOUNT,
            None::<&str>,
        )
        .map_err(|e| io_err("remount readonly", e))?;
    }
    if let Some(prop) = entry.propagation {
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            prop | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| io_err("set propagation", e))?;
    }
    Ok(())
}

fn mask_path(root: &Path, path: &str) -> io::Result<()> {
    let target = target_in_root(root, Path::new(path));
    if !target.exists() {
        return Ok(());
    }
    mount(
        Some(Path::new("/dev/null")),
        &target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| io_err("mask path", e))
}

fn readonly_path(root: &Path, path: &str) -> io::Result<()> {
    let target = target_in_root(root, Path::new(path));
    if !target.exists() {
        return Ok(());
    }
    mount(
        Some(target.as_path()),
        &target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| io_err("bind readonly path", e))?;
    mount(
        Some(target.as_path()),
        &target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| io_err("remount readonly path", e))
}

fn create_device(root: &Path, dev: &DeviceSpec) -> io::Result<()> {
    let target = target_in_root(root, &dev.task_path);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    if !target.exists() {
        fs::File::create(&target)?;
    }
    mount(
        Some(dev.host_path.as_path()),
        &target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| io_err("bind device", e))
}

/// Build the task filesystem and make `root` the root of this process.
///
/// Runs in the child after `unshare(CLONE_NEWNS)`. Mount events must not
/// leak back to the host, so the first step severs propagation from `/`.
pub(crate) fn enter_rootfs(
    root: &Path,
    entries: &[MountEntry],
    devices: &[DeviceSpec],
    no_pivot_root: bool,
) -> io::Result<()> {
    mount(
        None::<&str>,
        Path::new("/"),
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| io_err("make / private", e))?;

    // pivot_root requires the new root to be a mount point
    mount(
        Some(root),
        root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| io_err("bind root", e))?;

    for entry in entries {
        apply_entry(root, entry)?;
    }
    for dev in devices {
        create_device(root, dev)?;
    }
    for path in MASKED_PATHS {
        mask_path(root, path)?;
    }
    for path in READONLY_PATHS {
        readonly_path(root, path)?;
    }

    chdir(root).map_err(|e| io_err("chdir to root", e))?;
    if no_pivot_root {
        chroot(".").map_err(|e| io_err("chroot", e))?;
    } else {
        pivot_root(".", ".").map_err(|e| io_err("pivot_root", e))?;
        umount2(".", MntFlags::MNT_DETACH).map_err(|e| io_err("detach old root", e))?;
    }
    chdir("/").map_err(|e| io_err("chdir to /", e))?;
    Ok(())
}
