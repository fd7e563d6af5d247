//! Binary resolution, credential lookup and the actual spawn: the child
//! enters its isolation (accounting group, namespaces, root filesystem,
//! credentials, capabilities) in the pre-exec path, atomically with exec.

use std::ffi::CString;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;

use log::debug;
use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{fork, getgrouplist, setgid, setgroups, setuid, ForkResult, Gid, Uid, User};

use crate::command::{ExecCommand, OutputBuffer, OutputDestination};
use crate::error::{ExecutorError, Result};
use crate::isolation::capability::CapabilitySet;
use crate::isolation::mount::enter_rootfs;
use crate::isolation::IsolationProfile;

/// Search path used for bare command names. Never the agent's own PATH.
pub const RESTRICTED_PATH: &[&str] = &["/usr/local/bin", "/usr/bin", "/bin"];

/// Resolved launch identity
#[derive(Debug, Clone)]
pub struct Credentials {
    pub uid: Uid,
    pub gid: Gid,
    pub groups: Vec<Gid>,
}

/// Resolve a user name to uid, gid and supplementary groups. Must happen
/// before any chroot, while the host account database is still visible.
pub fn resolve_user(name: &str) -> Result<Option<Credentials>> {
    if name.is_empty() {
        return Ok(None);
    }
    let user = User::from_name(name)
        .map_err(|e| ExecutorError::Syscall(format!("user lookup {}: {}", name, e)))?
        .ok_or_else(|| ExecutorError::Configuration(format!("unknown user: {}", name)))?;
    let cname = CString::new(name)
        .map_err(|_| ExecutorError::Configuration(format!("invalid user name: {}", name)))?;
    let groups = getgrouplist(&cname, user.gid)
        .map_err(|e| ExecutorError::Syscall(format!("group lookup {}: {}", name, e)))?;
    Ok(Some(Credentials {
        uid: user.uid,
        gid: user.gid,
        groups,
    }))
}

fn rel(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}

/// Resolve the command binary. Search order: task local dir, task dir,
/// declared mounts (task path translated to host path), absolute host
/// path, then the restricted default path for bare names.
pub fn lookup_bin(command: &ExecCommand) -> Result<PathBuf> {
    let bin = Path::new(&command.cmd);

    let local = command.local_dir().join(rel(bin));
    if local.is_file() {
        return Ok(local);
    }
    let in_task = command.task_dir.join(rel(bin));
    if in_task.is_file() {
        return Ok(in_task);
    }
    if let Some(host) = command.host_path_for(bin) {
        if host.is_file() {
            return Ok(host);
        }
    }
    if bin.is_absolute() && bin.is_file() {
        return Ok(bin.to_path_buf());
    }
    if bin.components().count() == 1 {
        for dir in RESTRICTED_PATH {
            let candidate = Path::new(dir).join(bin);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(ExecutorError::PathNotFound(command.cmd.clone()))
}

/// Ensure a binary inside the task directory carries execute bits.
/// Host binaries are left alone.
pub fn make_executable(bin: &Path, task_dir: &Path) -> Result<()> {
    if !bin.starts_with(task_dir) {
        return Ok(());
    }
    let meta = fs::metadata(bin)
        .map_err(|_| ExecutorError::PathNotFound(bin.display().to_string()))?;
    if meta.permissions().mode() & 0o111 != 0 {
        return Ok(());
    }
    fs::set_permissions(bin, fs::Permissions::from_mode(0o555))
        .map_err(|_| ExecutorError::NotExecutable(bin.display().to_string()))
}

/// A spawned task plus the relay threads draining its output buffers
pub struct LaunchedProcess {
    pub child: Child,
    pub io_threads: Vec<JoinHandle<()>>,
}

fn destination_stdio(dest: &OutputDestination) -> Result<(Stdio, Option<OutputBuffer>)> {
    match dest {
        OutputDestination::Discard => Ok((Stdio::null(), None)),
        OutputDestination::File(path) => {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Ok((Stdio::from(file), None))
        }
        OutputDestination::Buffer(buf) => Ok((Stdio::piped(), Some(buf.clone()))),
    }
}

fn drain_into(mut source: impl Read + Send + 'static, buf: OutputBuffer) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match source.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut guard) = buf.lock() {
                        guard.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

fn join_cgroup(procs_files: &[PathBuf]) -> io::Result<()> {
    for file in procs_files {
        fs::OpenOptions::new()
            .write(true)
            .open(file)?
            .write_all(b"0")?;
    }
    Ok(())
}

fn to_io(what: &'static str) -> impl Fn(nix::Error) -> io::Error {
    move |e| io::Error::new(io::ErrorKind::Other, format!("{}: {}", what, e))
}

/// `unshare(CLONE_NEWPID)` only places *later children* in the new
/// namespace, so the task must be one fork deeper: the child continues to
/// exec as pid 1 of the namespace while the parent stays behind as a shim
/// that mirrors the task's exit status (re-raising a fatal signal so the
/// supervisor observes the same termination).
pub(crate) fn fork_into_pid_namespace() -> io::Result<()> {
    match unsafe { fork() } {
        Err(e) => Err(io::Error::new(
            io::ErrorKind::Other,
            format!("fork: {}", e),
        )),
        Ok(ForkResult::Child) => Ok(()),
        Ok(ForkResult::Parent { child }) => {
            let mut status: libc::c_int = 0;
            loop {
                let r = unsafe { libc::waitpid(child.as_raw(), &mut status, 0) };
                if r == child.as_raw() {
                    break;
                }
                if r < 0 && Errno::last() != Errno::EINTR {
                    unsafe { libc::_exit(1) };
                }
            }
            if libc::WIFSIGNALED(status) {
                let sig = libc::WTERMSIG(status);
                unsafe {
                    libc::signal(sig, libc::SIG_DFL);
                    libc::raise(sig);
                }
            }
            let code = if libc::WIFEXITED(status) {
                libc::WEXITSTATUS(status)
            } else {
                1
            };
            unsafe { libc::_exit(code) }
        }
    }
}

/// Drop to the launch identity. When a capability set is applied
/// afterwards, the permitted set has to survive the uid change, so
/// keepcaps is raised before `setuid`.
pub(crate) fn become_user(c: &Credentials, caps: Option<&CapabilitySet>) -> io::Result<()> {
    if caps.is_some() && unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, 1, 0, 0, 0) } < 0 {
        return Err(io::Error::last_os_error());
    }
    setgroups(&c.groups).map_err(to_io("setgroups"))?;
    setgid(c.gid).map_err(to_io("setgid"))?;
    setuid(c.uid).map_err(to_io("setuid"))?;
    if let Some(set) = caps {
        set.apply()?;
    }
    Ok(())
}

/// Spawn the task process. Isolation is applied in the child between fork
/// and exec so a launch either fully succeeds or leaves nothing behind.
pub fn spawn(
    bin: &Path,
    command: &ExecCommand,
    profile: &IsolationProfile,
    creds: Option<Credentials>,
) -> Result<LaunchedProcess> {
    let (stdout, stdout_buf) = destination_stdio(&command.stdout)?;
    let (stderr, stderr_buf) = destination_stdio(&command.stderr)?;

    let mut cmd = Command::new(bin);
    cmd.args(&command.args)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0);
    for pair in &command.env {
        if let Some((k, v)) = pair.split_once('=') {
            cmd.env(k, v);
        }
    }
    if !profile.contained && command.task_dir.is_dir() {
        cmd.current_dir(&command.task_dir);
    }

    let procs_files: Vec<PathBuf> = profile
        .cgroup
        .as_ref()
        .map(|cg| cg.procs_files())
        .unwrap_or_default();
    let clone_flags = profile.namespaces.to_clone_flags();
    let contained = profile.contained;
    let rootfs = profile.rootfs.clone();
    let mounts = profile.mounts.clone();
    let devices = profile.devices.clone();
    let no_pivot_root = profile.no_pivot_root;
    let capabilities = profile.capabilities.clone();

    unsafe {
        cmd.pre_exec(move || {
            join_cgroup(&procs_files)?;
            if !clone_flags.is_empty() {
                unshare(clone_flags).map_err(to_io("unshare"))?;
            }
            // /proc must be mounted by a member of the new pid namespace,
            // so the fork happens before the root filesystem is built
            if clone_flags.contains(CloneFlags::CLONE_NEWPID) {
                fork_into_pid_namespace()?;
            }
            if contained {
                enter_rootfs(&rootfs, &mounts, &devices, no_pivot_root)?;
            }
            match (&creds, contained) {
                (Some(c), true) => become_user(c, Some(&capabilities))?,
                (Some(c), false) => become_user(c, None)?,
                (None, true) => capabilities.apply()?,
                (None, false) => {}
            }
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ExecutorError::Launch(format!("{}: {}", bin.display(), e)))?;
    debug!("launched {} as pid {}", bin.display(), child.id());

    let mut io_threads = Vec::new();
    if let Some(buf) = stdout_buf {
        if let Some(out) = child.stdout.take() {
            io_threads.push(drain_into(out, buf));
        }
    }
    if let Some(buf) = stderr_buf {
        if let Some(err) = child.stderr.take() {
            io_threads.push(drain_into(err, buf));
        }
    }
    Ok(LaunchedProcess { child, io_threads })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_local_dir_takes_precedence() {
        let tmp = tempdir().unwrap();
        let local = tmp.path().join("local");
        fs::create_dir_all(&local).unwrap();
        fs::write(local.join("tool"), b"#!/bin/sh\n").unwrap();
        fs::write(tmp.path().join("tool"), b"#!/bin/sh\n").unwrap();

        let mut cmd = ExecCommand::new("tool", vec![]);
        cmd.task_dir = tmp.path().to_path_buf();
        assert_eq!(lookup_bin(&cmd).unwrap(), local.join("tool"));
    }

    #[test]
    fn test_task_dir_resolution_strips_leading_slash() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("usr/bin");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("tool"), b"").unwrap();

        let mut cmd = ExecCommand::new("/usr/bin/tool", vec![]);
        cmd.task_dir = tmp.path().to_path_buf();
        assert_eq!(lookup_bin(&cmd).unwrap(), dir.join("tool"));
    }

    #[test]
    fn test_bare_name_uses_restricted_path() {
        let mut cmd = ExecCommand::new("sh", vec![]);
        cmd.task_dir = PathBuf::from("/nonexistent/task");
        let bin = lookup_bin(&cmd).unwrap();
        assert!(RESTRICTED_PATH.iter().any(|d| bin.starts_with(d)));
    }

    #[test]
    fn test_missing_binary_is_path_not_found() {
        let mut cmd = ExecCommand::new("definitely-not-a-binary-xyz", vec![]);
        cmd.task_dir = PathBuf::from("/nonexistent/task");
        assert!(matches!(
            lookup_bin(&cmd).unwrap_err(),
            ExecutorError::PathNotFound(_)
        ));
    }

    #[test]
    fn test_make_executable_sets_bits_inside_task_dir() {
        let tmp = tempdir().unwrap();
        let bin = tmp.path().join("script");
        fs::write(&bin, b"#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o644)).unwrap();

        make_executable(&bin, tmp.path()).unwrap();
        let mode = fs::metadata(&bin).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o555);
    }

    #[test]
    fn test_make_executable_leaves_host_binaries_alone() {
        make_executable(Path::new("/bin/sh"), Path::new("/nonexistent/task")).unwrap();
    }

    #[test]
    fn test_resolve_user_empty_is_current() {
        assert!(resolve_user("").unwrap().is_none());
    }

    #[test]
    fn test_resolve_user_unknown_fails() {
        let err = resolve_user("definitely-not-a-user-xyz").unwrap_err();
        assert!(matches!(err, ExecutorError::Configuration(_)));
    }

    #[test]
    fn test_private_pid_namespace_contains_the_task() {
        if !nix::unistd::Uid::effective().is_root() {
            return;
        }
        let Ok(host_ns) = fs::read_link("/proc/self/ns/pid") else {
            return;
        };

        let mut cmd = std::process::Command::new("/bin/readlink");
        cmd.arg("/proc/self/ns/pid")
            .stdout(std::process::Stdio::piped());
        unsafe {
            cmd.pre_exec(|| {
                unshare(CloneFlags::CLONE_NEWPID)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                fork_into_pid_namespace()
            });
        }
        let out = cmd.output().unwrap();
        assert!(out.status.success());
        let task_ns = String::from_utf8_lossy(&out.stdout);
        assert_ne!(
            task_ns.trim(),
            host_ns.to_string_lossy(),
            "task must not share the launcher's pid namespace"
        );
    }

    #[test]
    fn test_credential_drop_still_allows_capability_application() {
        if !nix::unistd::Uid::effective().is_root() {
            return;
        }
        let Ok(Some(creds)) = resolve_user("nobody") else {
            return;
        };
        let uid = creds.uid;
        let set = CapabilitySet::from_names(&["CAP_NET_BIND_SERVICE".to_string()]).unwrap();

        let mut cmd = std::process::Command::new("/usr/bin/id");
        cmd.arg("-u").stdout(std::process::Stdio::piped());
        unsafe {
            cmd.pre_exec(move || become_user(&creds, Some(&set)));
        }
        let out = cmd.output().unwrap();
        assert!(
            out.status.success(),
            "pre-exec failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        assert_eq!(
            String::from_utf8_lossy(&out.stdout).trim(),
            uid.to_string()
        );
    }
}
