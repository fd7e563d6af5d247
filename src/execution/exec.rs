//! Synchronous ad-hoc exec inside a running task's context, with a hard
//! output cap and a deadline kill.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::warn;
use nix::unistd::Pid;

use crate::command::ExecCommand;
use crate::error::{ExecutorError, Result};
use crate::isolation::cgroup::Cgroup;

/// Combined stdout+stderr cap for ad-hoc execs
pub const EXEC_OUTPUT_LIMIT: usize = 32 * 1024;

fn capped_reader(
    mut source: impl Read + Send + 'static,
    sink: Arc<Mutex<Vec<u8>>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match source.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut buf = match sink.lock() {
                        Ok(b) => b,
                        Err(_) => break,
                    };
                    // keep draining past the cap so the child never blocks
                    let room = EXEC_OUTPUT_LIMIT.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
        }
    })
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => -1,
    }
}

/// Run a command in the task's working directory and environment, joined
/// to its accounting group when one exists. Returns combined output
/// (truncated to 32 KiB) and the exit code. Past the deadline the process
/// is killed and whatever it produced is returned.
pub fn exec_with_deadline(
    task: &ExecCommand,
    cgroup: Option<&Cgroup>,
    deadline: Instant,
    name: &str,
    args: &[String],
) -> Result<(Vec<u8>, i32)> {
    let mut cmd = Command::new(name);
    cmd.args(args)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for pair in &task.env {
        if let Some((k, v)) = pair.split_once('=') {
            cmd.env(k, v);
        }
    }
    if task.task_dir.is_dir() {
        cmd.current_dir(&task.task_dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ExecutorError::Launch(format!("{}: {}", name, e)))?;

    if let Some(cg) = cgroup {
        if let Err(e) = cg.attach(Pid::from_raw(child.id() as i32)) {
            warn!("exec: could not join accounting group: {}", e);
        }
    }

    let output = Arc::new(Mutex::new(Vec::new()));
    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        readers.push(capped_reader(out, output.clone()));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(capped_reader(err, output.clone()));
    }

    let status = wait_until(&mut child, deadline)?;
    for r in readers {
        let _ = r.join();
    }
    let bytes = output
        .lock()
        .map(|b| b.clone())
        .unwrap_or_default();
    Ok((bytes, exit_code_of(status)))
}

fn wait_until(child: &mut Child, deadline: Instant) -> Result<std::process::ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            return Ok(child.wait()?);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn task() -> ExecCommand {
        let mut cmd = ExecCommand::new("/bin/true", vec![]);
        cmd.task_dir = PathBuf::from("/tmp");
        cmd
    }

    #[test]
    fn test_exec_captures_combined_output() {
        let deadline = Instant::now() + Duration::from_secs(5);
        let (out, code) = exec_with_deadline(
            &task(),
            None,
            deadline,
            "/bin/sh",
            &["-c".to_string(), "echo one; echo two 1>&2".to_string()],
        )
        .unwrap();
        assert_eq!(code, 0);
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("one"));
        assert!(text.contains("two"));
    }

    #[test]
    fn test_exec_reports_exit_code() {
        let deadline = Instant::now() + Duration::from_secs(5);
        let (_, code) = exec_with_deadline(
            &task(),
            None,
            deadline,
            "/bin/sh",
            &["-c".to_string(), "exit 7".to_string()],
        )
        .unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn test_exec_output_is_capped() {
        let deadline = Instant::now() + Duration::from_secs(10);
        let (out, code) = exec_with_deadline(
            &task(),
            None,
            deadline,
            "/bin/sh",
            &["-c".to_string(), "head -c 100000 /dev/zero".to_string()],
        )
        .unwrap();
        assert_eq!(code, 0);
        assert_eq!(out.len(), EXEC_OUTPUT_LIMIT);
    }

    #[test]
    fn test_exec_kills_at_deadline() {
        let start = Instant::now();
        let deadline = start + Duration::from_millis(300);
        let (_, code) = exec_with_deadline(
            &task(),
            None,
            deadline,
            "/bin/sleep",
            &["30".to_string()],
        )
        .unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(code, 128 + libc::SIGKILL);
    }
}
