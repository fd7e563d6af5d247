//! Interactive exec engine: runs a command in a task's context and relays
//! its streams over a session, either through a pty (single combined
//! output, resizable) or three plain pipes.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::warn;
use nix::pty::openpty;
use nix::unistd::{setsid, Pid};

use crate::command::ExecCommand;
use crate::error::{ExecutorError, Result};
use crate::execution::stream::{is_normal_close, ExecInput, ExecOutput, ExecSession, SessionSender};
use crate::isolation::cgroup::Cgroup;

nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);

type ErrSlot = Arc<Mutex<Option<ExecutorError>>>;

fn record(slot: &ErrSlot, err: ExecutorError) {
    if let Ok(mut guard) = slot.lock() {
        if guard.is_none() {
            *guard = Some(err);
        }
    }
}

fn take(slot: &ErrSlot) -> Option<ExecutorError> {
    slot.lock().ok().and_then(|mut g| g.take())
}

/// Run `cmd_args` (program plus arguments) in the task's environment and
/// relay its streams over the session. Blocks until the process exits and
/// every output relay has drained; the final event on the session is
/// always `Exited`.
pub fn run(
    task: &ExecCommand,
    cgroup: Option<&Cgroup>,
    cmd_args: Vec<String>,
    tty: bool,
    session: ExecSession,
) -> Result<()> {
    let (name, args) = cmd_args
        .split_first()
        .ok_or_else(|| ExecutorError::Configuration("exec command cannot be empty".to_string()))?;

    let mut cmd = Command::new(name);
    cmd.args(args).env_clear();
    for pair in &task.env {
        if let Some((k, v)) = pair.split_once('=') {
            cmd.env(k, v);
        }
    }
    if task.task_dir.is_dir() {
        cmd.current_dir(&task.task_dir);
    }

    let errors: ErrSlot = Arc::new(Mutex::new(None));
    if tty {
        run_tty(cmd, cgroup, session, &errors)?;
    } else {
        run_piped(cmd, cgroup, session, &errors)?;
    }
    match take(&errors) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn attach(cgroup: Option<&Cgroup>, child: &Child) {
    if let Some(cg) = cgroup {
        if let Err(e) = cg.attach(Pid::from_raw(child.id() as i32)) {
            warn!("exec session: could not join accounting group: {}", e);
        }
    }
}

fn exit_event(status: io::Result<std::process::ExitStatus>) -> ExecOutput {
    use std::os::unix::process::ExitStatusExt;
    match status {
        Ok(status) => {
            let signal = status.signal().unwrap_or(0);
            let exit_code = status.code().unwrap_or(128 + signal);
            ExecOutput::Exited { exit_code, signal }
        }
        // the process is gone but its status is unknown
        Err(_) => ExecOutput::Exited {
            exit_code: -2,
            signal: 0,
        },
    }
}

fn relay_output(
    mut source: impl Read + Send + 'static,
    sender: SessionSender,
    wrap: fn(Vec<u8>) -> ExecOutput,
    closed: ExecOutput,
    errors: ErrSlot,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if sender.send(wrap(chunk[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    if !is_normal_close(&e) {
                        record(&errors, ExecutorError::StreamIo(e.to_string()));
                    }
                    break;
                }
            }
        }
        let _ = sender.send(closed);
    })
}

fn run_piped(
    mut cmd: Command,
    cgroup: Option<&Cgroup>,
    session: ExecSession,
    errors: &ErrSlot,
) -> Result<()> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| ExecutorError::Launch(e.to_string()))?;
    attach(cgroup, &child);

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let ExecSession { input, output } = session;

    // The stdin relay can stay blocked on its channel long after the
    // process exits, so it is never joined.
    {
        let errors = errors.clone();
        std::thread::spawn(move || relay_stdin(input, stdin, errors));
    }

    let mut relays = Vec::new();
    if let Some(out) = stdout {
        relays.push(relay_output(
            out,
            output.clone(),
            ExecOutput::Stdout,
            ExecOutput::StdoutClosed,
            errors.clone(),
        ));
    }
    if let Some(err) = stderr {
        relays.push(relay_output(
            err,
            output.clone(),
            ExecOutput::Stderr,
            ExecOutput::StderrClosed,
            errors.clone(),
        ));
    }

    let status = child.wait();
    for relay in relays {
        let _ = relay.join();
    }
    let _ = output.send(exit_event(status));
    Ok(())
}

fn relay_stdin(input: Receiver<ExecInput>, mut stdin: Option<impl Write>, errors: ErrSlot) {
    while let Ok(event) = input.recv() {
        match event {
            ExecInput::Stdin(bytes) => {
                let Some(w) = stdin.as_mut() else { break };
                if let Err(e) = w.write_all(&bytes) {
                    if !is_normal_close(&e) && e.kind() != io::ErrorKind::BrokenPipe {
                        record(&errors, ExecutorError::StreamIo(e.to_string()));
                    }
                    break;
                }
            }
            ExecInput::StdinClose => {
                stdin = None;
            }
            ExecInput::Resize { .. } => {
                record(
                    &errors,
                    ExecutorError::StreamIo("resize on a session without a tty".to_string()),
                );
            }
            ExecInput::Heartbeat => {}
        }
    }
}

fn run_tty(
    mut cmd: Command,
    cgroup: Option<&Cgroup>,
    session: ExecSession,
    errors: &ErrSlot,
) -> Result<()> {
    let pty = openpty(None, None)
        .map_err(|e| ExecutorError::Syscall(format!("openpty: {}", e)))?;
    let to_err = |e: io::Error| ExecutorError::Syscall(format!("pty setup: {}", e));

    cmd.stdin(Stdio::from(pty.slave.try_clone().map_err(to_err)?))
        .stdout(Stdio::from(pty.slave.try_clone().map_err(to_err)?))
        .stderr(Stdio::from(pty.slave));
    unsafe {
        cmd.pre_exec(|| {
            setsid().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            // make the pty slave on fd 0 the controlling terminal
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ExecutorError::Launch(e.to_string()))?;
    // the Command still holds slave fds; they must close in the parent or
    // the master never reports hangup
    drop(cmd);
    attach(cgroup, &child);

    let reader = File::from(pty.master.try_clone().map_err(to_err)?);
    let writer = File::from(pty.master);
    let ExecSession { input, output } = session;

    // stdin and stdout share the pty; resize is applied to the master
    {
        let errors = errors.clone();
        std::thread::spawn(move || relay_tty_input(input, writer, errors));
    }
    let relay = relay_output(
        reader,
        output.clone(),
        ExecOutput::Stdout,
        ExecOutput::StdoutClosed,
        errors.clone(),
    );

    let status = child.wait();
    let _ = relay.join();
    let _ = output.send(exit_event(status));
    Ok(())
}

fn relay_tty_input(input: Receiver<ExecInput>, mut master: File, errors: ErrSlot) {
    while let Ok(event) = input.recv() {
        match event {
            ExecInput::Stdin(bytes) => {
                if let Err(e) = master.write_all(&bytes) {
                    if !is_normal_close(&e) && e.kind() != io::ErrorKind::BrokenPipe {
                        record(&errors, ExecutorError::StreamIo(e.to_string()));
                    }
                    break;
                }
            }
            ExecInput::Resize { height, width } => {
                let size = libc::winsize {
                    ws_row: height,
                    ws_col: width,
                    ws_xpixel: 0,
                    ws_ypixel: 0,
                };
                if let Err(e) = unsafe { tiocswinsz(master.as_raw_fd(), &size) } {
                    record(&errors, ExecutorError::StreamIo(format!("resize: {}", e)));
                }
            }
            ExecInput::StdinClose | ExecInput::Heartbeat => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::stream::session_pair;
    use std::path::PathBuf;
    use std::sync::mpsc::channel;

    fn task() -> ExecCommand {
        let mut cmd = ExecCommand::new("/bin/true", vec![]);
        cmd.task_dir = PathBuf::from("/tmp");
        cmd
    }

    fn collect(rx: std::sync::mpsc::Receiver<ExecOutput>) -> Vec<ExecOutput> {
        rx.iter().collect()
    }

    #[test]
    fn test_piped_session_relays_output_and_exit() {
        let (out_tx, out_rx) = session_pair();
        let (in_tx, in_rx) = channel();
        drop(in_tx);
        run(
            &task(),
            None,
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "printf hello".to_string(),
            ],
            false,
            ExecSession {
                input: in_rx,
                output: out_tx,
            },
        )
        .unwrap();

        let events = collect(out_rx);
        let text: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                ExecOutput::Stdout(b) => Some(b.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(text, b"hello");
        assert!(events.contains(&ExecOutput::StdoutClosed));
        assert!(events.contains(&ExecOutput::StderrClosed));
        assert_eq!(
            events.last(),
            Some(&ExecOutput::Exited {
                exit_code: 0,
                signal: 0
            })
        );
    }

    #[test]
    fn test_piped_session_relays_stdin() {
        let (out_tx, out_rx) = session_pair();
        let (in_tx, in_rx) = channel();
        in_tx.send(ExecInput::Stdin(b"ping\n".to_vec())).unwrap();
        in_tx.send(ExecInput::StdinClose).unwrap();
        drop(in_tx);

        run(
            &task(),
            None,
            vec!["/bin/cat".to_string()],
            false,
            ExecSession {
                input: in_rx,
                output: out_tx,
            },
        )
        .unwrap();

        let text: Vec<u8> = collect(out_rx)
            .iter()
            .filter_map(|e| match e {
                ExecOutput::Stdout(b) => Some(b.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(text, b"ping\n");
    }

    #[test]
    fn test_resize_without_tty_is_an_error() {
        let (out_tx, out_rx) = session_pair();
        let (in_tx, in_rx) = channel();
        in_tx
            .send(ExecInput::Resize {
                height: 40,
                width: 120,
            })
            .unwrap();
        drop(in_tx);

        let err = run(
            &task(),
            None,
            vec!["/bin/cat".to_string()],
            false,
            ExecSession {
                input: in_rx,
                output: out_tx,
            },
        )
        .unwrap_err();
        assert!(matches!(err, ExecutorError::StreamIo(_)));
        drop(out_rx);
    }

    #[test]
    fn test_exit_code_encoding_for_signals() {
        let (out_tx, out_rx) = session_pair();
        let (in_tx, in_rx) = channel();
        drop(in_tx);
        run(
            &task(),
            None,
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "kill -9 $$".to_string(),
            ],
            false,
            ExecSession {
                input: in_rx,
                output: out_tx,
            },
        )
        .unwrap();
        assert_eq!(
            collect(out_rx).last(),
            Some(&ExecOutput::Exited {
                exit_code: 128 + libc::SIGKILL,
                signal: libc::SIGKILL
            })
        );
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let (out_tx, _out_rx) = session_pair();
        let (_in_tx, in_rx) = channel();
        let err = run(
            &task(),
            None,
            Vec::new(),
            false,
            ExecSession {
                input: in_rx,
                output: out_tx,
            },
        )
        .unwrap_err();
        assert!(matches!(err, ExecutorError::Configuration(_)));
    }

    #[test]
    fn test_tty_session_combines_streams() {
        let (out_tx, out_rx) = session_pair();
        let (in_tx, in_rx) = channel();
        drop(in_tx);
        run(
            &task(),
            None,
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "printf out; printf err 1>&2".to_string(),
            ],
            true,
            ExecSession {
                input: in_rx,
                output: out_tx,
            },
        )
        .unwrap();

        let events = collect(out_rx);
        let text: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                ExecOutput::Stdout(b) => Some(b.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        let text = String::from_utf8_lossy(&text);
        assert!(text.contains("out"));
        assert!(text.contains("err"));
        assert!(!events.iter().any(|e| matches!(e, ExecOutput::Stderr(_))));
    }
}
