//! Event types for interactive exec sessions and the serialized sender
//! that keeps concurrent relay threads from interleaving outbound events.

use std::io;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::error::{ExecutorError, Result};

/// Events flowing from the session consumer into the process
#[derive(Debug, Clone, PartialEq)]
pub enum ExecInput {
    Stdin(Vec<u8>),
    /// Close the process stdin, delivering EOF
    StdinClose,
    /// Terminal resize; only valid for tty sessions
    Resize { height: u16, width: u16 },
    /// Keepalive, ignored
    Heartbeat,
}

/// Events flowing from the process to the session consumer
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutput {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    StdoutClosed,
    StderrClosed,
    /// Terminal event; exit_code -2 means the process could not be waited on
    Exited { exit_code: i32, signal: i32 },
}

/// Outbound side of a session. Cloneable across relay threads; every send
/// goes through one lock so events never interleave.
#[derive(Clone)]
pub struct SessionSender {
    tx: Arc<Mutex<Sender<ExecOutput>>>,
}

impl SessionSender {
    pub fn send(&self, event: ExecOutput) -> Result<()> {
        let guard = self
            .tx
            .lock()
            .map_err(|_| ExecutorError::StreamIo("session sender poisoned".to_string()))?;
        guard
            .send(event)
            .map_err(|_| ExecutorError::StreamIo("session closed".to_string()))
    }
}

/// Build the outbound channel of a session
pub fn session_pair() -> (SessionSender, Receiver<ExecOutput>) {
    let (tx, rx) = channel();
    (
        SessionSender {
            tx: Arc::new(Mutex::new(tx)),
        },
        rx,
    )
}

/// Both halves a streaming exec engine needs
pub struct ExecSession {
    pub input: Receiver<ExecInput>,
    pub output: SessionSender,
}

/// Whether a read error means the peer went away normally. Pipes report
/// EPIPE, ptys report EIO once the other side closes, and a fd torn down
/// mid-read reports EBADF.
pub fn is_normal_close(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EPIPE) | Some(libc::EIO) | Some(libc::EBADF)
    )
}
