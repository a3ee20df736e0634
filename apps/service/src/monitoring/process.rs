//! Bounded-time execution of check plug-ins.
//!
//! Only the plug-in's exit is awaited under the deadline; its stdout is read
//! alongside and drained once it exits, so a background child that inherited
//! the pipe cannot hold the call open. The plug-in leads its own process
//! group, and on timeout the whole group is killed and the plug-in reaped.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long output left in the pipe is waited for after the plug-in exits
const DRAIN_GRACE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Command timed-out after {0} seconds")]
    Timeout(u64),

    #[error("Command line is empty")]
    EmptyCommand,

    #[error("{0}")]
    Io(#[from] io::Error),
}

/// What a finished plug-in left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
}

impl ProcessOutput {
    pub fn first_line(&self) -> Option<&str> {
        self.stdout.lines().next()
    }
}

/// Run `command_line` and wait at most `timeout_seconds` for it to exit.
///
/// The line is split on whitespace and executed directly, without a shell.
/// Standard error is discarded.
pub async fn run(command_line: &str, timeout_seconds: u64) -> Result<ProcessOutput, ProcessError> {
    let mut parts = command_line.split_whitespace();
    let program = parts.next().ok_or(ProcessError::EmptyCommand)?;

    let mut command = Command::new(program);
    command.args(parts).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::null()).kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;
    let pid = child.id();
    let mut stdout = child.stdout.take().ok_or_else(|| io::Error::other("stdout was not captured"))?;

    let start = Instant::now();
    let deadline = tokio::time::sleep_until(start + Duration::from_secs(timeout_seconds));
    tokio::pin!(deadline);

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut open = true;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            read = stdout.read(&mut chunk), if open => match read? {
                0 => open = false,
                n => buf.extend_from_slice(&chunk[..n]),
            },
            _ = &mut deadline => {
                warn!(?pid, command = command_line, timeout_seconds, "Command timed out, killing it");
                #[cfg(unix)]
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                // kill() also waits, so the child is reaped here rather than left as a zombie
                if let Err(error) = child.kill().await {
                    warn!(?pid, %error, "Failed to kill timed out command");
                }
                return Err(ProcessError::Timeout(timeout_seconds));
            }
        }
    };

    if open {
        drain(&mut stdout, &mut buf).await?;
    }
    debug!(?pid, ?status, elapsed_ms = start.elapsed().as_millis() as u64, "Command finished");
    Ok(ProcessOutput { exit_code: status.code(), stdout: String::from_utf8_lossy(&buf).into_owned() })
}

/// Take what the exited plug-in left in the pipe without waiting on other writers
async fn drain(stdout: &mut ChildStdout, buf: &mut Vec<u8>) -> io::Result<()> {
    let mut chunk = [0u8; 4096];
    loop {
        match tokio::time::timeout(DRAIN_GRACE, stdout.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => return Ok(()),
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(error)) => return Err(error),
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    // SAFETY: killpg only sends a signal; the group was created for this plug-in by process_group(0)
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        warn!(pgid, error = %io::Error::last_os_error(), "Failed to kill plug-in process group");
    }
}
