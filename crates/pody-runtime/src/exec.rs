//! Deadline supervision for host-side child processes.
//!
//! The child is placed in its own process group so the whole tree can be
//! signalled at once. Supervision polls `try_wait` until the deadline,
//! then sends SIGTERM to the group, waits out the grace period, and
//! finally sends SIGKILL and reaps the child. A child found already
//! exited at the deadline boundary is reported as completed.

use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use pody_common::error::{PodyError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of a supervised child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisedOutput {
    /// Exit code, or `128 + signal` when the child was killed by a signal.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Whether the deadline expired and the group was signalled.
    pub timed_out: bool,
    /// Wall time from spawn to reaping.
    pub elapsed: Duration,
}

impl SupervisedOutput {
    /// Standard output followed by standard error.
    #[must_use]
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }
}

/// Runs `command` to completion or until `timeout` elapses.
///
/// # Errors
///
/// Returns `Io` if the child cannot be spawned, and `RuntimeFailure` if
/// it cannot be waited on.
pub fn run_with_deadline(
    mut command: Command,
    timeout: Duration,
    grace: Duration,
) -> Result<SupervisedOutput> {
    let program = command.get_program().to_string_lossy().into_owned();
    let started = Instant::now();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|e| PodyError::Io {
            path: program.clone().into(),
            source: e,
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = started + timeout;
    let (status, timed_out) = match wait_until(&mut child, deadline)? {
        Some(status) => (status, false),
        None => {
            tracing::warn!(
                program = %program,
                pid = child.id(),
                timeout_ms = timeout.as_millis(),
                "deadline expired, terminating process group"
            );
            (terminate(&mut child, grace)?, true)
        }
    };

    Ok(SupervisedOutput {
        exit_code: exit_code(status),
        stdout: collect(stdout),
        stderr: collect(stderr),
        timed_out,
        elapsed: started.elapsed(),
    })
}

/// Maps an exit status to a shell-style exit code.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// Polls the child until it exits or `deadline` passes.
///
/// Returns `None` only if the child is still running after one final
/// check at the deadline.
fn wait_until(child: &mut Child, deadline: Instant) -> Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = try_wait(child)? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return try_wait(child);
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// SIGTERM, grace period, SIGKILL, reap.
fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    signal_group(child, Signal::SIGTERM);
    if let Some(status) = wait_until(child, Instant::now() + grace)? {
        return Ok(status);
    }
    tracing::warn!(pid = child.id(), "process ignored SIGTERM, sending SIGKILL");
    signal_group(child, Signal::SIGKILL);
    child
        .wait()
        .map_err(|e| PodyError::runtime(format!("failed to reap pid {}: {e}", child.id())))
}

fn signal_group(child: &Child, signal: Signal) {
    let Ok(pgid) = i32::try_from(child.id()) else {
        return;
    };
    // The group may already be gone; ESRCH is fine here.
    if let Err(e) = kill(Pid::from_raw(-pgid), signal) {
        tracing::debug!(pgid, ?signal, error = %e, "group signal not delivered");
    }
}

fn try_wait(child: &mut Child) -> Result<Option<ExitStatus>> {
    child
        .try_wait()
        .map_err(|e| PodyError::runtime(format!("failed to wait on pid {}: {e}", child.id())))
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut reader| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        let _ = cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn completed_command_reports_output() {
        let out = run_with_deadline(
            sh("echo hello; echo oops >&2"),
            Duration::from_secs(5),
            Duration::from_millis(100),
        )
        .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert!(!out.timed_out);
        assert_eq!(out.combined(), "hello\noops\n");
    }

    #[test]
    fn non_zero_exit_code_is_preserved() {
        let out = run_with_deadline(sh("exit 3"), Duration::from_secs(5), Duration::ZERO).unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out);
        assert!(out.elapsed < Duration::from_secs(5));
    }

    #[test]
    fn expired_command_is_terminated() {
        let started = Instant::now();
        let out = run_with_deadline(
            sh("echo partial; sleep 30"),
            Duration::from_millis(200),
            Duration::from_millis(500),
        )
        .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, 128 + 15);
        assert!(out.elapsed >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn sigterm_resistant_command_is_killed() {
        let started = Instant::now();
        let out = run_with_deadline(
            sh("trap '' TERM; sleep 30"),
            Duration::from_millis(100),
            Duration::from_millis(100),
        )
        .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, 128 + 9);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_binary_is_an_io_error() {
        let err = run_with_deadline(
            Command::new("/nonexistent/pody-binary"),
            Duration::from_secs(1),
            Duration::ZERO,
        )
        .unwrap_err();
        assert!(matches!(err, PodyError::Io { .. }));
    }
}
