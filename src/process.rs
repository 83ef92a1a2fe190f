//! Deadline-bounded subprocess execution.
//!
//! Every child process Bulkhead spawns (dependency installs, test suites,
//! syntax checks, benchmarks) goes through [`run_bounded`], so timeout and
//! cancellation handling is identical at every call site: the child is
//! killed and reaped, and the caller gets a [`ProcessStatus`] instead of
//! blocking. On unix the child leads its own process group and a kill takes
//! down everything it spawned.

use crate::{Error, Result};
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// How often a running child is checked for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long pipes may stay open after the child has ended.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Shared cancellation flag, flipped by the ctrl-C handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a bounded process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Exited on its own; `None` if terminated by a signal
    Exited(Option<i32>),
    /// Killed after exceeding its deadline
    TimedOut,
    /// Killed because the cancel token fired
    Cancelled,
    /// The program could not be found
    NotFound,
}

/// Captured result of a bounded process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ProcessStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == ProcessStatus::Exited(Some(0))
    }

    /// stdout and stderr joined, for reporter parsing.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Short human-readable description of a non-success result.
    pub fn describe(&self, label: &str) -> String {
        match self.status {
            ProcessStatus::Exited(Some(code)) => format!("{} exited with code {}", label, code),
            ProcessStatus::Exited(None) => format!("{} terminated by signal", label),
            ProcessStatus::TimedOut => {
                format!("{} timed out after {}s", label, self.elapsed.as_secs())
            }
            ProcessStatus::Cancelled => format!("{} cancelled", label),
            ProcessStatus::NotFound => format!("{}: command not found", label),
        }
    }
}

/// Build a [`Command`] from an argv list.
pub fn command_from_argv(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::InvalidInput("empty command".to_string()))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Output pipe read on a background thread into a shared buffer.
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Drain> {
    pipe.map(|mut reader| {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let handle = thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => match sink.lock() {
                        Ok(mut b) => b.extend_from_slice(&chunk[..n]),
                        Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
                    },
                }
            }
        });
        Drain { buf, handle }
    })
}

/// Whatever the pipe produced by `deadline`.
///
/// A grandchild that inherited the pipe can hold it open after the child
/// is gone; the reader thread is then left behind and the partial output
/// returned.
fn collect(drain: Option<Drain>, deadline: Instant) -> String {
    let Some(drain) = drain else {
        return String::new();
    };
    while !drain.handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    if drain.handle.is_finished() {
        let _ = drain.handle.join();
    }
    let bytes = match drain.buf.lock() {
        Ok(b) => b.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Put the child in its own process group so the whole tree can be killed.
#[cfg(unix)]
fn isolate(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_tree(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(child.id() as i32);
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(_) => child.kill(),
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> io::Result<()> {
    child.kill()
}

fn kill_and_reap(label: &str, child: &mut Child) {
    if let Err(e) = kill_tree(child) {
        warn!(label, error = %e, "failed to kill child process");
    }
    let _ = child.wait();
}

/// Run `cmd` to completion, or until `timeout` elapses or `cancel` fires.
///
/// stdout and stderr are drained on background threads so a chatty child
/// cannot block on a full pipe. stdin is closed.
pub fn run_bounded(
    label: &str,
    mut cmd: Command,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<ProcessOutput> {
    let start = Instant::now();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate(&mut cmd);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(label, "program not found");
            return Ok(ProcessOutput {
                status: ProcessStatus::NotFound,
                stdout: String::new(),
                stderr: e.to_string(),
                elapsed: start.elapsed(),
            });
        }
        Err(e) => return Err(Error::Io(e)),
    };
    debug!(label, pid = child.id(), timeout_secs = timeout.as_secs(), "spawned");

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = loop {
        if cancel.is_cancelled() {
            kill_and_reap(label, &mut child);
            break ProcessStatus::Cancelled;
        }
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            kill_and_reap(label, &mut child);
            break ProcessStatus::TimedOut;
        }
        match child.wait_timeout(remaining.min(POLL_INTERVAL))? {
            Some(exit) => break ProcessStatus::Exited(exit.code()),
            None => continue,
        }
    };

    let drain_deadline = Instant::now() + DRAIN_GRACE;
    let output = ProcessOutput {
        status,
        stdout: collect(stdout, drain_deadline),
        stderr: collect(stderr, drain_deadline),
        elapsed: start.elapsed(),
    };
    let elapsed_ms = output.elapsed.as_millis() as u64;
    match output.status {
        ProcessStatus::TimedOut => warn!(label, elapsed_ms, "process timed out and was killed"),
        ProcessStatus::Cancelled => warn!(label, "process cancelled"),
        _ => debug!(label, status = ?output.status, elapsed_ms, "process finished"),
    }
    Ok(output)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn test_captures_output_and_exit_code() {
        let out = run_bounded(
            "echo",
            sh("echo out; echo err >&2; exit 3"),
            Duration::from_secs(10),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(out.status, ProcessStatus::Exited(Some(3)));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.success());
    }

    #[test]
    fn test_timeout_kills_child() {
        let out = run_bounded(
            "sleep",
            sh("sleep 30"),
            Duration::from_millis(300),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(out.status, ProcessStatus::TimedOut);
        assert!(out.elapsed < Duration::from_secs(10));
    }

    #[test]
    fn test_timeout_kills_grandchildren_holding_pipes() {
        let out = run_bounded(
            "wrapper",
            sh("sleep 30 & sleep 30; echo never"),
            Duration::from_millis(300),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(out.status, ProcessStatus::TimedOut);
        assert!(out.elapsed < Duration::from_secs(10));
        assert!(!out.stdout.contains("never"));
    }

    #[test]
    fn test_background_grandchild_does_not_block_return() {
        let out = run_bounded(
            "detach",
            sh("sleep 30 & echo started"),
            Duration::from_secs(20),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(out.status, ProcessStatus::Exited(Some(0)));
        assert_eq!(out.stdout.trim(), "started");
        assert!(out.elapsed < Duration::from_secs(10));
    }

    #[test]
    fn test_cancelled_token_kills_child() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let out = run_bounded("sleep", sh("sleep 30"), Duration::from_secs(30), &cancel).unwrap();
        assert_eq!(out.status, ProcessStatus::Cancelled);
    }

    #[test]
    fn test_missing_program_is_not_found() {
        let out = run_bounded(
            "missing",
            Command::new("bulkhead-definitely-not-a-program"),
            Duration::from_secs(5),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(out.status, ProcessStatus::NotFound);
    }

    #[test]
    fn test_command_from_argv_rejects_empty() {
        assert!(command_from_argv(&[]).is_err());
    }
}
