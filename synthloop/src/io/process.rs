//! Helpers for running child processes with timeouts and bounded output.

use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured bytes and the count of bytes dropped beyond the limit.
type StreamOutput = Result<(Vec<u8>, usize)>;

/// Time granted to pipe readers after the deadline once the process group is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// On Unix the child leads its own process group, and the whole group is killed once the child
/// is reaped, so nothing it started outlives the call. Descendants that escaped the group and
/// still hold the output pipes at the deadline are abandoned and the run counts as timed out.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    debug!("spawning child process");
    let deadline = Instant::now() + timeout;
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_rx = spawn_worker(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_rx = spawn_worker(move || read_stream_limited(stderr, output_limit_bytes));

    let stdin_rx = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(spawn_worker(move || child_stdin.write_all(&input)))
        }
        None => None,
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => {
            kill_group(&child);
            status
        }
        None => {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "command timed out, killing"
            );
            timed_out = true;
            kill_tree(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    if let Some(rx) = stdin_rx {
        match collect(&rx, deadline, "stdin writer")? {
            // A child that exits without reading stdin closes the pipe early.
            Some(Err(e)) if e.kind() != ErrorKind::BrokenPipe => {
                return Err(e).context("write stdin");
            }
            Some(_) => {}
            None => timed_out = true,
        }
    }

    let mut drain = |rx: &Receiver<StreamOutput>, label: &str| -> StreamOutput {
        match collect(rx, deadline, label)? {
            Some(output) => output,
            None => {
                timed_out = true;
                Ok((Vec::new(), 0))
            }
        }
    };
    let (stdout, stdout_truncated) = drain(&stdout_rx, "stdout reader").context("read stdout")?;
    let (stderr, stderr_truncated) = drain(&stderr_rx, "stderr reader").context("read stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Run `work` on its own thread and hand back a receiver for its result.
fn spawn_worker<T: Send + 'static>(work: impl FnOnce() -> T + Send + 'static) -> Receiver<T> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver is gone only when the worker was abandoned.
        let _ = tx.send(work());
    });
    rx
}

/// Wait for a worker until `deadline` (plus a short grace). `None` means it was abandoned.
fn collect<T>(rx: &Receiver<T>, deadline: Instant, label: &str) -> Result<Option<T>> {
    let wait = deadline
        .saturating_duration_since(Instant::now())
        .max(DRAIN_GRACE);
    match rx.recv_timeout(wait) {
        Ok(value) => Ok(Some(value)),
        Err(RecvTimeoutError::Timeout) => {
            warn!(worker = label, "pipe still held open at the deadline, abandoning");
            Ok(None)
        }
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("{label} thread panicked")),
    }
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

/// Kill every process left in the child's group.
///
/// Grandchildren holding the output pipes would otherwise keep the reader
/// threads blocked after the child itself is gone.
fn kill_group(child: &Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(pid) = i32::try_from(child.id())
            && let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL)
        {
            // ESRCH: the group is already empty.
            debug!(err = %e, "kill process group");
        }
    }
    #[cfg(not(unix))]
    let _ = child;
}

/// Kill the child and, on Unix, every process in its group.
fn kill_tree(child: &mut Child) -> Result<()> {
    kill_group(child);
    match child.kill() {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(e).context("kill command"),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> StreamOutput {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
