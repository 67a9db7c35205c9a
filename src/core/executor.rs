//! Command execution module.
//!
//! Spawns child processes, streams their output line by line and enforces
//! an optional timeout.

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as ProcessCommand;

use super::Command;

/// Which stream an output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Result of executing a command.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Exit status of the command (`None` if it was killed on timeout)
    pub status: Option<ExitStatus>,

    /// Whether the timeout elapsed before the process exited
    pub timed_out: bool,

    /// Time taken to execute
    pub duration: Duration,
}

impl ExecutionResult {
    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }

    /// Get the exit code.
    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

/// Command executor.
#[derive(Debug, Default, Clone)]
pub struct Executor {
    /// Timeout for command execution
    pub timeout: Option<Duration>,
}

impl Executor {
    /// Create a new executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set execution timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set an optional execution timeout.
    #[must_use]
    pub fn maybe_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Execute a command, calling `on_line` for every line of output.
    ///
    /// The child inherits this process's environment plus the command's
    /// own variables. Stdin is closed.
    pub async fn execute<F>(&self, command: &Command, mut on_line: F) -> std::io::Result<ExecutionResult>
    where
        F: FnMut(&str, Stream) + Send,
    {
        let start = Instant::now();

        let mut cmd = ProcessCommand::new(&command.program);
        cmd.args(&command.args);

        if let Some(ref dir) = command.working_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        if let Some(path) = command.effective_path() {
            cmd.env("PATH", path);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!(command = %command.display_line(), "Spawning process");
        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take().map(BufReader::new);
        let stderr = child.stderr.take().map(BufReader::new);

        let run = async {
            pump_output(stdout, stderr, &mut on_line).await?;
            child.wait().await
        };

        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(status) => Some(status?),
                Err(_) => None,
            },
            None => Some(run.await?),
        };

        let timed_out = status.is_none();
        if timed_out {
            tracing::warn!(command = command.name, "Command timed out, killing process");
            child.kill().await?;
        }

        Ok(ExecutionResult { status, timed_out, duration: start.elapsed() })
    }
}

/// Forward both output streams to the callback until both are closed.
///
/// Lines are decoded lossily; a script printing invalid UTF-8 is judged by
/// its exit code alone.
async fn pump_output<O, E, F>(
    mut stdout: Option<BufReader<O>>,
    mut stderr: Option<BufReader<E>>,
    on_line: &mut F,
) -> std::io::Result<()>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
    F: FnMut(&str, Stream),
{
    let mut stdout_open = stdout.is_some();
    let mut stderr_open = stderr.is_some();
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();

    loop {
        tokio::select! {
            line = next_line(&mut stdout, &mut stdout_buf), if stdout_open => match line? {
                Some(line) => on_line(&line, Stream::Stdout),
                None => stdout_open = false,
            },
            line = next_line(&mut stderr, &mut stderr_buf), if stderr_open => match line? {
                Some(line) => on_line(&line, Stream::Stderr),
                None => stderr_open = false,
            },
            else => break,
        }
    }
    Ok(())
}

/// Read one line into `buf`.
///
/// `buf` outlives the read so bytes from a read cancelled by `select!` are
/// kept and completed by the next call.
async fn next_line<R: AsyncRead + Unpin>(
    reader: &mut Option<BufReader<R>>,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    let Some(reader) = reader else {
        return Ok(None);
    };

    let read = reader.read_until(b'\n', buf).await?;
    if read == 0 && buf.is_empty() {
        return Ok(None);
    }

    let mut end = buf.len();
    if buf.ends_with(b"\n") {
        end -= 1;
        if buf[..end].ends_with(b"\r") {
            end -= 1;
        }
    }
    let line = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.clear();
    Ok(Some(line))
}
