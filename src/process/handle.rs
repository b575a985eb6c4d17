//! Spawned external process with captured diagnostics.
//!
//! # Process Cleanup Safety
//!
//! Every child is spawned with `kill_on_drop(true)`, so a `ProcessHandle`
//! dropped on an error path never leaves an orphan behind. The orderly path
//! is [`ProcessHandle::finish`] (wait + collect stderr) or
//! [`ProcessHandle::terminate`] (SIGTERM, grace period, SIGKILL).

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ProcessFailure;

/// Only the most recent bytes of each captured stream are kept.
const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// How long to wait for a capture task to drain after the child exits.
const CAPTURE_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// One command to run: a display name, the program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Space-joined command line for messages.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        cmd
    }
}

/// Where a child's stdout goes.
#[derive(Debug)]
pub enum StdoutMode {
    /// Leave it piped so the caller can take it (pipeline wiring).
    Pipe,
    /// Drain it in the background into a bounded buffer.
    Capture,
    /// Redirect to an existing destination (file, next stage, null).
    To(Stdio),
}

/// Background drain of one child stream into a bounded tail buffer.
#[derive(Debug)]
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl OutputCapture {
    fn start<R>(stream: R, stage: String, label: &'static str) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        debug!(
                            stage = %stage,
                            stream = label,
                            "{}",
                            String::from_utf8_lossy(&line).trim_end()
                        );
                        if let Ok(mut buf) = sink.lock() {
                            buf.extend_from_slice(&line);
                            if buf.len() > MAX_CAPTURE_BYTES {
                                let excess = buf.len() - MAX_CAPTURE_BYTES;
                                buf.drain(..excess);
                            }
                        }
                    }
                    Err(e) => {
                        debug!(stage = %stage, stream = label, error = %e, "Capture ended");
                        break;
                    }
                }
            }
        });
        Self {
            buffer,
            task: Some(task),
        }
    }

    fn snapshot(&self) -> String {
        self.buffer
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }

    /// Wait briefly for the drain task to reach EOF, then return the text.
    async fn finish(&mut self) -> String {
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(CAPTURE_DRAIN_TIMEOUT, task).await.is_err() {
                debug!("Output capture still open after child exit; using snapshot");
            }
        }
        self.snapshot()
    }
}

/// Captured stdout/stderr text of a process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Result of waiting for a stage to finish.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: String,
    pub command_line: String,
    pub status: Option<ExitStatus>,
    pub stderr: String,
    /// Set when waiting on the child itself failed.
    pub wait_error: Option<String>,
}

impl StageReport {
    pub fn success(&self) -> bool {
        self.wait_error.is_none() && self.status.map(|s| s.success()).unwrap_or(false)
    }

    /// Describe the failure, or `None` if the stage succeeded.
    pub fn failure(&self) -> Option<ProcessFailure> {
        if self.success() {
            return None;
        }
        let (exit_code, status) = match (&self.status, &self.wait_error) {
            (_, Some(err)) => (None, format!("wait error: {}", err)),
            (Some(status), None) => (status.code(), describe_status(status)),
            (None, None) => (None, "unknown status".to_string()),
        };
        Some(ProcessFailure {
            stage: self.name.clone(),
            exit_code,
            status,
            command_line: self.command_line.clone(),
            diagnostics: self.stderr.trim().to_string(),
        })
    }
}

/// `exit code N` or `terminated by signal N`.
pub fn describe_status(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {}", signal);
        }
    }
    status.to_string()
}

/// A spawned external process.
///
/// Exactly one owner holds a `ProcessHandle`; it is consumed by
/// [`finish`](Self::finish) or torn down by [`terminate`](Self::terminate).
#[derive(Debug)]
pub struct ProcessHandle {
    spec: StageSpec,
    child: Child,
    stdout_capture: Option<OutputCapture>,
    stderr_capture: OutputCapture,
    status: Option<ExitStatus>,
}

impl ProcessHandle {
    /// Spawn `spec`. Stderr is always captured.
    pub fn spawn(spec: &StageSpec, stdin: Stdio, stdout: StdoutMode) -> std::io::Result<Self> {
        let mut cmd = spec.command();
        cmd.stdin(stdin).stderr(Stdio::piped());
        let capture_stdout = matches!(stdout, StdoutMode::Capture);
        match stdout {
            StdoutMode::Pipe | StdoutMode::Capture => {
                cmd.stdout(Stdio::piped());
            }
            StdoutMode::To(stdio) => {
                cmd.stdout(stdio);
            }
        }

        let mut child = cmd.spawn()?;
        // `cmd` still holds the parent's copies of any redirected descriptors;
        // release them now so the child owns the only ones.
        drop(cmd);

        debug!(stage = %spec.name, pid = ?child.id(), command = %spec.command_line(), "Spawned");

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("stderr pipe missing after spawn"))?;
        let stderr_capture = OutputCapture::start(stderr, spec.name.clone(), "stderr");

        let stdout_capture = if capture_stdout {
            let out = child
                .stdout
                .take()
                .ok_or_else(|| std::io::Error::other("stdout pipe missing after spawn"))?;
            Some(OutputCapture::start(out, spec.name.clone(), "stdout"))
        } else {
            None
        };

        Ok(Self {
            spec: spec.clone(),
            child,
            stdout_capture,
            stderr_capture,
            status: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Take the piped stdout (only with [`StdoutMode::Pipe`]).
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the piped stdin (only when spawned with `Stdio::piped()`).
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Non-blocking exit check.
    pub fn try_exit_status(&mut self) -> std::io::Result<Option<ExitStatus>> {
        if self.status.is_none() {
            self.status = self.child.try_wait()?;
        }
        Ok(self.status)
    }

    /// Captured output after letting the drain tasks reach end-of-stream.
    pub async fn drain_output(&mut self) -> CapturedOutput {
        let stdout = match self.stdout_capture.as_mut() {
            Some(capture) => capture.finish().await,
            None => String::new(),
        };
        let stderr = self.stderr_capture.finish().await;
        CapturedOutput { stdout, stderr }
    }

    /// Wait for exit (cached after the first observation).
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.status = Some(status);
        Ok(status)
    }

    /// Wait for exit and collect stderr. Never short-circuits on failure.
    pub async fn finish(mut self) -> StageReport {
        let (status, wait_error) = match self.wait().await {
            Ok(status) => (Some(status), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let stderr = self.stderr_capture.finish().await;
        debug!(stage = %self.spec.name, status = ?status, "Stage finished");
        StageReport {
            name: self.spec.name.clone(),
            command_line: self.spec.command_line(),
            status,
            stderr,
            wait_error,
        }
    }

    /// Graceful stop: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Already-exited processes are left alone. Never fails; problems are
    /// logged.
    pub async fn terminate(&mut self, grace: Duration) {
        match self.try_exit_status() {
            Ok(Some(status)) => {
                debug!(stage = %self.spec.name, status = ?status, "Already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(stage = %self.spec.name, error = %e, "Failed to poll process"),
        }

        self.request_stop();

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(Ok(status)) => {
                info!(stage = %self.spec.name, status = ?status, "Process exited");
                return;
            }
            Ok(Err(e)) => warn!(stage = %self.spec.name, error = %e, "Error waiting for process"),
            Err(_) => warn!(
                stage = %self.spec.name,
                grace_ms = grace.as_millis() as u64,
                "Process didn't exit gracefully, killing"
            ),
        }

        if let Err(e) = self.child.start_kill() {
            warn!(stage = %self.spec.name, error = %e, "Failed to kill process");
        }
        match self.wait().await {
            Ok(status) => debug!(stage = %self.spec.name, status = ?status, "Process killed"),
            Err(e) => warn!(stage = %self.spec.name, error = %e, "Error reaping killed process"),
        }
    }

    #[cfg(unix)]
    fn request_stop(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(stage = %self.spec.name, pid, error = %e, "Failed to send SIGTERM");
        }
    }

    #[cfg(not(unix))]
    fn request_stop(&mut self) {
        // No polite signal available; the grace period still lets a process
        // that is already shutting down finish on its own.
        let _ = self.child.start_kill();
    }
}
