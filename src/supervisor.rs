//! Server process lifecycle: spawn the child, forward its output line by line,
//! publish its exit, and terminate it on request.
//!
//! The supervisor never restarts anything itself. Restart policy belongs to
//! the watchdog and the launcher that owns it.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long `await_exit` waits for the output forwarders to drain.
const FORWARDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to start the server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

/// Which child stream a forwarded line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLabel {
    Stdout,
    Stderr,
}

impl StreamLabel {
    pub fn prefix(&self) -> &'static str {
        match self {
            StreamLabel::Stdout => "SERVER",
            StreamLabel::Stderr => "SERVER-ERROR",
        }
    }
}

/// Destination for forwarded child output.
pub trait OutputSink: Send + Sync + 'static {
    fn line(&self, label: StreamLabel, line: &str);
}

/// Prints `[SERVER] ...` / `[SERVER-ERROR] ...` to the launcher's stdout.
pub struct ConsoleSink;

impl OutputSink for ConsoleSink {
    fn line(&self, label: StreamLabel, line: &str) {
        println!("[{}] {}", label.prefix(), line);
    }
}

/// Liveness of the supervised process as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// `code` is `None` when the process was killed by a signal.
    Exited { code: Option<i32> },
}

/// Errors that prevent the server process from starting.
#[derive(Debug)]
pub enum LaunchError {
    /// The configured working directory does not exist.
    WorkingDir { path: PathBuf },
    /// The executable could not be found.
    NotFound {
        program: String,
        source: std::io::Error,
    },
    /// The executable exists but may not be executed.
    PermissionDenied {
        program: String,
        source: std::io::Error,
    },
    /// The OS refused to spawn the process for another reason.
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::WorkingDir { path } => {
                write!(f, "working directory {} does not exist", path.display())
            }
            LaunchError::NotFound { program, source } => {
                write!(f, "executable '{program}' not found: {source}")
            }
            LaunchError::PermissionDenied { program, source } => {
                write!(f, "executable '{program}' is not runnable: {source}")
            }
            LaunchError::Spawn { program, source } => {
                write!(f, "failed to spawn '{program}': {source}")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::WorkingDir { .. } => None,
            LaunchError::NotFound { source, .. } => Some(source),
            LaunchError::PermissionDenied { source, .. } => Some(source),
            LaunchError::Spawn { source, .. } => Some(source),
        }
    }
}

/// I/O failure while forwarding one of the child's streams.
#[derive(Debug)]
pub struct StreamError {
    pub label: StreamLabel,
    pub source: std::io::Error,
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to read {} stream: {}", self.label.prefix(), self.source)
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Result of a process that ran to completion.
#[derive(Debug)]
pub struct ExitReport {
    pub pid: u32,
    /// Process exit code (None if killed by signal).
    pub code: Option<i32>,
    pub uptime: Duration,
}

/// The running server process. There is at most one per launcher at a time.
pub struct SupervisedProcess {
    pid: u32,
    child: Child,
    status: watch::Sender<ProcessStatus>,
    forwarders: Vec<JoinHandle<Result<u64, StreamError>>>,
    started: Instant,
}

/// Cheap, cloneable view of a [`SupervisedProcess`] for observers.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    status: watch::Receiver<ProcessStatus>,
}

/// Start the server process described by `spec`.
///
/// The child gets its own process group so [`ProcessHandle::terminate`] can
/// signal everything it spawned. Both output streams are forwarded to `sink`
/// until they reach end-of-stream.
pub fn launch(spec: &LaunchSpec, sink: Arc<dyn OutputSink>) -> Result<SupervisedProcess, LaunchError> {
    if !spec.working_dir.is_dir() {
        return Err(LaunchError::WorkingDir {
            path: spec.working_dir.clone(),
        });
    }

    tracing::info!(
        program = %spec.program,
        args = ?spec.args,
        working_dir = %spec.working_dir.display(),
        "launching server process"
    );

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|e| {
            let program = spec.program.clone();
            match e.kind() {
                std::io::ErrorKind::NotFound => LaunchError::NotFound { program, source: e },
                std::io::ErrorKind::PermissionDenied => {
                    LaunchError::PermissionDenied { program, source: e }
                }
                _ => LaunchError::Spawn { program, source: e },
            }
        })?;

    let pid = child.id().unwrap_or(0);
    tracing::info!(pid, "server process started");

    let mut forwarders = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        forwarders.push(tokio::spawn(forward_lines(
            stdout,
            StreamLabel::Stdout,
            Arc::clone(&sink),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        forwarders.push(tokio::spawn(forward_lines(
            stderr,
            StreamLabel::Stderr,
            Arc::clone(&sink),
        )));
    }

    let (status, _) = watch::channel(ProcessStatus::Running);
    Ok(SupervisedProcess {
        pid,
        child,
        status,
        forwarders,
        started: Instant::now(),
    })
}

/// Copy `reader` to `sink` line by line. Ends cleanly at end-of-stream.
async fn forward_lines<R>(
    reader: R,
    label: StreamLabel,
    sink: Arc<dyn OutputSink>,
) -> Result<u64, StreamError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut lines = 0u64;
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| StreamError { label, source: e })?;
        if n == 0 {
            return Ok(lines);
        }
        let text = String::from_utf8_lossy(&buf);
        sink.line(label, text.trim_end_matches(['\n', '\r']));
        lines += 1;
    }
}

impl SupervisedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// A handle observers can use to check liveness or request termination.
    pub fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            pid: self.pid,
            status: self.status.subscribe(),
        }
    }

    /// Block until the process terminates, then publish and report its exit.
    ///
    /// Only logs the exit; it never relaunches.
    pub async fn await_exit(mut self) -> Result<ExitReport, std::io::Error> {
        let waited = self.child.wait().await;
        let code = match &waited {
            Ok(status) => status.code(),
            Err(_) => None,
        };
        self.status.send_replace(ProcessStatus::Exited { code });
        let status = waited?;

        for forwarder in self.forwarders.drain(..) {
            match tokio::time::timeout(FORWARDER_DRAIN_TIMEOUT, forwarder).await {
                Ok(Ok(Ok(lines))) => tracing::debug!(pid = self.pid, lines, "output stream closed"),
                Ok(Ok(Err(e))) => tracing::warn!(pid = self.pid, error = %e, "output forwarding failed"),
                Ok(Err(e)) => tracing::warn!(pid = self.pid, error = %e, "output forwarder panicked"),
                Err(_) => tracing::warn!(pid = self.pid, "output stream still open after exit"),
            }
        }

        let uptime = self.started.elapsed();
        tracing::info!(
            pid = self.pid,
            exit_code = ?status.code(),
            uptime_secs = uptime.as_secs(),
            "server process exited"
        );

        Ok(ExitReport {
            pid: self.pid,
            code: status.code(),
            uptime,
        })
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.status() == ProcessStatus::Running
    }

    /// Wait until the process has exited.
    pub async fn exited(&self) -> ProcessStatus {
        let mut rx = self.status.clone();
        let result = rx
            .wait_for(|s| *s != ProcessStatus::Running)
            .await
            .map(|status| *status);
        match result {
            Ok(status) => status,
            // Publisher gone without reporting: nobody is reaping the child.
            Err(_) => ProcessStatus::Exited { code: None },
        }
    }

    /// SIGTERM the process group, then SIGKILL it if it outlives `grace`.
    ///
    /// Requires something to be awaiting [`SupervisedProcess::await_exit`] so
    /// the exit gets published.
    pub async fn terminate(&self, grace: Duration) -> ProcessStatus {
        if !self.is_alive() || self.pid == 0 {
            return self.status();
        }
        let pgid = Pid::from_raw(self.pid as i32);

        tracing::info!(pid = self.pid, "sending SIGTERM to server process group");
        if let Err(e) = killpg(pgid, Signal::SIGTERM) {
            tracing::warn!(pid = self.pid, error = %e, "SIGTERM failed");
        }
        if let Ok(status) = tokio::time::timeout(grace, self.exited()).await {
            return status;
        }

        tracing::warn!(
            pid = self.pid,
            grace_secs = grace.as_secs(),
            "server ignored SIGTERM, sending SIGKILL"
        );
        if let Err(e) = killpg(pgid, Signal::SIGKILL) {
            tracing::warn!(pid = self.pid, error = %e, "SIGKILL failed");
        }
        match tokio::time::timeout(grace, self.exited()).await {
            Ok(status) => status,
            Err(_) => self.status(),
        }
    }

    /// A handle driven by the returned sender instead of a real child.
    #[cfg(test)]
    pub(crate) fn detached(pid: u32) -> (watch::Sender<ProcessStatus>, ProcessHandle) {
        let (tx, rx) = watch::channel(ProcessStatus::Running);
        (tx, ProcessHandle { pid, status: rx })
    }
}
