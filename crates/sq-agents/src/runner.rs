//! Subprocess supervision.
//!
//! [`ProcessRunner`] starts one child, captures both streams up to a cap,
//! and enforces a wall-clock deadline. When the deadline passes (or the
//! run's cancel token fires) the child's process group receives SIGTERM,
//! then SIGKILL after the grace interval. `run` only returns once the child
//! has been reaped.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sq_core::cancel::CancelToken;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub const DEFAULT_OUTPUT_CAP: usize = 1024 * 1024;
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// How long to keep draining pipes after the child exits. Grandchildren that
/// inherited the pipes can otherwise hold them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("empty command line")]
    EmptyCommand,
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RunnerError>;

// ---------------------------------------------------------------------------
// RunRequest / RunOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl RunRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            stdin: None,
            env: BTreeMap::new(),
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// `sh -c <command>`.
    pub fn shell(command: &str) -> Self {
        Self::new(["sh", "-c", command])
    }

    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Exit code; `128 + signal` when the child died from a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub wall_clock: Duration,
    pub timed_out: bool,
    pub cancelled: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }

    pub fn wall_clock_seconds(&self) -> f64 {
        self.wall_clock.as_secs_f64()
    }
}

// ---------------------------------------------------------------------------
// CommandRunner trait
// ---------------------------------------------------------------------------

/// Seam between agents and real subprocesses.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. Errors only when the process could not be started.
    async fn run(&self, request: RunRequest, cancel: &CancelToken) -> Result<RunOutcome>;
}

// ---------------------------------------------------------------------------
// ProcessRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    output_cap: usize,
    grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            output_cap: DEFAULT_OUTPUT_CAP,
            grace: DEFAULT_GRACE,
        }
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output_cap(mut self, bytes: usize) -> Self {
        self.output_cap = bytes.max(1);
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// SIGTERM the group, wait `grace`, then SIGKILL and reap.
    async fn terminate(&self, child: &mut Child, program: &str) -> Result<ExitStatus> {
        let pid = child.id();
        signal_group(pid, Signal::Terminate);
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                // The leader is gone; make sure nothing it spawned survives.
                signal_group(pid, Signal::Kill);
                return Ok(status);
            }
            Ok(Err(source)) => {
                return Err(RunnerError::Wait {
                    program: program.to_string(),
                    source,
                })
            }
            Err(_) => {
                warn!(program, ?pid, "child ignored SIGTERM; killing");
            }
        }
        signal_group(pid, Signal::Kill);
        let _ = child.start_kill();
        child.wait().await.map_err(|source| RunnerError::Wait {
            program: program.to_string(),
            source,
        })
    }
}

enum Finish {
    Exited(std::io::Result<ExitStatus>),
    Deadline,
    Cancelled,
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, request: RunRequest, cancel: &CancelToken) -> Result<RunOutcome> {
        let (program, args) = request
            .argv
            .split_first()
            .ok_or(RunnerError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&request.env)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: program.clone(),
            source,
        })?;
        debug!(program = %program, pid = ?child.id(), "spawned");

        if let (Some(input), Some(mut stdin)) = (request.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            });
        }

        let stdout_buf = Arc::new(Mutex::new(CappedBuffer::new(self.output_cap)));
        let stderr_buf = Arc::new(Mutex::new(CappedBuffer::new(self.output_cap)));
        let stdout_task = child
            .stdout
            .take()
            .map(|r| tokio::spawn(drain(r, Arc::clone(&stdout_buf))));
        let stderr_task = child
            .stderr
            .take()
            .map(|r| tokio::spawn(drain(r, Arc::clone(&stderr_buf))));

        let finish = tokio::select! {
            res = child.wait() => Finish::Exited(res),
            _ = tokio::time::sleep(request.timeout) => Finish::Deadline,
            _ = cancel.cancelled() => Finish::Cancelled,
        };

        let (status, timed_out, cancelled) = match finish {
            Finish::Exited(res) => {
                let status = res.map_err(|source| RunnerError::Wait {
                    program: program.clone(),
                    source,
                })?;
                (status, false, false)
            }
            Finish::Deadline => {
                info!(program = %program, timeout_s = request.timeout.as_secs_f64(), "deadline exceeded; terminating");
                (self.terminate(&mut child, program).await?, true, false)
            }
            Finish::Cancelled => {
                info!(program = %program, "cancelled; terminating");
                (self.terminate(&mut child, program).await?, false, true)
            }
        };

        for mut task in [stdout_task, stderr_task].into_iter().flatten() {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
                debug!(program = %program, "output pipe still open after exit; abandoning drain");
            }
        }

        let wall_clock = started.elapsed();
        let (stdout, stdout_truncated) = take_text(&stdout_buf);
        let (stderr, stderr_truncated) = take_text(&stderr_buf);
        let exit_code = exit_code_of(&status);

        debug!(
            program = %program,
            exit_code,
            timed_out,
            cancelled,
            elapsed_ms = wall_clock.as_millis() as u64,
            "process finished"
        );

        Ok(RunOutcome {
            exit_code,
            stdout,
            stderr,
            wall_clock,
            timed_out,
            cancelled,
            stdout_truncated,
            stderr_truncated,
        })
    }
}

// ---------------------------------------------------------------------------
// Output capture
// ---------------------------------------------------------------------------

struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    dropped: usize,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            dropped: 0,
        }
    }

    fn extend(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        let keep = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..keep]);
        self.dropped += chunk.len() - keep;
    }
}

/// Read until EOF, keeping at most `cap` bytes. Reading continues past the
/// cap so the child never blocks on a full pipe.
async fn drain<R: AsyncRead + Unpin>(mut reader: R, buf: Arc<Mutex<CappedBuffer>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend(&chunk[..n]),
        }
    }
}

fn take_text(buf: &Arc<Mutex<CappedBuffer>>) -> (String, bool) {
    let guard = buf.lock().unwrap_or_else(|e| e.into_inner());
    let mut text = String::from_utf8_lossy(&guard.data).into_owned();
    let truncated = guard.dropped > 0;
    if truncated {
        if !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("[output truncated: {} bytes omitted]", guard.dropped));
    }
    (text, truncated)
}

fn exit_code_of(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

/// Signal the whole process group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child was started with process_group(0), so its pgid equals its pid.
    unsafe {
        libc::kill(-(pid as i32), sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
