//! Process Orchestrator
//!
//! Runs the external conversational tool as a supervised child process:
//! admission against a concurrency ceiling, a per-process wall-clock budget,
//! cancellation by id, and cleanup on every exit path.
//!
//! # Lifecycle
//!
//! 1. Validate the request (message size, resume token, working directory).
//!    Nothing is spawned for an invalid request.
//! 2. Take a slot. At the ceiling the request fails with
//!    [`ProcessError::Overloaded`]; there is no queue.
//! 3. Spawn in its own process group, write the message to stdin, close it.
//! 4. A supervisor task reads stdout, watches the deadline and the cancel
//!    token, and reaps the child. Termination sends SIGTERM to the group,
//!    waits `kill_grace`, then SIGKILLs.
//! 5. The table entry and the slot are released by a guard owned by the
//!    supervisor, so they go away however it ends.
//!
//! In streaming mode each stdout line is forwarded as a [`ProcessChunk`] as
//! soon as it is read; dropping the [`ProcessStream`] kills the process.

mod command;
mod state;

pub use command::{validate_resume_token, MAX_RESUME_TOKEN_LEN};
pub use state::{ProcessId, ProcessState};

use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures::{Future, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use command::Conversation;

// ============================================================================
// Errors
// ============================================================================

/// Process Orchestrator errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Every slot is taken
    #[error("too many concurrent processes ({ceiling} running)")]
    Overloaded {
        /// Configured ceiling
        ceiling: usize,
    },

    /// The request was rejected before anything was spawned
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// What was wrong
        reason: String,
    },

    /// A requested path escaped its allowed root
    #[error("path violation: {target}")]
    PathViolation {
        /// What was rejected
        target: String,
    },

    /// The tool could not be started
    #[error("failed to start '{program}': {source}")]
    SpawnFailure {
        /// Program name
        program: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The tool exited with a non-zero status
    #[error("tool exited with {}", describe_exit(*exit_code))]
    ExitFailure {
        /// Exit code, absent when killed by a signal
        exit_code: Option<i32>,
        /// Tail of stderr
        stderr: String,
    },

    /// The tool exceeded its wall-clock budget and was terminated
    #[error("tool exceeded its {}s timeout", timeout.as_secs())]
    TimedOut {
        /// The budget that was exceeded
        timeout: Duration,
        /// Tail of stderr
        stderr: String,
    },

    /// The process was cancelled
    #[error("process was cancelled")]
    Killed,

    /// The supervisor stopped unexpectedly
    #[error("process supervisor failed: {0}")]
    Supervisor(String),
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// How the tool is invoked and how many may run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Program to run
    pub program: String,
    /// Arguments passed on every invocation
    pub args: Vec<String>,
    /// Extra arguments in buffered mode
    pub buffered_args: Vec<String>,
    /// Extra arguments in streaming mode
    pub streaming_args: Vec<String>,
    /// Flag preceding a resume token
    pub resume_flag: String,
    /// Flag preceding a freshly minted conversation token
    pub session_flag: String,
    /// Maximum concurrent processes
    pub max_concurrent: usize,
    /// Wall-clock budget per process
    pub timeout: Duration,
    /// Wait between SIGTERM and SIGKILL
    pub kill_grace: Duration,
    /// Largest accepted message, in bytes
    pub max_message_bytes: usize,
    /// How much stderr is kept, from the end
    pub stderr_excerpt_bytes: usize,
    /// Working directory when a request names none
    pub default_workdir: Option<PathBuf>,
    /// Requested working directories must sit under this root
    pub allowed_workdir_root: Option<PathBuf>,
    /// Capacity of the streaming chunk channel
    pub chunk_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec!["--print".to_string()],
            buffered_args: vec!["--output-format".to_string(), "json".to_string()],
            streaming_args: vec![
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
            resume_flag: "--resume".to_string(),
            session_flag: "--session-id".to_string(),
            max_concurrent: 10,
            timeout: Duration::from_secs(120),
            kill_grace: Duration::from_secs(2),
            max_message_bytes: 100 * 1024,
            stderr_excerpt_bytes: 8 * 1024,
            default_workdir: None,
            allowed_workdir_root: None,
            chunk_capacity: 64,
        }
    }
}

impl OrchestratorConfig {
    /// Run `program` with the given base arguments
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.args = args;
        self
    }

    /// Set the concurrency ceiling
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the per-process timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ============================================================================
// Requests and results
// ============================================================================

/// Output mode of an invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Collect everything, return once
    #[default]
    Buffered,
    /// Forward output as it is produced
    Streaming,
}

/// One message for the tool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRequest {
    /// Message text, written to the tool's stdin
    pub message: String,
    /// Conversation to continue
    #[serde(default)]
    pub resume_token: Option<String>,
    /// Working directory for the tool
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Output mode
    #[serde(default)]
    pub mode: ExecutionMode,
}

impl ProcessRequest {
    /// A buffered request
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Continue a conversation
    #[must_use]
    pub fn with_resume_token(mut self, token: impl Into<String>) -> Self {
        self.resume_token = Some(token.into());
        self
    }

    /// Run in `dir`
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the output mode
    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Result of a buffered invocation that exited 0
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessOutput {
    /// Process id
    pub id: ProcessId,
    /// Token for continuing the conversation
    pub resume_token: String,
    /// Exit code
    pub exit_code: Option<i32>,
    /// Raw stdout
    pub stdout: String,
    /// Stdout parsed as JSON, when it is JSON
    pub structured: Option<Value>,
    /// Tail of stderr
    pub stderr: String,
    /// Wall-clock run time in milliseconds
    pub duration_ms: u64,
}

/// One line of streaming output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessChunk {
    /// The raw line, without its terminator
    pub line: String,
    /// The line parsed as JSON, when it is JSON
    pub structured: Option<Value>,
}

impl ProcessChunk {
    fn from_line(line: String) -> Self {
        let structured = serde_json::from_str(line.trim()).ok();
        Self { line, structured }
    }
}

/// How a process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessOutcome {
    /// Terminal state
    pub state: ProcessState,
    /// Exit code, absent when killed by a signal
    pub exit_code: Option<i32>,
    /// Tail of stderr
    pub stderr: String,
    /// Wall-clock run time in milliseconds
    pub duration_ms: u64,
}

impl ProcessOutcome {
    /// Convert a non-successful outcome into the matching error
    ///
    /// # Errors
    ///
    /// Returns the error for any state other than `Completed`.
    pub fn into_result(self, timeout: Duration) -> Result<Self, ProcessError> {
        match self.state {
            ProcessState::Completed => Ok(self),
            ProcessState::TimedOut => Err(ProcessError::TimedOut {
                timeout,
                stderr: self.stderr,
            }),
            ProcessState::Killed => Err(ProcessError::Killed),
            _ => Err(ProcessError::ExitFailure {
                exit_code: self.exit_code,
                stderr: self.stderr,
            }),
        }
    }
}

/// Item of a [`ProcessStream`]
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// One stdout line
    Chunk(ProcessChunk),
    /// The process ended; always the last item
    Exited(ProcessOutcome),
}

/// Live output of a streaming invocation
///
/// Yields every stdout line, then one [`ProcessEvent::Exited`]. Dropping it
/// terminates the process.
#[derive(Debug)]
pub struct ProcessStream {
    id: ProcessId,
    resume_token: String,
    chunks: mpsc::Receiver<ProcessChunk>,
    outcome: Option<oneshot::Receiver<ProcessOutcome>>,
    _cancel: DropGuard,
}

impl ProcessStream {
    /// Process id, for cancellation
    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Token for continuing the conversation
    #[must_use]
    pub fn resume_token(&self) -> &str {
        &self.resume_token
    }
}

impl Stream for ProcessStream {
    type Item = ProcessEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        match this.chunks.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => return Poll::Ready(Some(ProcessEvent::Chunk(chunk))),
            Poll::Pending => return Poll::Pending,
            Poll::Ready(None) => {}
        }
        let Some(outcome) = this.outcome.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(outcome).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.outcome = None;
                Poll::Ready(result.ok().map(ProcessEvent::Exited))
            }
        }
    }
}

/// Result of [`ProcessOrchestrator::execute`]
#[derive(Debug)]
pub enum Execution {
    /// Buffered mode, exited 0
    Completed(ProcessOutput),
    /// Streaming mode, running
    Streaming(ProcessStream),
}

/// Snapshot of the process table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStats {
    /// Processes currently admitted
    pub active: usize,
    /// Concurrency ceiling
    pub ceiling: usize,
    /// Ids of admitted processes
    pub active_ids: Vec<ProcessId>,
}

// ============================================================================
// Process table
// ============================================================================

#[derive(Debug)]
struct ProcessEntry {
    state: ProcessState,
    cancel: CancellationToken,
}

type ProcessTable = DashMap<ProcessId, ProcessEntry>;

/// Holds a slot and a table entry; releases both on drop
struct TableGuard {
    table: Arc<ProcessTable>,
    id: ProcessId,
    _permit: OwnedSemaphorePermit,
}

impl TableGuard {
    fn advance(&self, next: ProcessState) {
        if let Some(mut entry) = self.table.get_mut(&self.id) {
            entry.state.advance(next);
        }
    }
}

impl Drop for TableGuard {
    fn drop(&mut self) {
        self.table.remove(&self.id);
        tracing::debug!(process_id = %self.id, "Released process slot");
    }
}

// ============================================================================
// Supervision
// ============================================================================

enum Verdict {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

struct Supervision {
    outcome: ProcessOutcome,
    stdout: String,
}

struct SupervisorJob {
    guard: TableGuard,
    child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    chunks: Option<mpsc::Sender<ProcessChunk>>,
    cancel: CancellationToken,
    timeout: Duration,
    kill_grace: Duration,
    stderr_excerpt_bytes: usize,
    started: Instant,
}

async fn supervise(job: SupervisorJob) -> Supervision {
    let SupervisorJob {
        guard,
        mut child,
        stdout,
        stderr,
        chunks,
        cancel,
        timeout,
        kill_grace,
        stderr_excerpt_bytes,
        started,
    } = job;
    let id = guard.id;

    let stderr_task = tokio::spawn(collect_stderr(stderr, stderr_excerpt_bytes));
    let mut lines = BufReader::new(stdout).lines();
    let mut stdout_open = true;
    let mut collected = String::new();
    let deadline = tokio::time::sleep_until(started + timeout);
    tokio::pin!(deadline);

    let verdict = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break Verdict::Cancelled,
            () = &mut deadline => break Verdict::TimedOut,
            line = lines.next_line(), if stdout_open => match line {
                Ok(Some(line)) => match &chunks {
                    Some(tx) => {
                        // A stalled consumer must not outlive the deadline
                        let stalled = tokio::select! {
                            biased;
                            () = cancel.cancelled() => Some(Verdict::Cancelled),
                            () = &mut deadline => Some(Verdict::TimedOut),
                            sent = tx.send(ProcessChunk::from_line(line)) => {
                                sent.is_err().then_some(Verdict::Cancelled)
                            }
                        };
                        if let Some(verdict) = stalled {
                            break verdict;
                        }
                    }
                    None => {
                        collected.push_str(&line);
                        collected.push('\n');
                    }
                },
                Ok(None) => stdout_open = false,
                Err(error) => {
                    tracing::warn!(process_id = %id, error = %error, "Stopped reading tool output");
                    stdout_open = false;
                }
            },
            status = child.wait(), if !stdout_open => break Verdict::Exited(status),
        }
    };
    drop(chunks);

    let (state, exit_code) = match verdict {
        Verdict::Exited(Ok(status)) if status.success() => {
            (ProcessState::Completed, status.code())
        }
        Verdict::Exited(Ok(status)) => (ProcessState::Failed, status.code()),
        Verdict::Exited(Err(error)) => {
            tracing::warn!(process_id = %id, error = %error, "Failed to reap tool process");
            (ProcessState::Failed, None)
        }
        Verdict::Cancelled => {
            let status = terminate(&mut child, id, kill_grace).await;
            (ProcessState::Killed, status.and_then(|s| s.code()))
        }
        Verdict::TimedOut => {
            tracing::warn!(
                process_id = %id,
                timeout_secs = timeout.as_secs(),
                "Tool process timed out"
            );
            let status = terminate(&mut child, id, kill_grace).await;
            (ProcessState::TimedOut, status.and_then(|s| s.code()))
        }
    };

    let stderr = match tokio::time::timeout(kill_grace, stderr_task).await {
        Ok(Ok(excerpt)) => excerpt,
        _ => String::new(),
    };
    guard.advance(state);
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    tracing::info!(
        process_id = %id,
        state = %state,
        exit_code = ?exit_code,
        duration_ms,
        "Tool process finished"
    );
    drop(guard);

    Supervision {
        outcome: ProcessOutcome {
            state,
            exit_code,
            stderr,
            duration_ms,
        },
        stdout: collected,
    }
}

/// SIGTERM the process group, wait `grace`, then SIGKILL
async fn terminate(child: &mut Child, id: ProcessId, grace: Duration) -> Option<ExitStatus> {
    #[cfg(unix)]
    signal_group(child, nix::sys::signal::Signal::SIGTERM);

    if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
        tracing::debug!(process_id = %id, "Tool process exited after SIGTERM");
        return Some(status);
    }

    tracing::debug!(process_id = %id, "Tool process ignored SIGTERM, killing");
    #[cfg(unix)]
    signal_group(child, nix::sys::signal::Signal::SIGKILL);
    if let Err(error) = child.kill().await {
        tracing::debug!(process_id = %id, error = %error, "Kill after SIGKILL failed");
    }
    child.try_wait().ok().flatten()
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) {
    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(error) = nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pid), signal) {
        tracing::debug!(pid, signal = ?signal, error = %error, "Signalling process group failed");
    }
}

/// Drain stderr, keeping the last `limit` bytes
async fn collect_stderr(stderr: ChildStderr, limit: usize) -> String {
    let mut reader = BufReader::new(stderr);
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > limit.saturating_mul(2) {
                    tail.drain(..tail.len() - limit);
                }
            }
        }
    }
    if tail.len() > limit {
        tail.drain(..tail.len() - limit);
    }
    String::from_utf8_lossy(&tail).into_owned()
}

/// Parse buffered stdout: the whole text as JSON, else the last JSON line
fn parse_structured(stdout: &str) -> Option<Value> {
    serde_json::from_str(stdout.trim()).ok().or_else(|| {
        stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str(line.trim()).ok())
    })
}

// ============================================================================
// Orchestrator
// ============================================================================

struct Spawned {
    id: ProcessId,
    conversation: Conversation,
    job: SupervisorJob,
}

/// Process Orchestrator service
///
/// Cheap to clone; clones share the process table and the slots.
#[derive(Debug, Clone)]
pub struct ProcessOrchestrator {
    config: Arc<OrchestratorConfig>,
    slots: Arc<Semaphore>,
    table: Arc<ProcessTable>,
}

impl ProcessOrchestrator {
    /// Create an orchestrator
    #[must_use]
    pub fn new(config: OrchestratorConfig) -> Self {
        let ceiling = config.max_concurrent.max(1);
        Self {
            config: Arc::new(OrchestratorConfig {
                max_concurrent: ceiling,
                ..config
            }),
            slots: Arc::new(Semaphore::new(ceiling)),
            table: Arc::new(DashMap::new()),
        }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one request
    ///
    /// Buffered requests resolve when the process ends; streaming requests
    /// resolve as soon as the process is running. Dropping a buffered future
    /// terminates its process.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` or `PathViolation` before spawning,
    /// `Overloaded` at the ceiling, `SpawnFailure` if the tool cannot start,
    /// and, in buffered mode, `ExitFailure`, `TimedOut` or `Killed`.
    pub async fn execute(&self, request: ProcessRequest) -> Result<Execution, ProcessError> {
        match request.mode {
            ExecutionMode::Buffered => {
                self.run_buffered(request).await.map(Execution::Completed)
            }
            ExecutionMode::Streaming => {
                self.spawn_streaming(request).await.map(Execution::Streaming)
            }
        }
    }

    /// Run a request to completion, regardless of its `mode`
    ///
    /// # Errors
    ///
    /// See [`Self::execute`].
    pub async fn run_buffered(
        &self,
        request: ProcessRequest,
    ) -> Result<ProcessOutput, ProcessError> {
        let Spawned {
            id,
            conversation,
            job,
        } = self.spawn(request, ExecutionMode::Buffered, None).await?;
        let _kill_on_drop = job.cancel.clone().drop_guard();

        let supervision = tokio::spawn(supervise(job))
            .await
            .map_err(|join| ProcessError::Supervisor(join.to_string()))?;
        let outcome = supervision.outcome.into_result(self.config.timeout)?;

        let structured = parse_structured(&supervision.stdout);
        let resume_token = structured
            .as_ref()
            .and_then(|v| v.get("session_id"))
            .and_then(Value::as_str)
            .map_or_else(|| conversation.token().to_string(), str::to_string);

        Ok(ProcessOutput {
            id,
            resume_token,
            exit_code: outcome.exit_code,
            stdout: supervision.stdout,
            structured,
            stderr: outcome.stderr,
            duration_ms: outcome.duration_ms,
        })
    }

    /// Start a request in streaming mode, regardless of its `mode`
    ///
    /// # Errors
    ///
    /// See [`Self::execute`]; exit failures arrive as the final
    /// [`ProcessEvent::Exited`].
    pub async fn spawn_streaming(
        &self,
        request: ProcessRequest,
    ) -> Result<ProcessStream, ProcessError> {
        let (chunk_tx, chunk_rx) = mpsc::channel(self.config.chunk_capacity.max(1));
        let Spawned {
            id,
            conversation,
            job,
        } = self
            .spawn(request, ExecutionMode::Streaming, Some(chunk_tx))
            .await?;
        let drop_guard = job.cancel.clone().drop_guard();

        let (outcome_tx, outcome_rx) = oneshot::channel();
        tokio::spawn(async move {
            let supervision = supervise(job).await;
            let _ = outcome_tx.send(supervision.outcome);
        });

        Ok(ProcessStream {
            id,
            resume_token: conversation.token().to_string(),
            chunks: chunk_rx,
            outcome: Some(outcome_rx),
            _cancel: drop_guard,
        })
    }

    async fn spawn(
        &self,
        request: ProcessRequest,
        mode: ExecutionMode,
        chunks: Option<mpsc::Sender<ProcessChunk>>,
    ) -> Result<Spawned, ProcessError> {
        let config = &self.config;
        if request.message.len() > config.max_message_bytes {
            return Err(ProcessError::InvalidRequest {
                reason: format!(
                    "message is {} bytes, limit is {}",
                    request.message.len(),
                    config.max_message_bytes
                ),
            });
        }
        let conversation = Conversation::from_request(request.resume_token.as_deref())?;
        let workdir = command::resolve_workdir(config, request.working_dir.as_deref()).await?;

        let permit = Arc::clone(&self.slots).try_acquire_owned().map_err(|_| {
            tracing::warn!(
                ceiling = config.max_concurrent,
                "Rejected process: at concurrency ceiling"
            );
            ProcessError::Overloaded {
                ceiling: config.max_concurrent,
            }
        })?;

        let id = ProcessId::generate();
        let cancel = CancellationToken::new();
        self.table.insert(
            id,
            ProcessEntry {
                state: ProcessState::Starting,
                cancel: cancel.clone(),
            },
        );
        let guard = TableGuard {
            table: Arc::clone(&self.table),
            id,
            _permit: permit,
        };

        let mut cmd = Command::new(&config.program);
        cmd.args(command::build_args(config, mode, &conversation))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &workdir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                guard.advance(ProcessState::Failed);
                tracing::warn!(
                    process_id = %id,
                    program = %config.program,
                    error = %source,
                    "Failed to spawn tool"
                );
                return Err(ProcessError::SpawnFailure {
                    program: config.program.clone(),
                    source,
                });
            }
        };
        guard.advance(ProcessState::Running);
        tracing::info!(
            process_id = %id,
            pid = ?child.id(),
            mode = ?mode,
            resumed = matches!(conversation, Conversation::Resume(_)),
            "Spawned tool process"
        );

        if let Some(mut stdin) = child.stdin.take() {
            let message = request.message;
            tokio::spawn(async move {
                if let Err(error) = stdin.write_all(message.as_bytes()).await {
                    tracing::debug!(process_id = %id, error = %error, "Tool closed stdin early");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ProcessError::Supervisor("child pipes missing".into()));
        };

        Ok(Spawned {
            id,
            conversation,
            job: SupervisorJob {
                guard,
                child,
                stdout,
                stderr,
                chunks,
                cancel,
                timeout: config.timeout,
                kill_grace: config.kill_grace,
                stderr_excerpt_bytes: config.stderr_excerpt_bytes,
                started: Instant::now(),
            },
        })
    }

    /// Cancel a running process
    ///
    /// Returns `false` for an unknown id or a process already in a terminal
    /// state.
    pub fn cancel(&self, id: ProcessId) -> bool {
        let Some(entry) = self.table.get(&id) else {
            return false;
        };
        if entry.state.is_terminal() {
            return false;
        }
        entry.cancel.cancel();
        tracing::info!(process_id = %id, "Cancellation requested");
        true
    }

    /// Current state of a process, while it is in the table
    #[must_use]
    pub fn state(&self, id: ProcessId) -> Option<ProcessState> {
        self.table.get(&id).map(|entry| entry.state)
    }

    /// Snapshot of admitted processes
    #[must_use]
    pub fn stats(&self) -> ProcessStats {
        ProcessStats {
            active: self.table.len(),
            ceiling: self.config.max_concurrent,
            active_ids: self.table.iter().map(|entry| *entry.key()).collect(),
        }
    }

    /// Cancel everything still running
    pub fn shutdown(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.table.iter() {
            if !entry.state.is_terminal() {
                entry.cancel.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled running tool processes");
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_structured() {
        assert_eq!(parse_structured("{\"a\":1}\n"), Some(json!({"a": 1})));
        assert_eq!(
            parse_structured("{\"type\":\"init\"}\n{\"type\":\"result\"}\n\n"),
            Some(json!({"type": "result"}))
        );
        assert_eq!(parse_structured("plain text"), None);
    }

    #[test]
    fn test_outcome_into_result() {
        let outcome = |state| ProcessOutcome {
            state,
            exit_code: Some(3),
            stderr: "boom".into(),
            duration_ms: 1,
        };
        let timeout = Duration::from_secs(1);
        assert!(outcome(ProcessState::Completed).into_result(timeout).is_ok());
        assert!(matches!(
            outcome(ProcessState::Failed).into_result(timeout),
            Err(ProcessError::ExitFailure { exit_code: Some(3), ref stderr }) if stderr == "boom"
        ));
        assert!(matches!(
            outcome(ProcessState::TimedOut).into_result(timeout),
            Err(ProcessError::TimedOut { .. })
        ));
        assert!(matches!(
            outcome(ProcessState::Killed).into_result(timeout),
            Err(ProcessError::Killed)
        ));
    }

    #[tokio::test]
    async fn test_validation_happens_before_admission() {
        let orchestrator = ProcessOrchestrator::new(OrchestratorConfig::default());
        let big = "x".repeat(orchestrator.config().max_message_bytes + 1);
        assert!(matches!(
            orchestrator.run_buffered(ProcessRequest::new(big)).await,
            Err(ProcessError::InvalidRequest { .. })
        ));
        assert!(matches!(
            orchestrator
                .run_buffered(ProcessRequest::new("hi").with_resume_token("bad token"))
                .await,
            Err(ProcessError::InvalidRequest { .. })
        ));
        assert_eq!(orchestrator.stats().active, 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_slot() {
        let config = OrchestratorConfig::default()
            .with_program("/nonexistent/chronicle-tool", Vec::new())
            .with_max_concurrent(1);
        let orchestrator = ProcessOrchestrator::new(config);
        for _ in 0..2 {
            assert!(matches!(
                orchestrator.run_buffered(ProcessRequest::new("hi")).await,
                Err(ProcessError::SpawnFailure { .. })
            ));
        }
        assert_eq!(orchestrator.stats().active, 0);
    }

    #[test]
    fn test_cancel_unknown_id() {
        let orchestrator = ProcessOrchestrator::new(OrchestratorConfig::default());
        assert!(!orchestrator.cancel(ProcessId::generate()));
    }
}
