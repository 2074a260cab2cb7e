//! Query Evaluator
//!
//! Validates untrusted jq expressions and runs them, backed by jaq:
//!
//! - [`QueryEvaluator::evaluate`] over one in-memory document
//! - [`QueryEvaluator::evaluate_stream`] line by line over one log, using the
//!   per-record variant of the expression ([`rewrite`])
//! - [`QueryEvaluator::evaluate_across_logs`] over many logs, either
//!   materializing every record for one aggregating evaluation or unioning
//!   per-record streams
//!
//! # Threading
//!
//! jaq values are not `Send`. Every evaluation runs on a blocking thread that
//! compiles the expression, evaluates, and converts results back to
//! `serde_json::Value` before anything crosses a task boundary. At most
//! [`EvaluatorConfig::max_workers`] such threads run at once; a slot is held
//! until its thread returns, even after the caller has given up. Timeouts are
//! enforced on both sides: the async side stops waiting, and the blocking
//! thread sees the deadline and cancel flag between outputs, between records
//! and on every step of the looping generators.
//!
//! # Streaming
//!
//! ```text
//! LogReader --feed task--> mpsc --blocking worker--> mpsc --> RecordStream
//! ```
//!
//! Dropping a [`RecordStream`] raises the cancel flag and closes both
//! channels, so the worker and the reads stop.

pub mod cache;
mod engine;
mod lexer;
pub mod rewrite;
mod validate;

pub use cache::{
    CacheKey, CacheScope, CacheStats, CachedResult, QueryCache, DEFAULT_CACHE_CAPACITY,
};
pub use rewrite::{
    classify, per_record_variant, QueryKind, Rewrite, RewriteRule, AGGREGATION_KEYWORDS,
};
pub use validate::{DENIED_IDENTIFIERS, DENIED_SUBSTRINGS, DENIED_VARIABLES};

use std::fmt;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::store::{
    LineParseError, LogEntry, LogFingerprint, LogHandle, LogReader, LogRecord, LogStore,
    ReadOptions, StoreError,
};
use engine::{CompiledQuery, Interrupt, RunEnd};

// ============================================================================
// Errors
// ============================================================================

/// Query Evaluator errors
#[derive(Debug, Error)]
pub enum QueryError {
    /// The expression failed validation or did not compile
    #[error("invalid query: {reason}")]
    InvalidQuery {
        /// What was wrong
        reason: String,
    },

    /// Evaluation exceeded its wall-clock budget
    #[error("query exceeded its {}ms timeout", timeout.as_millis())]
    Timeout {
        /// The budget that was exceeded
        timeout: Duration,
    },

    /// Evaluation of a single document failed
    #[error("query evaluation failed: {message}")]
    Evaluation {
        /// Engine message
        message: String,
    },

    /// A log could not be read
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Every evaluation worker stayed busy until the deadline
    #[error("all {workers} query workers are busy")]
    Busy {
        /// Worker ceiling
        workers: usize,
    },

    /// The evaluation worker stopped unexpectedly
    #[error("query worker failed: {0}")]
    Worker(String),
}

// ============================================================================
// Configuration and options
// ============================================================================

/// Evaluator limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatorConfig {
    /// Timeout when a request gives none
    pub default_timeout: Duration,
    /// Upper bound for per-request timeouts
    pub max_timeout: Duration,
    /// Longest accepted expression, in bytes
    pub max_expression_length: usize,
    /// Hard cap on results per request
    pub max_results: usize,
    /// Wall-clock budget for the validation dummy runs
    pub validation_budget: Duration,
    /// Capacity of the streaming channels
    pub channel_capacity: usize,
    /// Concurrent blocking evaluation threads
    pub max_workers: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(120),
            max_expression_length: 10_000,
            max_results: 10_000,
            validation_budget: Duration::from_millis(250),
            channel_capacity: 64,
            max_workers: 4,
        }
    }
}

/// Per-request evaluation options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Timeout override, clamped to [`EvaluatorConfig::max_timeout`]
    pub timeout: Option<Duration>,
    /// Maximum number of results
    pub limit: Option<usize>,
}

impl QueryOptions {
    /// Set the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the result limit
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

// ============================================================================
// Results
// ============================================================================

/// Normalized result of one evaluation
///
/// `Empty` (no match) and `Single(Value::Null)` (a null match) are distinct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum QueryOutput {
    /// No output
    Empty,
    /// Exactly one output
    Single(Value),
    /// Two or more outputs, in emission order
    Many(Vec<Value>),
}

impl QueryOutput {
    /// Normalize a list of outputs
    #[must_use]
    pub fn from_values(mut values: Vec<Value>) -> Self {
        match values.len() {
            0 => Self::Empty,
            1 => values.pop().map_or(Self::Empty, Self::Single),
            _ => Self::Many(values),
        }
    }

    /// Number of outputs
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Single(_) => 1,
            Self::Many(values) => values.len(),
        }
    }

    /// Whether there were no outputs
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// The outputs as a list
    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        match self {
            Self::Empty => Vec::new(),
            Self::Single(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

/// What a diagnostic is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A log line was not valid JSON
    LineParse,
    /// The expression failed on one record
    Evaluation,
    /// A whole log could not be read
    LogUnavailable,
}

/// A per-item problem that did not abort the batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Kind of problem
    pub kind: DiagnosticKind,
    /// Log concerned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogHandle>,
    /// 1-based line concerned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    /// Message
    pub message: String,
}

impl Diagnostic {
    /// A malformed line
    #[must_use]
    pub fn line_parse(log: &LogHandle, error: &LineParseError) -> Self {
        Self {
            kind: DiagnosticKind::LineParse,
            log: Some(log.clone()),
            line: Some(error.line),
            message: error.message.clone(),
        }
    }

    /// An evaluation failure on one record
    #[must_use]
    pub fn evaluation(log: &LogHandle, line: usize, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Evaluation,
            log: Some(log.clone()),
            line: Some(line),
            message: message.into(),
        }
    }

    /// A log that could not be read
    #[must_use]
    pub fn log_unavailable(log: &LogHandle, error: &dyn fmt::Display) -> Self {
        Self {
            kind: DiagnosticKind::LogUnavailable,
            log: Some(log.clone()),
            line: None,
            message: error.to_string(),
        }
    }
}

/// Result of [`QueryEvaluator::evaluate_stream`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvaluation {
    /// Results in record order
    pub results: Vec<Value>,
    /// Per-line problems
    pub diagnostics: Vec<Diagnostic>,
    /// Non-blank lines consumed, malformed ones included
    pub lines_processed: usize,
    /// Whether results stopped at the limit
    pub truncated: bool,
    /// Rewrite applied to the expression
    pub rewrite: RewriteRule,
}

/// Whether result order follows input order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOrdering {
    /// Results follow log order, then line order
    InputOrder,
    /// The expression may reorder (grouping, sorting)
    Unspecified,
}

/// Result of [`QueryEvaluator::evaluate_across_logs`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateResult {
    /// Results
    pub results: Vec<Value>,
    /// Per-line and per-log problems
    pub diagnostics: Vec<Diagnostic>,
    /// Logs read successfully
    pub logs_processed: usize,
    /// Non-blank lines read across all logs
    pub lines_processed: usize,
    /// Strategy used
    pub strategy: QueryKind,
    /// Ordering guarantee of `results`
    pub ordering: ResultOrdering,
    /// Whether results stopped at the limit
    pub truncated: bool,
    /// Whether this was served from the cache
    pub cached: bool,
}

impl AggregateResult {
    fn empty(strategy: QueryKind) -> Self {
        Self {
            results: Vec::new(),
            diagnostics: Vec::new(),
            logs_processed: 0,
            lines_processed: 0,
            strategy,
            ordering: ordering_for(strategy),
            truncated: false,
            cached: false,
        }
    }
}

fn ordering_for(strategy: QueryKind) -> ResultOrdering {
    match strategy {
        QueryKind::PerRecord => ResultOrdering::InputOrder,
        QueryKind::Aggregating => ResultOrdering::Unspecified,
    }
}

// ============================================================================
// Record streams
// ============================================================================

/// Incremental output of a per-record evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum RecordEvent {
    /// One result value
    Result(Value),
    /// One per-line problem
    Diagnostic(Diagnostic),
    /// Final event of a successful stream
    Finished(StreamSummary),
}

/// Totals reported by [`RecordEvent::Finished`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSummary {
    /// Non-blank lines consumed
    pub lines_processed: usize,
    /// Whether results stopped at the limit
    pub truncated: bool,
    /// Rewrite applied to the expression
    pub rewrite: RewriteRule,
}

/// Raises a cancel flag when dropped
#[derive(Debug)]
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Stream of [`RecordEvent`]s from one log
///
/// Ends after `Finished` or after the first `Err`. Dropping it stops the
/// evaluation.
#[derive(Debug)]
pub struct RecordStream {
    events: mpsc::Receiver<Result<RecordEvent, QueryError>>,
    _cancel: CancelOnDrop,
}

impl Stream for RecordStream {
    type Item = Result<RecordEvent, QueryError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

enum Feed {
    Entry(LogEntry),
    Malformed(LineParseError),
    Failed(StoreError),
}

async fn feed_records(mut reader: LogReader, feed: mpsc::Sender<Feed>, cancel: Arc<AtomicBool>) {
    while !cancel.load(Ordering::Relaxed) {
        let item = match reader.next_record().await {
            Ok(Some(LogRecord::Entry(entry))) => Feed::Entry(entry),
            Ok(Some(LogRecord::Malformed(error))) => Feed::Malformed(error),
            Ok(None) => break,
            Err(error) => Feed::Failed(error),
        };
        let failed = matches!(item, Feed::Failed(_));
        if feed.send(item).await.is_err() || failed {
            break;
        }
    }
    tracing::debug!(log = %reader.handle(), lines = reader.lines_read(), "Log feed stopped");
}

struct RecordJob {
    expression: String,
    rule: RewriteRule,
    handle: LogHandle,
    feed: mpsc::Receiver<Feed>,
    events: mpsc::Sender<Result<RecordEvent, QueryError>>,
    cancel: Arc<AtomicBool>,
    limit: usize,
    deadline: std::time::Instant,
    timeout: Duration,
}

/// Blocking side of a record stream
fn run_record_job(job: RecordJob) {
    let RecordJob {
        expression,
        rule,
        handle,
        mut feed,
        events,
        cancel,
        limit,
        deadline,
        timeout,
    } = job;

    let query = match CompiledQuery::compile(&expression) {
        Ok(query) => query,
        Err(reason) => {
            let _ = events.blocking_send(Err(QueryError::InvalidQuery { reason }));
            return;
        }
    };

    let interrupt = Interrupt::new(Arc::clone(&cancel)).with_deadline(deadline);
    let mut lines = 0usize;
    let mut results = 0usize;
    let mut truncated = false;

    while let Some(item) = feed.blocking_recv() {
        if cancel.load(Ordering::Relaxed) {
            return;
        }
        if std::time::Instant::now() >= deadline {
            let _ = events.blocking_send(Err(QueryError::Timeout { timeout }));
            return;
        }

        let entry = match item {
            Feed::Entry(entry) => entry,
            Feed::Malformed(error) => {
                lines += 1;
                let diag = Diagnostic::line_parse(&handle, &error);
                if events.blocking_send(Ok(RecordEvent::Diagnostic(diag))).is_err() {
                    return;
                }
                continue;
            }
            Feed::Failed(error) => {
                let _ = events.blocking_send(Err(QueryError::Store(error)));
                return;
            }
        };

        lines += 1;
        let line = entry.line;
        let mut consumer_gone = false;
        let mut timed_out = false;
        let outcome = query.run(entry.value, &interrupt, |value| {
            if results >= limit {
                truncated = true;
                return ControlFlow::Break(());
            }
            if events.blocking_send(Ok(RecordEvent::Result(value))).is_err() {
                consumer_gone = true;
                return ControlFlow::Break(());
            }
            results += 1;
            if std::time::Instant::now() >= deadline {
                timed_out = true;
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });

        if consumer_gone || cancel.load(Ordering::Relaxed) {
            return;
        }
        if timed_out || matches!(outcome, Ok(RunEnd::Cancelled)) {
            let _ = events.blocking_send(Err(QueryError::Timeout { timeout }));
            return;
        }
        if let Err(message) = outcome {
            let diag = Diagnostic::evaluation(&handle, line, message);
            if events.blocking_send(Ok(RecordEvent::Diagnostic(diag))).is_err() {
                return;
            }
        }
        if truncated {
            break;
        }
    }

    let summary = StreamSummary {
        lines_processed: lines,
        truncated,
        rewrite: rule,
    };
    let _ = events.blocking_send(Ok(RecordEvent::Finished(summary)));
}

// ============================================================================
// Worker pool
// ============================================================================

/// Evaluation thread usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Worker ceiling
    pub capacity: usize,
    /// Threads currently evaluating, abandoned ones included
    pub busy: usize,
}

/// Bounded set of blocking evaluation threads
#[derive(Debug)]
struct WorkerPool {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot until `deadline`
    async fn acquire(&self, deadline: Instant) -> Result<OwnedSemaphorePermit, QueryError> {
        match tokio::time::timeout_at(deadline, Arc::clone(&self.slots).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(QueryError::Worker("evaluation pool closed".into())),
            Err(_) => {
                tracing::warn!(workers = self.capacity, "Every query worker is busy");
                Err(QueryError::Busy {
                    workers: self.capacity,
                })
            }
        }
    }

    fn stats(&self) -> WorkerStats {
        WorkerStats {
            capacity: self.capacity,
            busy: self.capacity.saturating_sub(self.slots.available_permits()),
        }
    }
}

/// Run `job` on a blocking thread that keeps `permit` until it returns
fn spawn_worker<T, F>(permit: OwnedSemaphorePermit, job: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let _permit = permit;
        job()
    })
}

// ============================================================================
// Evaluator
// ============================================================================

/// Query Evaluator service
///
/// Holds no mutable state besides the shared result cache, so one instance
/// serves any number of concurrent requests.
#[derive(Debug, Clone)]
pub struct QueryEvaluator {
    config: EvaluatorConfig,
    cache: Arc<QueryCache>,
    workers: Arc<WorkerPool>,
}

impl QueryEvaluator {
    /// Create an evaluator using `cache` for results
    #[must_use]
    pub fn new(config: EvaluatorConfig, cache: Arc<QueryCache>) -> Self {
        let workers = Arc::new(WorkerPool::new(config.max_workers));
        Self {
            config,
            cache,
            workers,
        }
    }

    /// Active limits
    #[must_use]
    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// The result cache
    #[must_use]
    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Evaluation thread usage
    #[must_use]
    pub fn worker_stats(&self) -> WorkerStats {
        self.workers.stats()
    }

    fn effective_timeout(&self, options: &QueryOptions) -> Duration {
        options
            .timeout
            .unwrap_or(self.config.default_timeout)
            .min(self.config.max_timeout)
    }

    fn effective_limit(&self, options: &QueryOptions) -> usize {
        options
            .limit
            .map_or(self.config.max_results, |limit| limit.min(self.config.max_results))
    }

    /// Cheap checks every evaluation entry point runs: length and denylist
    fn guard(&self, expression: &str) -> Result<(), QueryError> {
        if expression.len() > self.config.max_expression_length {
            return Err(QueryError::InvalidQuery {
                reason: format!(
                    "expression is {} bytes, limit is {}",
                    expression.len(),
                    self.config.max_expression_length
                ),
            });
        }
        validate::check_denylist(expression).map_err(|reason| QueryError::InvalidQuery { reason })
    }

    /// Validate an expression
    ///
    /// Runs the denylist first, then compiles and tries the expression
    /// against an object and an array dummy. A dummy run that outlasts the
    /// validation budget is rejected.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::InvalidQuery` with the reason, or
    /// `QueryError::Busy` when no worker frees up in time.
    pub async fn validate(&self, expression: &str) -> Result<(), QueryError> {
        self.guard(expression)?;

        let budget = self.config.validation_budget;
        let permit = self.workers.acquire(Instant::now() + budget * 2).await?;
        let owned = expression.to_string();
        let check = spawn_worker(permit, move || validate::check_syntax(&owned, budget));
        let rejected = |reason: String| {
            tracing::debug!(reason = %reason, "Query rejected");
            Err(QueryError::InvalidQuery { reason })
        };
        match tokio::time::timeout(budget * 2, check).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => rejected(reason),
            Ok(Err(join)) => Err(QueryError::Worker(join.to_string())),
            Err(_) => rejected(format!(
                "expression did not finish within the {}ms validation limit",
                budget.as_millis()
            )),
        }
    }

    async fn run_blocking(
        &self,
        expression: &str,
        input: Value,
        collect_limit: usize,
        wait: Duration,
        timeout: Duration,
    ) -> Result<Vec<Value>, QueryError> {
        let deadline = Instant::now() + wait;
        let permit = self.workers.acquire(deadline).await?;
        let cancel = Arc::new(AtomicBool::new(false));
        let _guard = CancelOnDrop(Arc::clone(&cancel));
        let interrupt = Interrupt::new(cancel).with_deadline(deadline.into_std());
        let owned = expression.to_string();
        let task = spawn_worker(permit, move || {
            let query = CompiledQuery::compile(&owned)
                .map_err(|reason| QueryError::InvalidQuery { reason })?;
            match query.collect(input, &interrupt, Some(collect_limit)) {
                Ok((_, RunEnd::Cancelled)) => Err(QueryError::Timeout { timeout }),
                Ok((values, _)) => Ok(values),
                Err(message) => Err(QueryError::Evaluation { message }),
            }
        });

        let result = match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(QueryError::Worker(join.to_string())),
            Err(_) => Err(QueryError::Timeout { timeout }),
        };
        if matches!(result, Err(QueryError::Timeout { .. })) {
            tracing::warn!(
                expression = %expression,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                busy_workers = self.workers.stats().busy,
                "Query timed out"
            );
        }
        result
    }

    /// Evaluate against one document
    ///
    /// On timeout nothing is returned; partial output is discarded.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::InvalidQuery`, `QueryError::Timeout` or
    /// `QueryError::Evaluation`.
    pub async fn evaluate(
        &self,
        expression: &str,
        document: Value,
        options: &QueryOptions,
    ) -> Result<QueryOutput, QueryError> {
        self.guard(expression)?;
        let limit = self.effective_limit(options);
        let key = CacheKey::new(expression, Some(limit), CacheScope::document(&document));
        if let Some(hit) = self.cache.get(&key) {
            if let CachedResult::Document(output) = hit.as_ref() {
                return Ok(output.clone());
            }
        }

        let timeout = self.effective_timeout(options);
        let values = self
            .run_blocking(expression, document, limit, timeout, timeout)
            .await?;
        let output = QueryOutput::from_values(values);
        self.cache.insert(key, CachedResult::Document(output.clone()));
        Ok(output)
    }

    fn spawn_records(
        &self,
        reader: LogReader,
        expression: &str,
        limit: usize,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<RecordStream, QueryError> {
        self.guard(expression)?;
        let rewrite = per_record_variant(expression);
        tracing::debug!(
            log = %reader.handle(),
            rule = ?rewrite.rule,
            expression = %rewrite.expression,
            "Streaming per-record evaluation"
        );

        let capacity = self.config.channel_capacity.max(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let (feed_tx, feed_rx) = mpsc::channel(capacity);
        let (events_tx, events_rx) = mpsc::channel(capacity);

        let job = RecordJob {
            expression: rewrite.expression,
            rule: rewrite.rule,
            handle: reader.handle().clone(),
            feed: feed_rx,
            events: events_tx,
            cancel: Arc::clone(&cancel),
            limit,
            deadline: deadline.into_std(),
            timeout,
        };
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            let acquired = tokio::select! {
                acquired = workers.acquire(deadline) => acquired,
                () = job.events.closed() => return,
            };
            let permit = match acquired {
                Ok(permit) => permit,
                Err(error) => {
                    let _ = job.events.send(Err(error)).await;
                    return;
                }
            };
            tokio::spawn(feed_records(reader, feed_tx, Arc::clone(&job.cancel)));
            spawn_worker(permit, move || run_record_job(job));
        });

        Ok(RecordStream {
            events: events_rx,
            _cancel: CancelOnDrop(cancel),
        })
    }

    /// Evaluate the per-record variant of `expression` over one log as a
    /// stream of events
    ///
    /// # Errors
    ///
    /// Returns `QueryError::InvalidQuery` if the expression fails the
    /// denylist. Later failures arrive as `Err` items on the stream.
    pub fn stream_records(
        &self,
        reader: LogReader,
        expression: &str,
        options: &QueryOptions,
    ) -> Result<RecordStream, QueryError> {
        let timeout = self.effective_timeout(options);
        let limit = self.effective_limit(options);
        self.spawn_records(reader, expression, limit, Instant::now() + timeout, timeout)
    }

    /// Evaluate the per-record variant of `expression` over one log
    ///
    /// Malformed lines and per-record evaluation errors become diagnostics.
    /// The timeout covers the whole log.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::InvalidQuery`, `QueryError::Timeout`, or
    /// `QueryError::Store` if the file cannot be read mid-stream.
    pub async fn evaluate_stream(
        &self,
        reader: LogReader,
        expression: &str,
        options: &QueryOptions,
    ) -> Result<StreamEvaluation, QueryError> {
        let timeout = self.effective_timeout(options);
        let limit = self.effective_limit(options);
        self.collect_stream(reader, expression, limit, Instant::now() + timeout, timeout)
            .await
    }

    async fn collect_stream(
        &self,
        reader: LogReader,
        expression: &str,
        limit: usize,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<StreamEvaluation, QueryError> {
        let mut stream = self.spawn_records(reader, expression, limit, deadline, timeout)?;
        let collect = async move {
            let mut results = Vec::new();
            let mut diagnostics = Vec::new();
            while let Some(event) = stream.next().await {
                match event? {
                    RecordEvent::Result(value) => results.push(value),
                    RecordEvent::Diagnostic(diag) => diagnostics.push(diag),
                    RecordEvent::Finished(summary) => {
                        return Ok(StreamEvaluation {
                            results,
                            diagnostics,
                            lines_processed: summary.lines_processed,
                            truncated: summary.truncated,
                            rewrite: summary.rewrite,
                        });
                    }
                }
            }
            Err(QueryError::Worker("record stream ended early".into()))
        };

        match tokio::time::timeout_at(deadline, collect).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout { timeout }),
        }
    }

    /// Evaluate over many logs
    ///
    /// Aggregating expressions see every record of every log as one array;
    /// per-record expressions stream each log and union the results. A log
    /// that cannot be read becomes a diagnostic unless every log fails, in
    /// which case the first error is returned. A path violation fails the
    /// whole request.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::InvalidQuery`, `QueryError::Timeout`,
    /// `QueryError::Evaluation` (aggregating only) or `QueryError::Store`.
    pub async fn evaluate_across_logs(
        &self,
        store: &LogStore,
        handles: &[LogHandle],
        expression: &str,
        options: &QueryOptions,
    ) -> Result<AggregateResult, QueryError> {
        self.guard(expression)?;
        let strategy = classify(expression);
        let limit = self.effective_limit(options);
        let timeout = self.effective_timeout(options);
        let deadline = Instant::now() + timeout;

        let mut batch = Batch::default();
        let mut readable: Vec<(LogHandle, LogFingerprint)> = Vec::with_capacity(handles.len());
        for handle in handles {
            match store.fingerprint(handle).await {
                Ok(fingerprint) => readable.push((handle.clone(), fingerprint)),
                Err(error) => batch.log_failed(handle, error)?,
            }
        }
        if readable.is_empty() {
            return match batch.first_error {
                Some(error) => Err(error),
                None => Ok(AggregateResult::empty(strategy)),
            };
        }

        let key = CacheKey::new(expression, Some(limit), CacheScope::Logs(readable.clone()));
        if let Some(hit) = self.cache.get(&key) {
            if let CachedResult::Logs(result) = hit.as_ref() {
                let mut result = result.clone();
                result.cached = true;
                return Ok(result);
            }
        }

        tracing::debug!(
            logs = readable.len(),
            strategy = ?strategy,
            "Evaluating across logs"
        );
        let work = async {
            match strategy {
                QueryKind::Aggregating => {
                    self.aggregate(store, &readable, expression, limit, deadline, timeout, batch)
                        .await
                }
                QueryKind::PerRecord => {
                    self.union(store, &readable, expression, limit, deadline, timeout, batch)
                        .await
                }
            }
        };
        let result = match tokio::time::timeout_at(deadline, work).await {
            Ok(result) => result?,
            Err(_) => return Err(QueryError::Timeout { timeout }),
        };

        self.cache.insert(key, CachedResult::Logs(result.clone()));
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn aggregate(
        &self,
        store: &LogStore,
        logs: &[(LogHandle, LogFingerprint)],
        expression: &str,
        limit: usize,
        deadline: Instant,
        timeout: Duration,
        mut batch: Batch,
    ) -> Result<AggregateResult, QueryError> {
        let mut records = Vec::new();
        for (handle, _) in logs {
            match store.read_all(handle, &ReadOptions::default()).await {
                Ok(outcome) => {
                    batch.logs_processed += 1;
                    batch.lines_processed += outcome.lines_processed;
                    batch.diagnostics.extend(
                        outcome
                            .diagnostics
                            .iter()
                            .map(|d| Diagnostic::line_parse(handle, d)),
                    );
                    records.extend(outcome.entries.into_iter().map(LogEntry::into_value));
                }
                Err(error) => batch.log_failed(handle, error)?,
            }
        }
        if batch.logs_processed == 0 {
            return Err(batch.into_error());
        }

        let wait = deadline.saturating_duration_since(Instant::now());
        let mut results = self
            .run_blocking(expression, Value::Array(records), limit.saturating_add(1), wait, timeout)
            .await?;
        let truncated = results.len() > limit;
        results.truncate(limit);
        Ok(batch.finish(results, QueryKind::Aggregating, truncated))
    }

    #[allow(clippy::too_many_arguments)]
    async fn union(
        &self,
        store: &LogStore,
        logs: &[(LogHandle, LogFingerprint)],
        expression: &str,
        limit: usize,
        deadline: Instant,
        timeout: Duration,
        mut batch: Batch,
    ) -> Result<AggregateResult, QueryError> {
        let mut results = Vec::new();
        let mut truncated = false;
        for (handle, _) in logs {
            let reader = match store.open_for_read(handle).await {
                Ok(reader) => reader,
                Err(error) => {
                    batch.log_failed(handle, error)?;
                    continue;
                }
            };
            let remaining = limit.saturating_sub(results.len());
            match self
                .collect_stream(reader, expression, remaining, deadline, timeout)
                .await
            {
                Ok(evaluation) => {
                    batch.logs_processed += 1;
                    batch.lines_processed += evaluation.lines_processed;
                    batch.diagnostics.extend(evaluation.diagnostics);
                    results.extend(evaluation.results);
                    if evaluation.truncated {
                        truncated = true;
                        break;
                    }
                }
                Err(QueryError::Store(error)) => batch.log_failed(handle, error)?,
                Err(error) => return Err(error),
            }
        }
        if batch.logs_processed == 0 {
            return Err(batch.into_error());
        }
        Ok(batch.finish(results, QueryKind::PerRecord, truncated))
    }
}

/// Bookkeeping shared by the multi-log strategies
#[derive(Debug, Default)]
struct Batch {
    diagnostics: Vec<Diagnostic>,
    logs_processed: usize,
    lines_processed: usize,
    first_error: Option<QueryError>,
}

impl Batch {
    /// Record a failed log; path violations abort the request
    fn log_failed(&mut self, handle: &LogHandle, error: StoreError) -> Result<(), QueryError> {
        if matches!(error, StoreError::PathViolation { .. }) {
            return Err(error.into());
        }
        tracing::warn!(log = %handle, error = %error, "Skipping log");
        self.diagnostics.push(Diagnostic::log_unavailable(handle, &error));
        if self.first_error.is_none() {
            self.first_error = Some(error.into());
        }
        Ok(())
    }

    fn into_error(self) -> QueryError {
        self.first_error
            .unwrap_or_else(|| QueryError::Worker("no log could be evaluated".into()))
    }

    fn finish(self, results: Vec<Value>, strategy: QueryKind, truncated: bool) -> AggregateResult {
        AggregateResult {
            results,
            diagnostics: self.diagnostics,
            logs_processed: self.logs_processed,
            lines_processed: self.lines_processed,
            strategy,
            ordering: ordering_for(strategy),
            truncated,
            cached: false,
        }
    }
}
