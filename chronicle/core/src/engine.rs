//! Engine facade
//!
//! Wires the four components together and routes requests:
//!
//! ```text
//! query: LogStore ─▶ QueryEvaluator ─▶ StreamTransport
//! chat:  ProcessOrchestrator ─────────▶ StreamTransport (or one buffered result)
//! ```
//!
//! Components are constructed once and shared by reference; nothing here is
//! global.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind, Result};
use crate::process::{ProcessEvent, ProcessId, ProcessOrchestrator, ProcessOutput, ProcessStats};
use crate::protocol::{ChatRequest, QueryRequest, QueryTarget, Request, Response};
use crate::query::{
    classify, AggregateResult, CacheStats, Diagnostic, QueryCache, QueryError, QueryEvaluator,
    QueryKind, QueryOptions, RecordEvent,
};
use crate::store::{
    CollectionInfo, LogHandle, LogInfo, LogStore, LogSummary, ReadOptions, ReadOutcome, StoreError,
};
use crate::transport::{EnvelopeStream, StreamFault, StreamItem, StreamTransport};

/// How the daemon answers one request
#[derive(Debug)]
pub enum Reply {
    /// One response line
    Response(Response),
    /// A stream of envelope lines
    Stream(EnvelopeStream),
}

/// The engine
#[derive(Debug, Clone)]
pub struct Engine {
    store: Arc<LogStore>,
    evaluator: QueryEvaluator,
    orchestrator: ProcessOrchestrator,
    transport: StreamTransport,
}

impl Engine {
    /// Build every component from `config`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` for an invalid configuration and
    /// `EngineError::Store` if the log root cannot be opened.
    pub async fn open(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = LogStore::open(&config.root).await?;
        let cache = Arc::new(QueryCache::new(config.cache_capacity));
        let engine = Self::new(
            Arc::new(store),
            QueryEvaluator::new(config.query.clone(), cache),
            ProcessOrchestrator::new(config.process.clone()),
            StreamTransport::new(config.stream.clone()),
        );
        tracing::info!(
            root = %engine.store.root().display(),
            max_processes = config.process.max_concurrent,
            cache_capacity = config.cache_capacity,
            source = %config.source(),
            "Engine ready"
        );
        Ok(engine)
    }

    /// Assemble from already constructed components
    #[must_use]
    pub fn new(
        store: Arc<LogStore>,
        evaluator: QueryEvaluator,
        orchestrator: ProcessOrchestrator,
        transport: StreamTransport,
    ) -> Self {
        Self {
            store,
            evaluator,
            orchestrator,
            transport,
        }
    }

    /// The Log Store
    #[must_use]
    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    /// The Query Evaluator
    #[must_use]
    pub fn evaluator(&self) -> &QueryEvaluator {
        &self.evaluator
    }

    /// The Process Orchestrator
    #[must_use]
    pub fn orchestrator(&self) -> &ProcessOrchestrator {
        &self.orchestrator
    }

    // ========================================================================
    // Queries
    // ========================================================================

    async fn resolve_targets(&self, request: &QueryRequest) -> Result<Vec<LogHandle>> {
        let targets = request.parse_targets()?;
        if targets.is_empty() {
            return Ok(self.store.all_handles().await?);
        }

        let mut handles = Vec::new();
        for target in targets {
            match target {
                QueryTarget::Collection(name) => {
                    let logs = self.store.list_logs(&name).await?;
                    handles.extend(logs.into_iter().map(|log| log.handle));
                }
                QueryTarget::Log(handle) => handles.push(handle),
            }
        }
        let mut seen = HashSet::new();
        handles.retain(|handle| seen.insert(handle.clone()));
        Ok(handles)
    }

    /// Run a query to completion
    ///
    /// The expression is validated before any log is opened.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuery`, `QueryTimeout`, a path violation, or the first
    /// log error when no target could be read.
    pub async fn query(&self, request: &QueryRequest) -> Result<AggregateResult> {
        self.evaluator.validate(&request.expression).await?;
        let handles = self.resolve_targets(request).await?;
        let result = self
            .evaluator
            .evaluate_across_logs(&self.store, &handles, &request.expression, &request.options())
            .await?;
        tracing::info!(
            logs = result.logs_processed,
            lines = result.lines_processed,
            results = result.results.len(),
            diagnostics = result.diagnostics.len(),
            strategy = ?result.strategy,
            cached = result.cached,
            "Query finished"
        );
        Ok(result)
    }

    /// Run a query as a stream of envelopes
    ///
    /// Validation and target resolution happen before the stream starts, so
    /// those failures are returned directly. Diagnostics are reported in the
    /// `end` envelope. Dropping the stream halts log reads.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuery` or a target resolution error.
    pub async fn stream_query(&self, request: &QueryRequest) -> Result<EnvelopeStream> {
        self.evaluator.validate(&request.expression).await?;
        let handles = self.resolve_targets(request).await?;
        let strategy = classify(&request.expression);
        let start = json!({
            "expression": request.expression,
            "logs": handles.len(),
            "strategy": strategy,
        });

        let (items, rx) = mpsc::channel(self.transport.config().channel_capacity.max(1));
        let job = QueryStreamJob {
            store: Arc::clone(&self.store),
            evaluator: self.evaluator.clone(),
            handles,
            expression: request.expression.clone(),
            options: request.options(),
            strategy,
            items,
        };
        tokio::spawn(job.run());
        Ok(self.transport.spawn(start, ReceiverStream::new(rx)))
    }

    // ========================================================================
    // Chat
    // ========================================================================

    /// Send a message and wait for the tool to finish
    ///
    /// # Errors
    ///
    /// Returns the orchestrator's error.
    pub async fn chat(&self, request: &ChatRequest) -> Result<ProcessOutput> {
        let output = self
            .orchestrator
            .run_buffered(request.to_process_request())
            .await?;
        Ok(output)
    }

    /// Send a message and stream the tool's output
    ///
    /// The `start` envelope carries the resume token and the process id.
    /// Dropping the stream terminates the process.
    ///
    /// # Errors
    ///
    /// Returns failures that happen before the process is running:
    /// `InvalidRequest`, `PathViolation`, `Overloaded`, `ProcessSpawnFailure`.
    pub async fn stream_chat(&self, request: &ChatRequest) -> Result<EnvelopeStream> {
        let process = self
            .orchestrator
            .spawn_streaming(request.to_process_request())
            .await?;
        let resume_token = process.resume_token().to_string();
        let start = json!({
            "resume_token": resume_token,
            "process_id": process.id(),
        });
        let timeout = self.orchestrator.config().timeout;

        let producer = process.map(move |event| match event {
            ProcessEvent::Chunk(chunk) => StreamItem::Data(json!(chunk)),
            ProcessEvent::Exited(outcome) => match outcome.into_result(timeout) {
                Ok(outcome) => StreamItem::Finish(json!({
                    "resume_token": resume_token,
                    "exit_code": outcome.exit_code,
                    "stderr": outcome.stderr,
                    "duration_ms": outcome.duration_ms,
                })),
                Err(error) => StreamItem::Fail(StreamFault::from(&EngineError::from(error))),
            },
        });
        Ok(self.transport.spawn(start, producer))
    }

    /// Cancel a running tool process
    #[must_use]
    pub fn cancel(&self, id: ProcessId) -> bool {
        self.orchestrator.cancel(id)
    }

    /// Process table snapshot
    #[must_use]
    pub fn process_stats(&self) -> ProcessStats {
        self.orchestrator.stats()
    }

    // ========================================================================
    // Cache control
    // ========================================================================

    /// Query cache statistics
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.evaluator.cache().stats()
    }

    /// Empty the query cache, returning how many entries were dropped
    pub fn clear_cache(&self) -> usize {
        let cleared = self.evaluator.cache().clear();
        tracing::info!(cleared, "Query cache cleared");
        cleared
    }

    // ========================================================================
    // Store pass-through
    // ========================================================================

    /// List collections
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the root cannot be listed.
    pub async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        Ok(self.store.list_collections().await?)
    }

    /// List the logs of a collection
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn list_logs(&self, collection: &str) -> Result<Vec<LogInfo>> {
        Ok(self.store.list_logs(collection).await?)
    }

    /// Read the entries of one log
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn read_log(&self, handle: &LogHandle, options: &ReadOptions) -> Result<ReadOutcome> {
        Ok(self.store.read_all(handle, options).await?)
    }

    /// Summarize one log
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn summarize(&self, handle: &LogHandle) -> Result<LogSummary> {
        Ok(self.store.summarize(handle).await?)
    }

    /// Create a log
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn create_log(
        &self,
        collection: &str,
        id: &str,
        entries: &[Value],
    ) -> Result<LogHandle> {
        Ok(self.store.create(collection, id, entries).await?)
    }

    /// Append to a log and drop cached results that read it
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn append(&self, handle: &LogHandle, entries: &[Value]) -> Result<usize> {
        let written = self.store.append(handle, entries).await?;
        self.evaluator.cache().invalidate_handle(handle);
        Ok(written)
    }

    /// Delete a log and drop cached results that read it
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn delete(&self, handle: &LogHandle) -> Result<()> {
        self.store.delete(handle).await?;
        self.evaluator.cache().invalidate_handle(handle);
        Ok(())
    }

    /// Cancel every running tool process
    pub fn shutdown(&self) -> usize {
        self.orchestrator.shutdown()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Answer one protocol request
    pub async fn dispatch(&self, request: Request) -> Reply {
        match request {
            Request::Query(query) if query.stream => stream_reply(self.stream_query(&query).await),
            Request::Query(query) => data_reply(self.query(&query).await),
            Request::Chat(chat) if chat.stream => stream_reply(self.stream_chat(&chat).await),
            Request::Chat(chat) => data_reply(self.chat(&chat).await),
            Request::Cancel { process_id } => {
                data_reply(Ok(json!({ "cancelled": self.cancel(process_id) })))
            }
            Request::ProcessStats => data_reply(Ok(self.process_stats())),
            Request::CacheStats => data_reply(Ok(self.cache_stats())),
            Request::CacheClear => data_reply(Ok(json!({ "cleared": self.clear_cache() }))),
            Request::ListCollections => data_reply(self.list_collections().await),
            Request::ListLogs { collection } => data_reply(self.list_logs(&collection).await),
            Request::ReadLog { log, options } => {
                let read = async {
                    let handle: LogHandle = log.parse()?;
                    self.read_log(&handle, &options).await
                };
                data_reply(read.await)
            }
        }
    }
}

fn data_reply<T: Serialize>(result: Result<T>) -> Reply {
    let response = match result {
        Ok(data) => Response::from_data(&data).unwrap_or_else(|error| {
            tracing::error!(error = %error, "Failed to encode response");
            Response::failure(ErrorKind::Internal, error.to_string())
        }),
        Err(error) => {
            tracing::debug!(kind = %error.kind(), error = %error, "Request failed");
            Response::from(&error)
        }
    };
    Reply::Response(response)
}

fn stream_reply(result: Result<EnvelopeStream>) -> Reply {
    match result {
        Ok(stream) => Reply::Stream(stream),
        Err(error) => {
            tracing::debug!(kind = %error.kind(), error = %error, "Stream request failed");
            Reply::Response(Response::from(&error))
        }
    }
}

// ============================================================================
// Query streams
// ============================================================================

/// Producer behind [`Engine::stream_query`]
struct QueryStreamJob {
    store: Arc<LogStore>,
    evaluator: QueryEvaluator,
    handles: Vec<LogHandle>,
    expression: String,
    options: QueryOptions,
    strategy: QueryKind,
    items: mpsc::Sender<StreamItem>,
}

/// Running totals of a per-record query stream
#[derive(Default)]
struct Tally {
    logs_processed: usize,
    lines_processed: usize,
    results: usize,
    diagnostics: Vec<Diagnostic>,
    truncated: bool,
    first_error: Option<StoreError>,
}

impl QueryStreamJob {
    async fn run(self) {
        let items = self.items.clone();
        tokio::select! {
            () = items.closed() => {
                tracing::debug!(
                    logs = self.handles.len(),
                    "Query stream consumer gone, halting reads"
                );
            }
            last = self.produce() => {
                let _ = items.send(last).await;
            }
        }
    }

    fn fail(error: impl Into<EngineError>) -> StreamItem {
        StreamItem::Fail(StreamFault::from(&error.into()))
    }

    async fn send(&self, value: Value) -> bool {
        self.items.send(StreamItem::Data(value)).await.is_ok()
    }

    /// Emit data items; the returned item terminates the stream
    async fn produce(&self) -> StreamItem {
        match self.strategy {
            QueryKind::Aggregating => self.aggregate().await,
            QueryKind::PerRecord => self.per_record().await,
        }
    }

    async fn aggregate(&self) -> StreamItem {
        let mut result = match self
            .evaluator
            .evaluate_across_logs(&self.store, &self.handles, &self.expression, &self.options)
            .await
        {
            Ok(result) => result,
            Err(error) => return Self::fail(error),
        };
        for value in std::mem::take(&mut result.results) {
            if !self.send(json!({ "result": value })).await {
                return StreamItem::Finish(Value::Null);
            }
        }
        StreamItem::Finish(json!({
            "logs_processed": result.logs_processed,
            "lines_processed": result.lines_processed,
            "diagnostics": result.diagnostics,
            "strategy": result.strategy,
            "ordering": result.ordering,
            "truncated": result.truncated,
            "cached": result.cached,
        }))
    }

    async fn per_record(&self) -> StreamItem {
        let config = self.evaluator.config();
        let timeout = self
            .options
            .timeout
            .unwrap_or(config.default_timeout)
            .min(config.max_timeout);
        let limit = self
            .options
            .limit
            .map_or(config.max_results, |limit| limit.min(config.max_results));
        let deadline = Instant::now() + timeout;
        let mut tally = Tally::default();

        for handle in &self.handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Self::fail(QueryError::Timeout { timeout });
            }
            let reader = match self.store.open_for_read(handle).await {
                Ok(reader) => reader,
                Err(error) => match skip_log(&mut tally, handle, error) {
                    Ok(()) => continue,
                    Err(fatal) => return Self::fail(fatal),
                },
            };
            let options = QueryOptions {
                timeout: Some(remaining),
                limit: Some(limit.saturating_sub(tally.results)),
            };
            let records = self
                .evaluator
                .stream_records(reader, &self.expression, &options);
            let mut records = match records {
                Ok(records) => records,
                Err(error) => return Self::fail(error),
            };

            loop {
                match records.next().await {
                    Some(Ok(RecordEvent::Result(value))) => {
                        tally.results += 1;
                        if !self.send(json!({ "log": handle, "result": value })).await {
                            return StreamItem::Finish(Value::Null);
                        }
                    }
                    Some(Ok(RecordEvent::Diagnostic(diagnostic))) => {
                        tally.diagnostics.push(diagnostic);
                    }
                    Some(Ok(RecordEvent::Finished(summary))) => {
                        tally.logs_processed += 1;
                        tally.lines_processed += summary.lines_processed;
                        tally.truncated |= summary.truncated;
                        break;
                    }
                    Some(Err(QueryError::Store(error))) => {
                        match skip_log(&mut tally, handle, error) {
                            Ok(()) => break,
                            Err(fatal) => return Self::fail(fatal),
                        }
                    }
                    Some(Err(QueryError::Timeout { .. })) => {
                        return Self::fail(QueryError::Timeout { timeout });
                    }
                    Some(Err(error)) => return Self::fail(error),
                    None => {
                        let ended = QueryError::Worker("record stream ended early".into());
                        return Self::fail(ended);
                    }
                }
            }
            if tally.truncated {
                break;
            }
        }

        if tally.logs_processed == 0 {
            if let Some(error) = tally.first_error {
                return Self::fail(error);
            }
        }
        StreamItem::Finish(json!({
            "logs_processed": tally.logs_processed,
            "lines_processed": tally.lines_processed,
            "diagnostics": tally.diagnostics,
            "strategy": QueryKind::PerRecord,
            "truncated": tally.truncated,
        }))
    }
}

/// Record an unreadable log; path violations abort the stream
fn skip_log(
    tally: &mut Tally,
    handle: &LogHandle,
    error: StoreError,
) -> std::result::Result<(), StoreError> {
    if matches!(error, StoreError::PathViolation { .. }) {
        return Err(error);
    }
    tracing::warn!(log = %handle, error = %error, "Skipping log");
    tally.diagnostics.push(Diagnostic::log_unavailable(handle, &error));
    tally.first_error.get_or_insert(error);
    Ok(())
}
