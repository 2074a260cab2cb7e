//! Chronicle Core - query and streaming engine for append-only conversation logs
//!
//! Serves structured JSONL conversation logs to clients and runs an external
//! conversational tool on their behalf.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Engine                              │
//! │                                                               │
//! │  query ──▶ ┌──────────┐   ┌────────────────┐                  │
//! │            │ LogStore │──▶│ QueryEvaluator │──┐               │
//! │            └──────────┘   └────────────────┘  │               │
//! │                                               ▼               │
//! │  chat ───▶ ┌─────────────────────┐   ┌─────────────────┐      │
//! │            │ ProcessOrchestrator │──▶│ StreamTransport │──▶ NDJSON
//! │            └─────────────────────┘   └─────────────────┘      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`store`]: collections and logs under one root, line-tolerant reads
//! - [`query`]: jq validation, evaluation and multi-log aggregation
//! - [`process`]: bounded pool of supervised tool processes
//! - [`transport`]: envelope protocol, rate limiting, NDJSON codec
//! - [`engine`]: the facade wiring the components together
//! - [`protocol`]: typed requests and responses
//! - [`config`]: TOML, environment and CLI configuration
//! - [`error`]: crate-level error and stable error kinds
//!
//! # Quick Start
//!
//! ```ignore
//! use chronicle_core::{load_config, Engine, QueryRequest};
//!
//! #[tokio::main]
//! async fn main() -> chronicle_core::Result<()> {
//!     let engine = Engine::open(&load_config()?).await?;
//!     let request = QueryRequest::new(".[] | select(.type == \"user\")").with_target("demo");
//!     let result = engine.query(&request).await?;
//!     println!("{} results", result.results.len());
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod engine;
pub mod error;
pub mod process;
pub mod protocol;
pub mod query;
pub mod store;
pub mod transport;

pub use engine::{Engine, Reply};
pub use error::{EngineError, ErrorKind, Result};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, EngineConfig, EngineToml,
};

// Protocol exports
pub use protocol::{ChatRequest, ErrorBody, QueryRequest, QueryTarget, Request, Response};

// Store exports
pub use store::{
    CollectionInfo, LineParseError, LogEntry, LogHandle, LogInfo, LogStore, LogSummary, ReadFilter,
    ReadOptions, ReadOutcome, StoreError,
};

// Query exports
pub use query::{
    AggregateResult, CacheStats, Diagnostic, DiagnosticKind, EvaluatorConfig, QueryCache,
    QueryError, QueryEvaluator, QueryKind, QueryOptions, QueryOutput, ResultOrdering, WorkerStats,
};

// Process exports
pub use process::{
    ExecutionMode, OrchestratorConfig, ProcessError, ProcessId, ProcessOrchestrator, ProcessOutput,
    ProcessRequest, ProcessState, ProcessStats,
};

// Transport exports
pub use transport::{
    EnvelopeKind, EnvelopeSink, EnvelopeStream, RateLimitConfig, StreamEnvelope, StreamTransport,
    TransportConfig, TransportError,
};
