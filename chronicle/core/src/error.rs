//! Crate-level errors
//!
//! Every component error converts into [`EngineError`], and every
//! `EngineError` maps to a stable [`ErrorKind`] that clients can match on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::process::ProcessError;
use crate::query::QueryError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Machine-readable error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Expression rejected or failed to compile
    InvalidQuery,
    /// Evaluation exceeded its budget
    QueryTimeout,
    /// A path escaped its allowed root
    PathViolation,
    /// Concurrency ceiling reached
    Overloaded,
    /// The external tool could not be started
    ProcessSpawnFailure,
    /// The external tool exited non-zero or was cancelled
    ProcessExitFailure,
    /// The external tool exceeded its budget
    ProcessTimedOut,
    /// A log line was not valid JSON
    LineParseError,
    /// Collection or log does not exist
    NotFound,
    /// Log already exists
    AlreadyExists,
    /// Malformed request
    InvalidRequest,
    /// Filesystem or socket failure
    Io,
    /// A stream exceeded its overall budget
    StreamTimeout,
    /// Anything else
    Internal,
}

impl ErrorKind {
    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidQuery => "invalid_query",
            Self::QueryTimeout => "query_timeout",
            Self::PathViolation => "path_violation",
            Self::Overloaded => "overloaded",
            Self::ProcessSpawnFailure => "process_spawn_failure",
            Self::ProcessExitFailure => "process_exit_failure",
            Self::ProcessTimedOut => "process_timed_out",
            Self::LineParseError => "line_parse_error",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::InvalidRequest => "invalid_request",
            Self::Io => "io",
            Self::StreamTimeout => "stream_timeout",
            Self::Internal => "internal",
        }
    }

    /// Whether the same request may succeed if retried later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Overloaded)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any engine failure
#[derive(Debug, Error)]
pub enum EngineError {
    /// Log Store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Query Evaluator failure
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Process Orchestrator failure
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Streaming Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Configuration failure
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Malformed request
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl EngineError {
    /// Category of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(error) => store_kind(error),
            Self::Query(error) => match error {
                QueryError::InvalidQuery { .. } => ErrorKind::InvalidQuery,
                QueryError::Timeout { .. } => ErrorKind::QueryTimeout,
                QueryError::Evaluation { .. } => ErrorKind::InvalidQuery,
                QueryError::Store(error) => store_kind(error),
                QueryError::Busy { .. } => ErrorKind::Overloaded,
                QueryError::Worker(_) => ErrorKind::Internal,
            },
            Self::Process(error) => match error {
                ProcessError::Overloaded { .. } => ErrorKind::Overloaded,
                ProcessError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
                ProcessError::PathViolation { .. } => ErrorKind::PathViolation,
                ProcessError::SpawnFailure { .. } => ErrorKind::ProcessSpawnFailure,
                ProcessError::ExitFailure { .. } | ProcessError::Killed => {
                    ErrorKind::ProcessExitFailure
                }
                ProcessError::TimedOut { .. } => ErrorKind::ProcessTimedOut,
                ProcessError::Supervisor(_) => ErrorKind::Internal,
            },
            Self::Transport(error) => match error {
                TransportError::Io(_) | TransportError::SinkClosed => ErrorKind::Io,
                TransportError::Stalled { .. } => ErrorKind::StreamTimeout,
                TransportError::RecordTooLarge { .. } | TransportError::Encode(_) => {
                    ErrorKind::Internal
                }
            },
            Self::Config(_) => ErrorKind::Internal,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }
}

impl EngineError {
    /// Diagnostic output carried by the error, such as a stderr excerpt
    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Process(
                ProcessError::ExitFailure { stderr, .. } | ProcessError::TimedOut { stderr, .. },
            ) if !stderr.is_empty() => Some(stderr),
            _ => None,
        }
    }
}

fn store_kind(error: &StoreError) -> ErrorKind {
    match error {
        StoreError::PathViolation { .. } => ErrorKind::PathViolation,
        StoreError::InvalidName { .. } => ErrorKind::InvalidRequest,
        StoreError::NotFound { .. } => ErrorKind::NotFound,
        StoreError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
        StoreError::Io { .. } => ErrorKind::Io,
        StoreError::Encode { .. } => ErrorKind::InvalidRequest,
    }
}

/// Result alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
