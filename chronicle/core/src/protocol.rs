//! Request and response types
//!
//! The typed boundary between calling code and the [`Engine`](crate::Engine).
//! The daemon speaks these as one JSON object per line:
//!
//! ```json
//! {"op":"query","expression":".[] | select(.type == \"user\")","targets":["demo"]}
//! {"op":"chat","message":"hello","stream":true}
//! {"op":"cancel","process_id":"6f1c..."}
//! ```
//!
//! Buffered replies are `{"ok":true,"data":...}` or
//! `{"ok":false,"error":{"kind":...,"message":...}}`; streaming replies are
//! [`StreamEnvelope`](crate::transport::StreamEnvelope) lines.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, ErrorKind};
use crate::process::{ExecutionMode, ProcessId, ProcessRequest};
use crate::query::QueryOptions;
use crate::store::{validate_name, LogHandle, ReadOptions, StoreError};

// ============================================================================
// Targets
// ============================================================================

/// What a query runs against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryTarget {
    /// Every log of a collection
    Collection(String),
    /// One log
    Log(LogHandle),
}

impl FromStr for QueryTarget {
    type Err = StoreError;

    /// Parse `collection` or `collection/log`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            None => {
                validate_name("collection", s)?;
                Ok(Self::Collection(s.to_string()))
            }
            Some(_) => {
                let handle: LogHandle = s.parse()?;
                validate_name("collection", &handle.collection)?;
                validate_name("log", &handle.log)?;
                Ok(Self::Log(handle))
            }
        }
    }
}

impl fmt::Display for QueryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collection(name) => f.write_str(name),
            Self::Log(handle) => handle.fmt(f),
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A query over logs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// jq expression
    pub expression: String,
    /// `collection` or `collection/log` entries; empty means every log
    #[serde(default)]
    pub targets: Vec<String>,
    /// Maximum number of results
    #[serde(default)]
    pub limit: Option<usize>,
    /// Timeout override in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Reply with envelopes instead of one response
    #[serde(default)]
    pub stream: bool,
}

impl QueryRequest {
    /// A query over every log
    #[must_use]
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            ..Self::default()
        }
    }

    /// Add a target
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    /// Set the result limit
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Evaluation options
    #[must_use]
    pub fn options(&self) -> QueryOptions {
        QueryOptions {
            timeout: self.timeout_ms.map(Duration::from_millis),
            limit: self.limit,
        }
    }

    /// Parsed targets, deduplicated in request order
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidName` for a malformed target.
    pub fn parse_targets(&self) -> Result<Vec<QueryTarget>, StoreError> {
        let mut targets: Vec<QueryTarget> = Vec::with_capacity(self.targets.len());
        for raw in &self.targets {
            let target = raw.parse()?;
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        Ok(targets)
    }
}

/// A message for the conversational tool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Message text
    pub message: String,
    /// Conversation to continue
    #[serde(default)]
    pub resume_token: Option<String>,
    /// Working directory hint
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Reply with envelopes instead of one response
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// A buffered chat request
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

    /// Stream the reply
    #[must_use]
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// The orchestrator request
    #[must_use]
    pub fn to_process_request(&self) -> ProcessRequest {
        ProcessRequest {
            message: self.message.clone(),
            resume_token: self.resume_token.clone(),
            working_dir: self.working_dir.clone(),
            mode: if self.stream {
                ExecutionMode::Streaming
            } else {
                ExecutionMode::Buffered
            },
        }
    }
}

/// One line read by the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Run a query
    Query(QueryRequest),
    /// Send a chat message
    Chat(ChatRequest),
    /// Cancel a running tool process
    Cancel {
        /// Process to cancel
        process_id: ProcessId,
    },
    /// Process table snapshot
    ProcessStats,
    /// Query cache statistics
    CacheStats,
    /// Empty the query cache
    CacheClear,
    /// List collections
    ListCollections,
    /// List the logs of a collection
    ListLogs {
        /// Collection name
        collection: String,
    },
    /// Read entries of one log
    ReadLog {
        /// `collection/log`
        log: String,
        /// Limit, offset and filter
        #[serde(default)]
        options: ReadOptions,
    },
}

impl Request {
    /// Whether the reply is a stream of envelopes
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        match self {
            Self::Query(request) => request.stream,
            Self::Chat(request) => request.stream,
            _ => false,
        }
    }

    /// Operation name, for logs
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::Query(_) => "query",
            Self::Chat(_) => "chat",
            Self::Cancel { .. } => "cancel",
            Self::ProcessStats => "process_stats",
            Self::CacheStats => "cache_stats",
            Self::CacheClear => "cache_clear",
            Self::ListCollections => "list_collections",
            Self::ListLogs { .. } => "list_logs",
            Self::ReadLog { .. } => "read_log",
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Error part of a failed [`Response`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error category
    pub kind: ErrorKind,
    /// Message
    pub message: String,
    /// Whether retrying later may succeed
    pub retryable: bool,
    /// Diagnostic output, such as a stderr excerpt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Buffered reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Whether the request succeeded
    pub ok: bool,
    /// Result, when `ok`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure, when not `ok`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    /// Successful reply carrying `data`
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// Successful reply carrying any serializable value
    ///
    /// # Errors
    ///
    /// Returns the serialization error.
    pub fn from_data<T: Serialize>(data: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(data).map(Self::ok)
    }

    /// Failed reply
    #[must_use]
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind,
                message: message.into(),
                retryable: kind.is_retryable(),
                detail: None,
            }),
        }
    }
}

impl From<&EngineError> for Response {
    fn from(error: &EngineError) -> Self {
        let mut response = Self::failure(error.kind(), error.to_string());
        if let Some(body) = response.error.as_mut() {
            body.detail = error.detail().map(str::to_string);
        }
        response
    }
}
