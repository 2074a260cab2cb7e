//! Invocation of the external tool
//!
//! Builds the argument vector for a request and checks everything that comes
//! from the client (resume token, working directory) before it reaches a
//! `Command`.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::{ExecutionMode, OrchestratorConfig, ProcessError};

/// Longest accepted resume token
pub const MAX_RESUME_TOKEN_LEN: usize = 128;

/// How the conversation is addressed on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Conversation {
    /// Continue an existing conversation
    Resume(String),
    /// Start a new conversation under a freshly minted token
    New(String),
}

impl Conversation {
    /// Resolve an optional client token
    pub(crate) fn from_request(token: Option<&str>) -> Result<Self, ProcessError> {
        match token {
            Some(token) => {
                validate_resume_token(token)?;
                Ok(Self::Resume(token.to_string()))
            }
            None => Ok(Self::New(Uuid::new_v4().to_string())),
        }
    }

    /// The token either way
    pub(crate) fn token(&self) -> &str {
        match self {
            Self::Resume(token) | Self::New(token) => token,
        }
    }
}

/// Check a resume token: 1 to 128 of `[A-Za-z0-9_-]`
///
/// # Errors
///
/// Returns `ProcessError::InvalidRequest`.
pub fn validate_resume_token(token: &str) -> Result<(), ProcessError> {
    let well_formed = !token.is_empty()
        && token.len() <= MAX_RESUME_TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if well_formed {
        Ok(())
    } else {
        Err(ProcessError::InvalidRequest {
            reason: "resume token must be 1-128 characters of [A-Za-z0-9_-]".into(),
        })
    }
}

/// Full argument vector for one invocation
pub(crate) fn build_args(
    config: &OrchestratorConfig,
    mode: ExecutionMode,
    conversation: &Conversation,
) -> Vec<String> {
    let mut args = config.args.clone();
    match mode {
        ExecutionMode::Buffered => args.extend(config.buffered_args.iter().cloned()),
        ExecutionMode::Streaming => args.extend(config.streaming_args.iter().cloned()),
    }
    match conversation {
        Conversation::Resume(token) => {
            args.push(config.resume_flag.clone());
            args.push(token.clone());
        }
        Conversation::New(token) => {
            args.push(config.session_flag.clone());
            args.push(token.clone());
        }
    }
    args
}

/// Resolve the working directory for a request
///
/// Falls back to the configured default; `None` inherits the engine's own.
/// The directory must exist, and must sit under `allowed_workdir_root` when
/// one is configured.
///
/// # Errors
///
/// Returns `ProcessError::InvalidRequest` for a missing or non-directory
/// path and `ProcessError::PathViolation` for one outside the allowed root.
pub(crate) async fn resolve_workdir(
    config: &OrchestratorConfig,
    requested: Option<&Path>,
) -> Result<Option<PathBuf>, ProcessError> {
    let Some(dir) = requested.or(config.default_workdir.as_deref()) else {
        return Ok(None);
    };

    let not_usable = || ProcessError::InvalidRequest {
        reason: "working directory does not exist or is not a directory".into(),
    };
    let resolved = tokio::fs::canonicalize(dir).await.map_err(|_| not_usable())?;
    let meta = tokio::fs::metadata(&resolved).await.map_err(|_| not_usable())?;
    if !meta.is_dir() {
        return Err(not_usable());
    }

    if let Some(root) = &config.allowed_workdir_root {
        let root = tokio::fs::canonicalize(root).await.map_err(|_| not_usable())?;
        if !resolved.starts_with(&root) {
            tracing::warn!(
                target: "chronicle::security",
                requested = %dir.display(),
                "Rejected working directory outside the allowed root"
            );
            return Err(ProcessError::PathViolation {
                target: "working directory".into(),
            });
        }
    }
    Ok(Some(resolved))
}
