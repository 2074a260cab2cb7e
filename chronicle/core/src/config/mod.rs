//! TOML Configuration File Support
//!
//! Engine configuration lives in `$XDG_CONFIG_HOME/chronicle/engine.toml`
//! (typically `~/.config/chronicle/engine.toml`). A missing file is not an
//! error.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`CHRONICLE_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [store]
//! root = "~/.claude/projects"
//!
//! [query]
//! timeout_ms = 30000
//! max_timeout_ms = 120000
//! cache_capacity = 256
//! max_workers = 4
//!
//! [process]
//! program = "claude"
//! max_concurrent = 10
//! timeout_secs = 120
//! allowed_workdir_root = "~/code"
//!
//! [stream]
//! envelopes_per_second = 100
//! burst_size = 50
//! stream_timeout_secs = 600
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::OrchestratorConfig;
use crate::query::{EvaluatorConfig, DEFAULT_CACHE_CAPACITY};
use crate::transport::TransportConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[store]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreToml {
    /// Log root; a leading `~/` is expanded
    pub root: Option<PathBuf>,
}

/// `[query]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryToml {
    /// Default evaluation timeout in milliseconds
    pub timeout_ms: Option<u64>,

    /// Ceiling for per-request timeouts in milliseconds
    pub max_timeout_ms: Option<u64>,

    /// Result cache entries
    pub cache_capacity: Option<usize>,

    /// Longest accepted expression in bytes
    pub max_expression_length: Option<usize>,

    /// Hard cap on results per request
    pub max_results: Option<usize>,

    /// Concurrent evaluation threads
    pub max_workers: Option<usize>,
}

/// `[process]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessToml {
    /// Tool executable
    pub program: Option<String>,

    /// Arguments on every invocation
    pub args: Option<Vec<String>>,

    /// Extra arguments in buffered mode
    pub buffered_args: Option<Vec<String>>,

    /// Extra arguments in streaming mode
    pub streaming_args: Option<Vec<String>>,

    /// Flag preceding a resume token
    pub resume_flag: Option<String>,

    /// Flag preceding a new conversation token
    pub session_flag: Option<String>,

    /// Concurrency ceiling
    pub max_concurrent: Option<usize>,

    /// Per-process timeout in seconds
    pub timeout_secs: Option<u64>,

    /// Wait between SIGTERM and SIGKILL in milliseconds
    pub kill_grace_ms: Option<u64>,

    /// Largest accepted message in bytes
    pub max_message_bytes: Option<usize>,

    /// Stderr kept for diagnostics, in bytes
    pub stderr_excerpt_bytes: Option<usize>,

    /// Working directory when a request names none
    pub default_workdir: Option<PathBuf>,

    /// Root that requested working directories must sit under
    pub allowed_workdir_root: Option<PathBuf>,
}

/// `[stream]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamToml {
    /// Steady-state envelope rate
    pub envelopes_per_second: Option<u32>,

    /// Token bucket size
    pub burst_size: Option<u32>,

    /// Shortest throttle wait in milliseconds
    pub min_throttle_delay_ms: Option<u64>,

    /// Longest throttle wait in milliseconds
    pub max_throttle_delay_ms: Option<u64>,

    /// Whether envelopes are rate limited
    pub rate_limit_enabled: Option<bool>,

    /// Overall stream budget in seconds
    pub stream_timeout_secs: Option<u64>,

    /// Envelope channel capacity
    pub channel_capacity: Option<usize>,
}

/// Root TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineToml {
    /// Log Store settings
    pub store: StoreToml,

    /// Query Evaluator settings
    pub query: QueryToml,

    /// Process Orchestrator settings
    pub process: ProcessToml,

    /// Streaming Transport settings
    pub stream: StreamToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved engine configuration
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Log root directory
    pub root: PathBuf,

    /// Result cache entries
    pub cache_capacity: usize,

    /// Query Evaluator limits
    pub query: EvaluatorConfig,

    /// Process Orchestrator settings
    pub process: OrchestratorConfig,

    /// Streaming Transport settings
    pub stream: TransportConfig,

    /// Path of the file this was loaded from
    pub config_file_path: Option<PathBuf>,

    /// Highest-priority source that contributed
    source: ConfigSource,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            query: EvaluatorConfig::default(),
            process: OrchestratorConfig::default(),
            stream: TransportConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl EngineConfig {
    /// Defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults rooted at `root`
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Where the configuration came from
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check invariants the components rely on
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));
        if self.process.max_concurrent == 0 {
            return invalid("process.max_concurrent must be at least 1");
        }
        if self.process.timeout.is_zero() {
            return invalid("process.timeout_secs must be non-zero");
        }
        if self.process.program.trim().is_empty() {
            return invalid("process.program must not be empty");
        }
        if self.query.default_timeout.is_zero() || self.query.max_timeout.is_zero() {
            return invalid("query timeouts must be non-zero");
        }
        if self.query.default_timeout > self.query.max_timeout {
            return invalid("query.timeout_ms must not exceed query.max_timeout_ms");
        }
        if self.cache_capacity == 0 {
            return invalid("query.cache_capacity must be at least 1");
        }
        if self.query.max_results == 0 || self.query.max_expression_length == 0 {
            return invalid("query limits must be non-zero");
        }
        if self.query.max_workers == 0 {
            return invalid("query.max_workers must be at least 1");
        }
        if self.stream.stream_timeout.is_zero() {
            return invalid("stream.stream_timeout_secs must be non-zero");
        }
        if self.stream.channel_capacity == 0 {
            return invalid("stream.channel_capacity must be at least 1");
        }
        let rate = &self.stream.rate_limit;
        if rate.enabled && (rate.envelopes_per_second == 0 || rate.burst_size == 0) {
            return invalid("stream rate limit needs non-zero envelopes_per_second and burst_size");
        }
        if rate.min_throttle_delay_ms > rate.max_throttle_delay_ms {
            return invalid("stream.min_throttle_delay_ms must not exceed max_throttle_delay_ms");
        }
        Ok(())
    }
}

/// `~/.claude/projects`
#[must_use]
pub fn default_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".claude").join("projects"))
        .unwrap_or_else(|| PathBuf::from(".claude/projects"))
}

/// Expand a leading `~/`
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chronicle/engine.toml` or `None` if the
/// config directory cannot be determined.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("chronicle").join("engine.toml"))
}

/// Load configuration from the default path and the process environment
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the result fails validation.
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from `path` and the process environment
///
/// # Errors
///
/// See [`load_config`].
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<EngineConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration from `path`, reading variables through `env`
///
/// # Errors
///
/// See [`load_config`].
pub fn load_config_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<EngineConfig, ConfigError> {
    let mut config = EngineConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: EngineToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;
    Ok(config)
}

fn apply_toml_config(config: &mut EngineConfig, toml: &EngineToml) {
    // Store
    if let Some(root) = &toml.store.root {
        config.root = expand_home(root);
    }

    // Query
    if let Some(ms) = toml.query.timeout_ms {
        config.query.default_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.query.max_timeout_ms {
        config.query.max_timeout = Duration::from_millis(ms);
    }
    if let Some(capacity) = toml.query.cache_capacity {
        config.cache_capacity = capacity;
    }
    if let Some(length) = toml.query.max_expression_length {
        config.query.max_expression_length = length;
    }
    if let Some(max) = toml.query.max_results {
        config.query.max_results = max;
    }
    if let Some(workers) = toml.query.max_workers {
        config.query.max_workers = workers;
    }

    // Process
    let process = &toml.process;
    if let Some(program) = &process.program {
        config.process.program.clone_from(program);
    }
    if let Some(args) = &process.args {
        config.process.args.clone_from(args);
    }
    if let Some(args) = &process.buffered_args {
        config.process.buffered_args.clone_from(args);
    }
    if let Some(args) = &process.streaming_args {
        config.process.streaming_args.clone_from(args);
    }
    if let Some(flag) = &process.resume_flag {
        config.process.resume_flag.clone_from(flag);
    }
    if let Some(flag) = &process.session_flag {
        config.process.session_flag.clone_from(flag);
    }
    if let Some(max) = process.max_concurrent {
        config.process.max_concurrent = max;
    }
    if let Some(secs) = process.timeout_secs {
        config.process.timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = process.kill_grace_ms {
        config.process.kill_grace = Duration::from_millis(ms);
    }
    if let Some(bytes) = process.max_message_bytes {
        config.process.max_message_bytes = bytes;
    }
    if let Some(bytes) = process.stderr_excerpt_bytes {
        config.process.stderr_excerpt_bytes = bytes;
    }
    if let Some(dir) = &process.default_workdir {
        config.process.default_workdir = Some(expand_home(dir));
    }
    if let Some(dir) = &process.allowed_workdir_root {
        config.process.allowed_workdir_root = Some(expand_home(dir));
    }

    // Stream
    let stream = &toml.stream;
    if let Some(rate) = stream.envelopes_per_second {
        config.stream.rate_limit.envelopes_per_second = rate;
    }
    if let Some(burst) = stream.burst_size {
        config.stream.rate_limit.burst_size = burst;
    }
    if let Some(delay) = stream.min_throttle_delay_ms {
        config.stream.rate_limit.min_throttle_delay_ms = delay;
    }
    if let Some(delay) = stream.max_throttle_delay_ms {
        config.stream.rate_limit.max_throttle_delay_ms = delay;
    }
    if let Some(enabled) = stream.rate_limit_enabled {
        config.stream.rate_limit.enabled = enabled;
    }
    if let Some(secs) = stream.stream_timeout_secs {
        config.stream.stream_timeout = Duration::from_secs(secs);
    }
    if let Some(capacity) = stream.channel_capacity {
        config.stream.channel_capacity = capacity;
    }
}

fn apply_env_config(config: &mut EngineConfig, env: impl Fn(&str) -> Option<String>) {
    let parsed = |key: &str| env(key).and_then(|v| v.trim().parse::<u64>().ok());

    if let Some(root) = env("CHRONICLE_ROOT") {
        config.root = expand_home(Path::new(&root));
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = parsed("CHRONICLE_QUERY_TIMEOUT_MS") {
        config.query.default_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(workers) = parsed("CHRONICLE_QUERY_WORKERS") {
        config.query.max_workers = usize::try_from(workers).unwrap_or(usize::MAX);
        config.source = ConfigSource::Env;
    }
    if let Some(capacity) = parsed("CHRONICLE_CACHE_CAPACITY") {
        config.cache_capacity = usize::try_from(capacity).unwrap_or(usize::MAX);
        config.source = ConfigSource::Env;
    }
    if let Some(program) = env("CHRONICLE_TOOL_PROGRAM") {
        config.process.program = program;
        config.source = ConfigSource::Env;
    }
    if let Some(max) = parsed("CHRONICLE_MAX_PROCESSES") {
        config.process.max_concurrent = usize::try_from(max).unwrap_or(usize::MAX);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = parsed("CHRONICLE_PROCESS_TIMEOUT_SECS") {
        config.process.timeout = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(rate) = parsed("CHRONICLE_RATE_LIMIT_EPS") {
        config.stream.rate_limit.envelopes_per_second = u32::try_from(rate).unwrap_or(u32::MAX);
        config.source = ConfigSource::Env;
    }
    if let Some(burst) = parsed("CHRONICLE_RATE_LIMIT_BURST") {
        config.stream.rate_limit.burst_size = u32::try_from(burst).unwrap_or(u32::MAX);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = parsed("CHRONICLE_STREAM_TIMEOUT_SECS") {
        config.stream.stream_timeout = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Values given on the command line
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Log root
    pub root: Option<PathBuf>,

    /// Concurrency ceiling
    pub max_concurrent: Option<usize>,

    /// Tool executable
    pub program: Option<String>,
}

impl ConfigOverrides {
    /// No overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the log root
    #[must_use]
    pub fn with_root(mut self, root: PathBuf) -> Self {
        self.root = Some(root);
        self
    }

    /// Override the concurrency ceiling
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    /// Override the tool executable
    #[must_use]
    pub fn with_program(mut self, program: String) -> Self {
        self.program = Some(program);
        self
    }

    /// Apply onto a loaded configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the result is invalid.
    pub fn apply(&self, config: &mut EngineConfig) -> Result<(), ConfigError> {
        if self.root.is_some() || self.max_concurrent.is_some() || self.program.is_some() {
            config.source = ConfigSource::Cli;
        }
        if let Some(root) = &self.root {
            config.root.clone_from(root);
        }
        if let Some(max) = self.max_concurrent {
            config.process.max_concurrent = max;
        }
        if let Some(program) = &self.program {
            config.process.program.clone_from(program);
        }
        config.validate()
    }
}
