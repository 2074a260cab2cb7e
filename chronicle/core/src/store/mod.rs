//! Log Store
//!
//! Locates, reads and indexes append-only conversation logs. The configured
//! root holds named collections (directories); each collection holds logs,
//! one `<id>.jsonl` file per log with one JSON record per line.
//!
//! ```text
//! <root>/
//!   <collection>/
//!     <log>.jsonl
//! ```
//!
//! # Containment
//!
//! Every name is validated and every existing path canonicalized before a
//! file is opened, so a [`LogHandle`] never resolves outside the root.
//! Violations fail with [`StoreError::PathViolation`] and are logged on the
//! `chronicle::security` target.
//!
//! # Concurrency
//!
//! Readers of the same file are safe. Appending to a log while it is being
//! read has undefined line-boundary behavior; callers must not do that.

mod reader;
mod summary;

pub use reader::{LineParseError, LogEntry, LogReader, LogRecord};
pub use summary::{LogFingerprint, LogSummary};

use std::fmt;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use summary::system_time_to_utc;

/// Log file extension
pub const LOG_EXTENSION: &str = "jsonl";

/// Maximum length of a collection or log name, in bytes
pub const MAX_NAME_BYTES: usize = 255;

// ============================================================================
// Errors
// ============================================================================

/// Log Store errors
///
/// Messages name `collection/log`, never the resolved filesystem path.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A name or handle would resolve outside the configured root
    #[error("path escapes the log root: {target}")]
    PathViolation {
        /// Offending name or handle as given by the caller
        target: String,
    },

    /// A collection or log name is not acceptable
    #[error("invalid {what} name {name:?}: {reason}")]
    InvalidName {
        /// `"collection"` or `"log"`
        what: &'static str,
        /// The rejected name
        name: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// The collection or log does not exist
    #[error("{target} not found")]
    NotFound {
        /// Collection or `collection/log`
        target: String,
    },

    /// The log already exists
    #[error("{target} already exists")]
    AlreadyExists {
        /// `collection/log`
        target: String,
    },

    /// Filesystem error
    #[error("I/O error on {target}: {source}")]
    Io {
        /// Collection or `collection/log`
        target: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// An entry could not be serialized for writing
    #[error("failed to encode entry for {target}: {source}")]
    Encode {
        /// `collection/log`
        target: String,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(target: impl fmt::Display) -> impl FnOnce(std::io::Error) -> Self {
        let target = target.to_string();
        move |source| {
            if source.kind() == IoErrorKind::NotFound {
                Self::NotFound { target }
            } else {
                Self::Io { target, source }
            }
        }
    }

    fn violation(target: impl fmt::Display) -> Self {
        let target = target.to_string();
        tracing::warn!(
            target: "chronicle::security",
            requested = %target,
            "Rejected path outside the log root"
        );
        Self::PathViolation { target }
    }
}

// ============================================================================
// Handles and listings
// ============================================================================

/// Identifies one log: (collection name, log identifier)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogHandle {
    /// Collection (directory) name
    pub collection: String,
    /// Log identifier (file stem)
    pub log: String,
}

impl LogHandle {
    /// Create a handle
    pub fn new(collection: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            log: log.into(),
        }
    }
}

impl fmt::Display for LogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.log)
    }
}

impl FromStr for LogHandle {
    type Err = StoreError;

    /// Parse `collection/log`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((collection, log)) if !collection.is_empty() && !log.is_empty() => {
                Ok(Self::new(collection, log))
            }
            _ => Err(StoreError::InvalidName {
                what: "log",
                name: s.to_string(),
                reason: "expected collection/log",
            }),
        }
    }
}

/// A collection as seen by [`LogStore::list_collections`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    /// Collection name
    pub name: String,
    /// Number of logs it holds
    pub log_count: usize,
    /// Sum of log sizes
    pub size_bytes: u64,
    /// Most recent modification of the collection or any of its logs
    pub modified: Option<DateTime<Utc>>,
}

/// A log as seen by [`LogStore::list_logs`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogInfo {
    /// Handle of the log
    pub handle: LogHandle,
    /// File size in bytes
    pub size_bytes: u64,
    /// Last modification time
    pub modified: Option<DateTime<Utc>>,
    /// Creation time, where the platform records it
    pub created: Option<DateTime<Utc>>,
}

// ============================================================================
// Bulk reads
// ============================================================================

/// Filter applied to parsed entries during [`LogStore::read_all`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadFilter {
    /// Keep only entries whose `type` is in this set (empty keeps all)
    pub types: Vec<String>,
    /// Keep only entries at or after this time
    pub since: Option<DateTime<Utc>>,
    /// Keep only entries at or before this time
    pub until: Option<DateTime<Utc>>,
}

impl ReadFilter {
    /// Whether the filter keeps every entry
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty() && self.since.is_none() && self.until.is_none()
    }

    /// Whether `entry` passes the filter
    ///
    /// Entries without a timestamp fail any time bound.
    #[must_use]
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if !self.types.is_empty() {
            match entry.entry_type() {
                Some(kind) if self.types.iter().any(|t| t == kind) => {}
                _ => return false,
            }
        }
        if self.since.is_none() && self.until.is_none() {
            return true;
        }
        let Some(ts) = entry.timestamp() else {
            return false;
        };
        self.since.map_or(true, |since| ts >= since) && self.until.map_or(true, |until| ts <= until)
    }
}

/// Options for [`LogStore::read_all`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadOptions {
    /// Maximum number of entries to return
    pub limit: Option<usize>,
    /// Number of matching entries to skip first
    pub offset: usize,
    /// Entry filter
    pub filter: ReadFilter,
}

impl ReadOptions {
    /// Set the limit
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the offset
    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Set the filter
    #[must_use]
    pub fn with_filter(mut self, filter: ReadFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// Result of [`LogStore::read_all`]
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ReadOutcome {
    /// Entries in file order
    pub entries: Vec<LogEntry>,
    /// Malformed lines encountered
    pub diagnostics: Vec<LineParseError>,
    /// Non-blank lines read
    pub lines_processed: usize,
}

// ============================================================================
// Store
// ============================================================================

/// Log Store rooted at one directory
#[derive(Debug)]
pub struct LogStore {
    root: PathBuf,
    summaries: DashMap<LogHandle, (LogFingerprint, LogSummary)>,
}

impl LogStore {
    /// Open a store at `root`, creating the directory if it does not exist
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the root cannot be created or resolved.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        fs::create_dir_all(root).await.map_err(StoreError::io("root"))?;
        let root = fs::canonicalize(root).await.map_err(StoreError::io("root"))?;
        tracing::info!(root = %root.display(), "Log store opened");
        Ok(Self {
            root,
            summaries: DashMap::new(),
        })
    }

    /// The canonical root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Enumerate collections, most recently modified first
    ///
    /// A collection that cannot be read is logged and left out.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` only if the root itself cannot be listed.
    pub async fn list_collections(&self) -> Result<Vec<CollectionInfo>, StoreError> {
        let mut dir = fs::read_dir(&self.root).await.map_err(StoreError::io("root"))?;
        let mut collections = Vec::new();

        while let Some(entry) = dir.next_entry().await.map_err(StoreError::io("root"))? {
            let Ok(name) = entry.file_name().into_string() else {
                tracing::debug!("Skipping collection with non UTF-8 name");
                continue;
            };
            // Symlinked directories are not followed here
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => {}
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(
                        collection = %name,
                        error = %e,
                        "Skipping unreadable collection"
                    );
                    continue;
                }
            }
            match self.describe_collection(&name).await {
                Ok(info) => collections.push(info),
                Err(e) => {
                    tracing::warn!(
                        collection = %name,
                        error = %e,
                        "Skipping unreadable collection"
                    );
                }
            }
        }

        collections.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
        Ok(collections)
    }

    async fn describe_collection(&self, name: &str) -> Result<CollectionInfo, StoreError> {
        let dir = self.resolve_collection(name).await?;
        let dir_modified = fs::metadata(&dir)
            .await
            .map_err(StoreError::io(name))?
            .modified()
            .ok()
            .and_then(system_time_to_utc);
        let logs = self.list_logs(name).await?;

        let modified = logs
            .iter()
            .filter_map(|l| l.modified)
            .chain(dir_modified)
            .max();
        Ok(CollectionInfo {
            name: name.to_string(),
            log_count: logs.len(),
            size_bytes: logs.iter().map(|l| l.size_bytes).sum(),
            modified,
        })
    }

    /// Enumerate the logs of a collection, most recently modified first
    ///
    /// Only `*.jsonl` regular files are logs. A log whose metadata cannot be
    /// read is logged and left out.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the collection does not exist, or
    /// a containment error if the name is not acceptable.
    pub async fn list_logs(&self, collection: &str) -> Result<Vec<LogInfo>, StoreError> {
        let dir = self.resolve_collection(collection).await?;
        let mut entries = fs::read_dir(&dir).await.map_err(StoreError::io(collection))?;
        let mut logs = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(StoreError::io(collection))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let handle = LogHandle::new(collection, stem);
            match entry.metadata().await {
                Ok(meta) if meta.is_file() => logs.push(LogInfo {
                    handle,
                    size_bytes: meta.len(),
                    modified: meta.modified().ok().and_then(system_time_to_utc),
                    created: meta.created().ok().and_then(system_time_to_utc),
                }),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(log = %handle, error = %e, "Skipping unreadable log");
                }
            }
        }

        logs.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| a.handle.log.cmp(&b.handle.log))
        });
        Ok(logs)
    }

    /// Every log under the root, collection by collection
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` only if the root cannot be listed.
    pub async fn all_handles(&self) -> Result<Vec<LogHandle>, StoreError> {
        let mut handles = Vec::new();
        for collection in self.list_collections().await? {
            match self.list_logs(&collection.name).await {
                Ok(logs) => handles.extend(logs.into_iter().map(|l| l.handle)),
                Err(e) => {
                    tracing::warn!(
                        collection = %collection.name,
                        error = %e,
                        "Skipping collection"
                    );
                }
            }
        }
        Ok(handles)
    }

    /// Open a sequential reader over a log
    ///
    /// Containment is checked before the file is opened.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PathViolation`, `StoreError::InvalidName`,
    /// `StoreError::NotFound` or `StoreError::Io`.
    pub async fn open_for_read(&self, handle: &LogHandle) -> Result<LogReader, StoreError> {
        let path = self.resolve_log(handle).await?;
        let file = fs::File::open(&path).await.map_err(StoreError::io(handle))?;
        tracing::debug!(log = %handle, "Opened log for read");
        Ok(LogReader::new(handle.clone(), file))
    }

    /// Read a whole log with line-level error isolation
    ///
    /// Malformed lines become diagnostics; parsing continues past them.
    /// `offset` and `limit` count entries that pass the filter.
    ///
    /// # Errors
    ///
    /// Same as [`Self::open_for_read`], plus `StoreError::Io` mid-read.
    pub async fn read_all(
        &self,
        handle: &LogHandle,
        options: &ReadOptions,
    ) -> Result<ReadOutcome, StoreError> {
        let mut reader = self.open_for_read(handle).await?;
        let mut outcome = ReadOutcome::default();
        let mut skipped = 0usize;

        let full = |entries: &[LogEntry]| options.limit.is_some_and(|limit| entries.len() >= limit);
        while !full(&outcome.entries) {
            let Some(record) = reader.next_record().await? else {
                break;
            };
            match record {
                LogRecord::Entry(entry) => {
                    if !options.filter.matches(&entry) {
                        continue;
                    }
                    if skipped < options.offset {
                        skipped += 1;
                        continue;
                    }
                    outcome.entries.push(entry);
                }
                LogRecord::Malformed(diag) => outcome.diagnostics.push(diag),
            }
        }

        outcome.lines_processed = reader.lines_read();
        if !outcome.diagnostics.is_empty() {
            tracing::warn!(
                log = %handle,
                skipped = outcome.diagnostics.len(),
                "Log contains malformed lines"
            );
        }
        Ok(outcome)
    }

    /// Current fingerprint of a log
    ///
    /// # Errors
    ///
    /// Returns a containment error, `StoreError::NotFound` or `StoreError::Io`.
    pub async fn fingerprint(&self, handle: &LogHandle) -> Result<LogFingerprint, StoreError> {
        let path = self.resolve_log(handle).await?;
        let meta = fs::metadata(&path).await.map_err(StoreError::io(handle))?;
        Ok(LogFingerprint::new(meta.len(), meta.modified().ok()))
    }

    /// Summarize a log, serving a cached summary when the file is unchanged
    ///
    /// # Errors
    ///
    /// Same as [`Self::read_all`].
    pub async fn summarize(&self, handle: &LogHandle) -> Result<LogSummary, StoreError> {
        let fingerprint = self.fingerprint(handle).await?;
        if let Some(cached) = self.summaries.get(handle) {
            let (stamp, summary) = cached.value();
            if *stamp == fingerprint {
                return Ok(summary.clone());
            }
        }

        let mut reader = self.open_for_read(handle).await?;
        let mut summary = LogSummary::empty(handle.clone(), fingerprint.len);
        while let Some(record) = reader.next_record().await? {
            match record {
                LogRecord::Entry(entry) => summary.record(&entry),
                LogRecord::Malformed(_) => summary.record_skipped(),
            }
        }

        self.summaries
            .insert(handle.clone(), (fingerprint, summary.clone()));
        Ok(summary)
    }

    // ========================================================================
    // Mutators
    // ========================================================================

    /// Create a collection; succeeds if it already exists
    ///
    /// # Errors
    ///
    /// Returns a containment error or `StoreError::Io`.
    pub async fn create_collection(&self, name: &str) -> Result<CollectionInfo, StoreError> {
        let dir = self.resolve_collection(name).await?;
        fs::create_dir_all(&dir).await.map_err(StoreError::io(name))?;
        tracing::info!(collection = %name, "Collection created");
        self.describe_collection(name).await
    }

    /// Create a new log holding `initial` entries
    ///
    /// The collection is created if needed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if the log exists, a containment
    /// error, `StoreError::Encode` or `StoreError::Io`.
    pub async fn create(
        &self,
        collection: &str,
        id: &str,
        initial: &[Value],
    ) -> Result<LogHandle, StoreError> {
        let handle = LogHandle::new(collection, id);
        let dir = self.resolve_collection(collection).await?;
        fs::create_dir_all(&dir).await.map_err(StoreError::io(collection))?;
        let path = self.resolve_log(&handle).await?;

        let payload = encode_entries(&handle, initial)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|source| {
                if source.kind() == IoErrorKind::AlreadyExists {
                    StoreError::AlreadyExists {
                        target: handle.to_string(),
                    }
                } else {
                    StoreError::Io {
                        target: handle.to_string(),
                        source,
                    }
                }
            })?;
        file.write_all(&payload).await.map_err(StoreError::io(&handle))?;
        file.flush().await.map_err(StoreError::io(&handle))?;

        tracing::info!(log = %handle, entries = initial.len(), "Log created");
        Ok(handle)
    }

    /// Append entries to an existing log, returning how many were written
    ///
    /// If the file does not end in a newline, one is written first.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the log does not exist, a
    /// containment error, `StoreError::Encode` or `StoreError::Io`.
    pub async fn append(&self, handle: &LogHandle, entries: &[Value]) -> Result<usize, StoreError> {
        let path = self.resolve_log(handle).await?;
        let mut payload = encode_entries(handle, entries)?;

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&path)
            .await
            .map_err(StoreError::io(handle))?;

        let len = file.metadata().await.map_err(StoreError::io(handle))?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1)).await.map_err(StoreError::io(handle))?;
            file.read_exact(&mut last).await.map_err(StoreError::io(handle))?;
            if last[0] != b'\n' {
                payload.insert(0, b'\n');
            }
        }

        file.write_all(&payload).await.map_err(StoreError::io(handle))?;
        file.flush().await.map_err(StoreError::io(handle))?;
        self.invalidate(handle);

        tracing::debug!(log = %handle, entries = entries.len(), "Entries appended");
        Ok(entries.len())
    }

    /// Delete a log and its cached summary
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound`, a containment error or `StoreError::Io`.
    pub async fn delete(&self, handle: &LogHandle) -> Result<(), StoreError> {
        let path = self.resolve_log(handle).await?;
        fs::remove_file(&path).await.map_err(StoreError::io(handle))?;
        self.invalidate(handle);
        tracing::info!(log = %handle, "Log deleted");
        Ok(())
    }

    /// Drop cached derived data for a handle
    pub fn invalidate(&self, handle: &LogHandle) {
        self.summaries.remove(handle);
    }

    /// Number of cached summaries
    #[must_use]
    pub fn cached_summaries(&self) -> usize {
        self.summaries.len()
    }

    // ========================================================================
    // Path resolution
    // ========================================================================

    async fn resolve_collection(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name("collection", name)?;
        let path = self.root.join(name);
        self.contain(path, name).await
    }

    async fn resolve_log(&self, handle: &LogHandle) -> Result<PathBuf, StoreError> {
        validate_name("log", &handle.log)?;
        let dir = self.resolve_collection(&handle.collection).await?;
        let path = dir.join(format!("{}.{LOG_EXTENSION}", handle.log));
        self.contain(path, handle).await
    }

    /// Resolve symlinks of an existing path and require it under the root
    async fn contain(
        &self,
        path: PathBuf,
        target: impl fmt::Display,
    ) -> Result<PathBuf, StoreError> {
        match fs::canonicalize(&path).await {
            Ok(resolved) if resolved.starts_with(&self.root) => Ok(resolved),
            Ok(_) => Err(StoreError::violation(target)),
            // Not created yet: the validated name keeps it directly under its parent
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(path),
            Err(source) => Err(StoreError::Io {
                target: target.to_string(),
                source,
            }),
        }
    }
}

/// Check a collection or log name before any path is built from it
///
/// Names that could address another directory are path violations; names
/// that are merely unusable are invalid.
///
/// # Errors
///
/// Returns `StoreError::PathViolation` or `StoreError::InvalidName`.
pub fn validate_name(what: &'static str, name: &str) -> Result<(), StoreError> {
    let invalid = |reason| StoreError::InvalidName {
        what,
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(invalid("too long"));
    }
    if name.contains('\0') {
        return Err(invalid("contains NUL"));
    }
    if name == "." || name == ".." || name.contains("..") || name.contains(['/', '\\']) {
        return Err(StoreError::violation(name));
    }
    Ok(())
}

fn encode_entries(handle: &LogHandle, entries: &[Value]) -> Result<Vec<u8>, StoreError> {
    let mut payload = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut payload, entry).map_err(|source| StoreError::Encode {
            target: handle.to_string(),
            source,
        })?;
        payload.push(b'\n');
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    async fn store() -> (TempDir, LogStore) {
        let dir = TempDir::new().unwrap();
        let store = LogStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("log", "abc-123_x.y").is_ok());
        assert!(matches!(
            validate_name("log", ""),
            Err(StoreError::InvalidName { .. })
        ));
        assert!(matches!(
            validate_name("log", &"a".repeat(MAX_NAME_BYTES + 1)),
            Err(StoreError::InvalidName { .. })
        ));
        for bad in ["..", ".", "../etc", "a/b", "a\\b", "/etc/passwd"] {
            assert!(
                matches!(validate_name("collection", bad), Err(StoreError::PathViolation { .. })),
                "{bad} should be a path violation"
            );
        }
    }

    #[test]
    fn test_handle_parse_and_display() {
        let handle: LogHandle = "demo/abc".parse().unwrap();
        assert_eq!(handle, LogHandle::new("demo", "abc"));
        assert_eq!(handle.to_string(), "demo/abc");
        assert!("demo".parse::<LogHandle>().is_err());
        assert!("/abc".parse::<LogHandle>().is_err());
    }

    #[test]
    fn test_read_filter() {
        let user = LogEntry::new(1, json!({"type": "user", "timestamp": "2024-05-01T10:00:00Z"}));
        let bare = LogEntry::new(2, json!({"type": "user"}));

        let by_type = ReadFilter {
            types: vec!["assistant".into()],
            ..ReadFilter::default()
        };
        assert!(!by_type.matches(&user));
        assert!(ReadFilter::default().matches(&bare));

        let since = ReadFilter {
            since: Some("2024-05-01T09:00:00Z".parse().unwrap()),
            ..ReadFilter::default()
        };
        assert!(since.matches(&user));
        assert!(!since.matches(&bare));
    }

    #[tokio::test]
    async fn test_create_and_read_all_round_trip() {
        let (_dir, store) = store().await;
        let entries: Vec<Value> = (0..5).map(|i| json!({"type": "user", "n": i})).collect();
        let handle = store.create("demo", "abc", &entries[..2]).await.unwrap();
        store.append(&handle, &entries[2..]).await.unwrap();

        let outcome = store.read_all(&handle, &ReadOptions::default()).await.unwrap();
        let values: Vec<Value> = outcome.entries.into_iter().map(LogEntry::into_value).collect();
        assert_eq!(values, entries);
        assert_eq!(outcome.lines_processed, 5);
        assert!(outcome.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_read_all_limit_offset_and_malformed_line() {
        let (dir, store) = store().await;
        tokio::fs::create_dir(dir.path().join("demo")).await.unwrap();
        tokio::fs::write(
            dir.path().join("demo/abc.jsonl"),
            "{\"n\":1}\n{not json\n\n{\"n\":2}\n{\"n\":3}\n",
        )
        .await
        .unwrap();
        let handle = LogHandle::new("demo", "abc");

        let all = store.read_all(&handle, &ReadOptions::default()).await.unwrap();
        assert_eq!(all.entries.len(), 3);
        assert_eq!(all.diagnostics.len(), 1);
        assert_eq!(all.diagnostics[0].line, 2);
        assert_eq!(all.lines_processed, 4);

        let page = store
            .read_all(&handle, &ReadOptions::default().with_offset(1).with_limit(1))
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].value, json!({"n": 2}));
        assert_eq!(page.entries[0].line, 4);

        let none = store
            .read_all(&handle, &ReadOptions::default().with_limit(0))
            .await
            .unwrap();
        assert!(none.entries.is_empty());
        assert_eq!(none.lines_processed, 0);
    }

    #[tokio::test]
    async fn test_crlf_and_padded_lines_parse() {
        let (dir, store) = store().await;
        tokio::fs::create_dir(dir.path().join("demo")).await.unwrap();
        let text = "{\"n\":1}\r\n  {\"n\":2} \r\n\r\n";
        tokio::fs::write(dir.path().join("demo/crlf.jsonl"), text)
            .await
            .unwrap();

        let all = store
            .read_all(&LogHandle::new("demo", "crlf"), &ReadOptions::default())
            .await
            .unwrap();
        let values: Vec<Value> = all.entries.into_iter().map(LogEntry::into_value).collect();
        assert_eq!(values, vec![json!({"n": 1}), json!({"n": 2})]);
        assert!(all.diagnostics.is_empty());
        assert_eq!(all.lines_processed, 2);
    }

    #[tokio::test]
    async fn test_append_repairs_missing_trailing_newline() {
        let (dir, store) = store().await;
        tokio::fs::create_dir(dir.path().join("demo")).await.unwrap();
        tokio::fs::write(dir.path().join("demo/abc.jsonl"), "{\"n\":1}")
            .await
            .unwrap();
        let handle = LogHandle::new("demo", "abc");

        store.append(&handle, &[json!({"n": 2})]).await.unwrap();
        let outcome = store.read_all(&handle, &ReadOptions::default()).await.unwrap();
        assert_eq!(outcome.entries.len(), 2);
        assert!(outcome.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_create_existing_log_fails() {
        let (_dir, store) = store().await;
        store.create("demo", "abc", &[]).await.unwrap();
        assert!(matches!(
            store.create("demo", "abc", &[]).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_listings() {
        let (dir, store) = store().await;
        store.create_collection("empty").await.unwrap();
        store.create("demo", "a", &[json!({"n": 1})]).await.unwrap();
        store.create("demo", "b", &[]).await.unwrap();
        tokio::fs::write(dir.path().join("demo/notes.txt"), "ignored")
            .await
            .unwrap();

        assert!(store.list_logs("empty").await.unwrap().is_empty());
        let mut logs: Vec<String> = store
            .list_logs("demo")
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.handle.log)
            .collect();
        logs.sort();
        assert_eq!(logs, vec!["a".to_string(), "b".to_string()]);

        let collections = store.list_collections().await.unwrap();
        assert_eq!(collections.len(), 2);
        let demo = collections.iter().find(|c| c.name == "demo").unwrap();
        assert_eq!(demo.log_count, 2);
        assert!(demo.size_bytes > 0);

        assert!(matches!(
            store.list_logs("missing").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_summary_cached_and_invalidated() {
        let (_dir, store) = store().await;
        let handle = store
            .create("demo", "abc", &[json!({"type": "user"}), json!({"type": "assistant"})])
            .await
            .unwrap();

        let first = store.summarize(&handle).await.unwrap();
        assert_eq!(first.entries, 2);
        assert_eq!(store.cached_summaries(), 1);

        store.append(&handle, &[json!({"type": "user"})]).await.unwrap();
        assert_eq!(store.cached_summaries(), 0);
        let second = store.summarize(&handle).await.unwrap();
        assert_eq!(second.entries, 3);
        assert_eq!(second.types.get("user"), Some(&2));

        store.delete(&handle).await.unwrap();
        assert_eq!(store.cached_summaries(), 0);
        assert!(matches!(
            store.summarize(&handle).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_is_path_violation() {
        let (dir, store) = store().await;
        let outside = TempDir::new().unwrap();
        tokio::fs::write(outside.path().join("secret.jsonl"), "{}\n")
            .await
            .unwrap();
        tokio::fs::symlink(outside.path(), dir.path().join("linked"))
            .await
            .unwrap();

        let handle = LogHandle::new("linked", "secret");
        assert!(matches!(
            store.open_for_read(&handle).await,
            Err(StoreError::PathViolation { .. })
        ));
    }
}
