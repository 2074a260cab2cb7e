//! Sequential reader over one log file.
//!
//! Lines are read as raw bytes so that a single undecodable line (bad JSON or
//! bad UTF-8) is reported as a [`LineParseError`] instead of failing the read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{LogHandle, StoreError};

/// Read buffer size for log files
const READ_BUFFER_BYTES: usize = 64 * 1024;

/// One parsed record from a log line
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// 1-based line number within the file
    pub line: usize,
    /// The record itself (opaque JSON)
    pub value: Value,
}

impl LogEntry {
    /// Create an entry
    #[must_use]
    pub fn new(line: usize, value: Value) -> Self {
        Self { line, value }
    }

    /// The `type` discriminator, when the record carries one
    #[must_use]
    pub fn entry_type(&self) -> Option<&str> {
        self.value.get("type").and_then(Value::as_str)
    }

    /// The record `timestamp`, when present and RFC 3339 formatted
    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.value
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Consume the entry, returning the record
    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }
}

/// A line that could not be decoded
///
/// Recorded as a diagnostic; never aborts the surrounding read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct LineParseError {
    /// 1-based line number
    pub line: usize,
    /// Decoder message
    pub message: String,
}

/// Result of reading one non-blank line
#[derive(Clone, Debug, PartialEq)]
pub enum LogRecord {
    /// The line decoded to a JSON value
    Entry(LogEntry),
    /// The line was malformed
    Malformed(LineParseError),
}

/// Sequential reader over the entries of one log
///
/// Only constructed by [`super::LogStore::open_for_read`], after the handle
/// passed the containment check.
#[derive(Debug)]
pub struct LogReader {
    handle: LogHandle,
    reader: BufReader<File>,
    buffer: Vec<u8>,
    line_no: usize,
    lines_read: usize,
}

impl LogReader {
    pub(super) fn new(handle: LogHandle, file: File) -> Self {
        Self {
            handle,
            reader: BufReader::with_capacity(READ_BUFFER_BYTES, file),
            buffer: Vec::new(),
            line_no: 0,
            lines_read: 0,
        }
    }

    /// The log being read
    #[must_use]
    pub fn handle(&self) -> &LogHandle {
        &self.handle
    }

    /// Number of non-blank lines returned so far
    #[must_use]
    pub fn lines_read(&self) -> usize {
        self.lines_read
    }

    /// Read the next non-blank line
    ///
    /// Returns `Ok(None)` at end of file. Blank lines are skipped and not
    /// counted in [`Self::lines_read`].
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the underlying file cannot be read. A
    /// malformed line is not an error; it is returned as
    /// [`LogRecord::Malformed`].
    pub async fn next_record(&mut self) -> Result<Option<LogRecord>, StoreError> {
        loop {
            self.buffer.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.buffer)
                .await
                .map_err(|source| StoreError::Io {
                    target: self.handle.to_string(),
                    source,
                })?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let line = self.buffer.trim_ascii();
            if line.is_empty() {
                continue;
            }
            self.lines_read += 1;

            let record = match serde_json::from_slice::<Value>(line) {
                Ok(value) => LogRecord::Entry(LogEntry::new(self.line_no, value)),
                Err(e) => {
                    tracing::debug!(
                        log = %self.handle,
                        line = self.line_no,
                        error = %e,
                        "Skipping malformed log line"
                    );
                    LogRecord::Malformed(LineParseError {
                        line: self.line_no,
                        message: e.to_string(),
                    })
                }
            };
            return Ok(Some(record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_accessors() {
        let entry = LogEntry::new(
            3,
            json!({"type": "user", "timestamp": "2024-05-01T10:00:00.000Z"}),
        );
        assert_eq!(entry.entry_type(), Some("user"));
        assert_eq!(
            entry.timestamp().map(|t| t.to_rfc3339()),
            Some("2024-05-01T10:00:00+00:00".to_string())
        );
    }

    #[test]
    fn test_entry_without_metadata() {
        let entry = LogEntry::new(1, json!([1, 2, 3]));
        assert_eq!(entry.entry_type(), None);
        assert_eq!(entry.timestamp(), None);

        let bad_ts = LogEntry::new(1, json!({"timestamp": "yesterday"}));
        assert_eq!(bad_ts.timestamp(), None);
    }
}
