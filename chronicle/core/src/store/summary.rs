//! Per-log summaries
//!
//! A summary is the derived data the store caches per handle. Cached entries
//! are validated against the file's [`LogFingerprint`] on every lookup and
//! dropped by `append` and `delete`.

use std::collections::BTreeMap;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::reader::LogEntry;
use super::LogHandle;

/// Content fingerprint of a log file: byte length plus modification time
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogFingerprint {
    /// File length in bytes
    pub len: u64,
    /// Modification time, milliseconds since the Unix epoch (0 if unknown)
    pub modified_ms: i64,
}

impl LogFingerprint {
    /// Build a fingerprint from a file length and modification time
    #[must_use]
    pub fn new(len: u64, modified: Option<SystemTime>) -> Self {
        Self {
            len,
            modified_ms: modified
                .and_then(system_time_to_utc)
                .map_or(0, |t| t.timestamp_millis()),
        }
    }
}

/// Aggregate facts about one log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSummary {
    /// The summarized log
    pub handle: LogHandle,
    /// Number of entries that parsed
    pub entries: usize,
    /// Number of malformed lines skipped
    pub skipped_lines: usize,
    /// Entry count per `type` discriminator (`"unknown"` when absent)
    pub types: BTreeMap<String, usize>,
    /// Earliest entry timestamp
    pub first_timestamp: Option<DateTime<Utc>>,
    /// Latest entry timestamp
    pub last_timestamp: Option<DateTime<Utc>>,
    /// File length in bytes at summary time
    pub size_bytes: u64,
}

impl LogSummary {
    pub(super) fn empty(handle: LogHandle, size_bytes: u64) -> Self {
        Self {
            handle,
            entries: 0,
            skipped_lines: 0,
            types: BTreeMap::new(),
            first_timestamp: None,
            last_timestamp: None,
            size_bytes,
        }
    }

    pub(super) fn record(&mut self, entry: &LogEntry) {
        self.entries += 1;
        let kind = entry.entry_type().unwrap_or("unknown").to_string();
        *self.types.entry(kind).or_insert(0) += 1;

        if let Some(ts) = entry.timestamp() {
            self.first_timestamp = Some(self.first_timestamp.map_or(ts, |t| t.min(ts)));
            self.last_timestamp = Some(self.last_timestamp.map_or(ts, |t| t.max(ts)));
        }
    }

    pub(super) fn record_skipped(&mut self) {
        self.skipped_lines += 1;
    }
}

pub(super) fn system_time_to_utc(time: SystemTime) -> Option<DateTime<Utc>> {
    Some(DateTime::<Utc>::from(time))
}
