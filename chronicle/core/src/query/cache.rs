//! Query result cache
//!
//! Bounded LRU keyed by content: expression text, result limit, and a
//! fingerprint of the input (the serialized document, or the (length, mtime) of every
//! log read). Entries never expire by time; a content change produces a new
//! key, and [`QueryCache::invalidate_handle`] drops entries for a log that
//! was appended to or deleted.
//!
//! Lookups take the read lock and bump an atomic access tick; inserts and
//! evictions take the write lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AggregateResult, QueryOutput};
use crate::store::{LogFingerprint, LogHandle};

/// Default number of cached results
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// What a cached result was computed over
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheScope {
    /// One in-memory document, by its serialized text
    Document(String),
    /// A set of logs, each with the fingerprint it had when read
    Logs(Vec<(LogHandle, LogFingerprint)>),
}

impl CacheScope {
    /// Scope for a document
    #[must_use]
    pub fn document(document: &Value) -> Self {
        // serde_json serializes maps in key order, so equal values compare equal
        Self::Document(document.to_string())
    }

    fn touches(&self, handle: &LogHandle) -> bool {
        match self {
            Self::Document(_) => false,
            Self::Logs(logs) => logs.iter().any(|(h, _)| h == handle),
        }
    }
}

/// Cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    expression: String,
    limit: Option<usize>,
    scope: CacheScope,
}

impl CacheKey {
    /// Build a key
    #[must_use]
    pub fn new(expression: &str, limit: Option<usize>, scope: CacheScope) -> Self {
        Self {
            expression: expression.trim().to_string(),
            limit,
            scope,
        }
    }
}

/// A cached result
#[derive(Debug, Clone, PartialEq)]
pub enum CachedResult {
    /// Result of a single-document evaluation
    Document(QueryOutput),
    /// Result of a multi-log evaluation
    Logs(AggregateResult),
}

struct CacheEntry {
    value: Arc<CachedResult>,
    last_access: AtomicU64,
}

/// Cache occupancy and effectiveness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries currently held
    pub entries: usize,
    /// Maximum entries
    pub capacity: usize,
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that missed
    pub misses: u64,
    /// Entries evicted to make room
    pub evictions: u64,
}

/// Bounded LRU result cache, shared by reference
pub struct QueryCache {
    capacity: usize,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl QueryCache {
    /// Create a cache holding at most `capacity` results (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(HashMap::new()),
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a result, marking it most recently used
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CachedResult>> {
        let entries = self.entries.read();
        if let Some(entry) = entries.get(key) {
            entry.last_access.store(self.next_tick(), Ordering::Relaxed);
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(Arc::clone(&entry.value))
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Store a result, evicting the least recently used entry when full
    pub fn insert(&self, key: CacheKey, value: CachedResult) {
        let mut entries = self.entries.write();
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    capacity = self.capacity,
                    "Evicted least recently used query result"
                );
            }
        }
        entries.insert(
            key,
            CacheEntry {
                value: Arc::new(value),
                last_access: AtomicU64::new(self.next_tick()),
            },
        );
    }

    /// Drop every entry computed over `handle`, returning how many
    pub fn invalidate_handle(&self, handle: &LogHandle) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !key.scope.touches(handle));
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(log = %handle, removed, "Invalidated cached query results");
        }
        removed
    }

    /// Remove every entry, returning how many were held
    ///
    /// Clearing an empty cache is a no-op.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let removed = entries.len();
        entries.clear();
        removed
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
