//! Counter storage used by the limiters.
//!
//! Limiters never cache state between calls. Every read-modify-write goes
//! through a [`Storage`] implementation, which is responsible for making
//! each single-key operation atomic with respect to concurrent callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::trace;

use crate::clock::Clock;
use crate::error::{Result, TollgateError};

/// Atomic key/value storage with per-key expiry.
///
/// A `ttl_secs` of zero means the entry never expires.
pub trait Storage: Send + Sync {
    /// Atomically add `amount` to the integer at `key` and return the new
    /// value. A missing or expired key starts at zero and receives `ttl_secs`;
    /// an existing key keeps its expiry.
    fn increment(&self, key: &str, amount: i64, ttl_secs: u64) -> Result<i64>;

    /// Read the value at `key`, if present and not expired.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Unconditionally store `value` at `key`.
    fn set(&self, key: &str, value: Value, ttl_secs: u64) -> Result<bool>;

    /// Store `new` only if the live value at `key` equals `expected`
    /// (`None` meaning absent). Returns whether the swap happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Value,
        ttl_secs: u64,
    ) -> Result<bool>;

    /// Remove `key`. Returns whether a live entry was removed.
    fn delete(&self, key: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Value,
    expires_at: Option<i64>,
}

impl StoredEntry {
    fn new(value: Value, now: i64, ttl_secs: u64) -> Self {
        let expires_at = (ttl_secs > 0).then(|| now.saturating_add(ttl_secs as i64));
        Self { value, expires_at }
    }

    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Writes between two sweeps of expired entries.
pub const DEFAULT_PURGE_INTERVAL: u64 = 1_024;

/// In-process storage backed by a sharded concurrent map.
///
/// Each operation locks only the shard owning its key, which gives the
/// per-key atomicity the limiters rely on. Keys that are never read again,
/// such as past fixed windows, are swept every `purge_interval` writes.
pub struct MemoryStorage {
    entries: DashMap<String, StoredEntry>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
    purge_interval: u64,
}

impl MemoryStorage {
    /// Create an empty store that evaluates expiry against `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            writes: AtomicU64::new(0),
            purge_interval: DEFAULT_PURGE_INTERVAL,
        }
    }

    /// Sweep expired entries every `writes` writes. Zero disables sweeping.
    pub fn with_purge_interval(mut self, writes: u64) -> Self {
        self.purge_interval = writes;
        self
    }

    /// Number of stored entries, including ones that expired but were not
    /// yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before.saturating_sub(self.entries.len());
        trace!(purged = purged, "Purged expired entries");
        purged
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Count a write and sweep when the interval comes round. Must be
    /// called before any shard guard is taken.
    fn record_write(&self) {
        if self.purge_interval == 0 {
            return;
        }
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.purge_interval == 0 {
            self.purge_expired();
        }
    }
}

impl Storage for MemoryStorage {
    fn increment(&self, key: &str, amount: i64, ttl_secs: u64) -> Result<i64> {
        self.record_write();
        let now = self.clock.now();
        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry::new(Value::from(0), now, ttl_secs));

        if slot.is_expired(now) {
            *slot = StoredEntry::new(Value::from(0), now, ttl_secs);
        }

        let current = slot.value.as_i64().ok_or_else(|| {
            TollgateError::Storage(format!("value at '{}' is not an integer", key))
        })?;
        let next = current.saturating_add(amount);
        slot.value = Value::from(next);
        Ok(next)
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }

        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    fn set(&self, key: &str, value: Value, ttl_secs: u64) -> Result<bool> {
        self.record_write();
        let now = self.clock.now();
        self.entries
            .insert(key.to_string(), StoredEntry::new(value, now, ttl_secs));
        Ok(true)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Value,
        ttl_secs: u64,
    ) -> Result<bool> {
        self.record_write();
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let live = if occupied.get().is_expired(now) {
                    None
                } else {
                    Some(&occupied.get().value)
                };
                if live != expected {
                    return Ok(false);
                }
                occupied.insert(StoredEntry::new(new, now, ttl_secs));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(StoredEntry::new(new, now, ttl_secs));
                Ok(true)
            }
        }
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, entry)| !entry.is_expired(now))
            .unwrap_or(false))
    }
}
