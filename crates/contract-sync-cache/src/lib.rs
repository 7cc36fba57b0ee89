//! Bounded, priority-evicting in-memory cache for contract-sync.
//!
//! Entries expire lazily on read and eagerly through a background sweep.
//! When the byte budget or entry count is exhausted, the entry with the
//! lowest `access_count / (age + recency + 1)` score is evicted, so hot keys
//! survive bursts of one-off reads.

mod config;
mod entry;
mod error;
mod snapshot;
mod sweep;

pub use config::CacheConfig;
pub use error::SnapshotError;
pub use snapshot::{OfflineSnapshot, SnapshotEntry};
pub use sweep::SweeperHandle;

use entry::CacheEntry;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

type Sizer<V> = Arc<dyn Fn(&V) -> usize + Send + Sync>;

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Live entries (expired-but-unswept entries included).
    pub entries: usize,
    /// Aggregate approximate size in bytes.
    pub total_bytes: u64,
    /// Mean `access_count` across live entries.
    pub average_access_count: f64,
    /// `hits / (hits + misses)` since construction or the last `clear`.
    pub hit_rate_estimate: f64,
    /// Successful reads.
    pub hits: u64,
    /// Reads that found nothing or an expired entry.
    pub misses: u64,
    /// Writes declined because the entry exceeded 10% of the byte budget.
    pub rejected: u64,
    /// Entries removed to satisfy limits.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed.
    pub expirations: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    hits: u64,
    misses: u64,
    rejected: u64,
    evictions: u64,
    expirations: u64,
}

struct CacheState<V> {
    config: CacheConfig,
    entries: HashMap<String, CacheEntry<V>>,
    total_bytes: u64,
    counters: Counters,
}

impl<V> CacheState<V> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    fn expire(&mut self, key: &str) {
        if self.remove(key).is_some() {
            self.counters.expirations += 1;
            debug!(key, "cache entry expired");
        }
    }

    fn over_limits(&self, incoming: u64) -> bool {
        let count = self.entries.len() + usize::from(incoming > 0);
        self.total_bytes + incoming > self.config.max_total_bytes || count > self.config.max_entries
    }

    fn evict_until_fits(&mut self, incoming: u64, now: Instant) {
        while !self.entries.is_empty() && self.over_limits(incoming) {
            let Some(victim) = self.lowest_priority(now) else {
                break;
            };
            if let Some(entry) = self.remove(&victim) {
                self.counters.evictions += 1;
                debug!(key = %victim, size = entry.size, access_count = entry.access_count, "evicted cache entry");
            }
        }
    }

    fn lowest_priority(&self, now: Instant) -> Option<String> {
        self.entries
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.priority_at(now)
                    .total_cmp(&b.priority_at(now))
                    .then_with(|| a.last_accessed_at.cmp(&b.last_accessed_at))
            })
            .map(|(key, _)| key.clone())
    }
}

/// Shared cache addressed by string keys.
pub struct CacheStore<V> {
    state: Mutex<CacheState<V>>,
    sizer: Sizer<V>,
}

impl<V> fmt::Debug for CacheStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CacheStore")
            .field("config", &state.config)
            .field("entries", &state.entries.len())
            .field("total_bytes", &state.total_bytes)
            .finish_non_exhaustive()
    }
}

impl<V: Serialize> CacheStore<V> {
    /// Create a cache that sizes entries by their JSON encoding.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self::with_sizer(config, |value: &V| {
            serde_json::to_vec(value).map_or(std::mem::size_of::<V>(), |bytes| bytes.len())
        })
    }
}

impl<V> CacheStore<V> {
    /// Create a cache with a caller-supplied size estimator.
    #[must_use]
    pub fn with_sizer<F>(config: CacheConfig, sizer: F) -> Self
    where
        F: Fn(&V) -> usize + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(CacheState {
                config,
                entries: HashMap::new(),
                total_bytes: 0,
                counters: Counters::default(),
            }),
            sizer: Arc::new(sizer),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn size_of(&self, value: &V) -> u64 {
        u64::try_from((self.sizer)(value).max(1)).unwrap_or(u64::MAX)
    }

    /// Current limits.
    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.lock().config.clone()
    }

    /// Replace the limits, evicting immediately if the new ones are tighter.
    pub fn reconfigure(&self, config: CacheConfig) {
        let now = Instant::now();
        let mut state = self.lock();
        state.config = config;
        state.evict_until_fits(0, now);
    }

    /// Store `value` under `key` with the default TTL.
    ///
    /// Returns `false` when the entry was declined for being oversized.
    pub fn set(&self, key: impl Into<String>, value: V) -> bool {
        let ttl = self.lock().config.default_ttl();
        self.set_with_ttl(key, value, ttl)
    }

    /// Store `value` under `key`, expiring after `ttl`.
    ///
    /// Returns `false` when the entry was declined for being oversized.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) -> bool {
        let key = key.into();
        let size = self.size_of(&value);
        let now = Instant::now();
        let mut state = self.lock();

        let limit = state.config.max_entry_bytes();
        if size > limit {
            state.counters.rejected += 1;
            warn!(key = %key, size, limit, "cache entry exceeds 10% of byte budget, not stored");
            return false;
        }

        state.remove(&key);
        state.evict_until_fits(size, now);
        state.total_bytes += size;
        state.entries.insert(key, CacheEntry::new(value, size, ttl, now));
        true
    }

    /// Returns true when a live entry exists, without touching access statistics.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        match state.entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                state.expire(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Remove `key`; returns whether an entry existed.
    pub fn delete(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut state = self.lock();
        let doomed: Vec<String> = state
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in &doomed {
            state.remove(key);
        }
        doomed.len()
    }

    /// Drop all entries and reset accounting.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.total_bytes = 0;
        state.counters = Counters::default();
    }

    /// Delete every entry whose TTL has elapsed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.expire(key);
        }
        expired.len()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Sorted list of stored keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Snapshot of the counters and size accounting.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let entries = state.entries.len();
        let accesses: u64 = state.entries.values().map(|entry| entry.access_count).sum();
        let average_access_count = if entries == 0 {
            0.0
        } else {
            accesses as f64 / entries as f64
        };
        let Counters {
            hits,
            misses,
            rejected,
            evictions,
            expirations,
        } = state.counters;
        let lookups = hits + misses;
        let hit_rate_estimate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };
        CacheStats {
            entries,
            total_bytes: state.total_bytes,
            average_access_count,
            hit_rate_estimate,
            hits,
            misses,
            rejected,
            evictions,
            expirations,
        }
    }
}

impl<V: Clone> CacheStore<V> {
    /// Read `key`, refreshing its access statistics.
    ///
    /// Expired entries are removed and reported as a miss.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.lock();
        let expired = match state.entries.get_mut(key) {
            None => {
                state.counters.misses += 1;
                return None;
            }
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                entry.touch(now);
                let value = entry.value.clone();
                state.counters.hits += 1;
                return Some(value);
            }
        };
        if expired {
            state.expire(key);
        }
        state.counters.misses += 1;
        None
    }

    /// Capture live entries for offline persistence.
    #[must_use]
    pub fn export_snapshot(&self, ttl: Duration) -> OfflineSnapshot<V> {
        let now = Instant::now();
        let state = self.lock();
        let mut entries: Vec<SnapshotEntry<V>> = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| SnapshotEntry {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        OfflineSnapshot::new(entries, ttl)
    }

    /// Re-insert snapshot entries with the default TTL; returns how many were stored.
    pub fn restore(&self, snapshot: OfflineSnapshot<V>) -> usize {
        let mut stored = 0;
        for SnapshotEntry { key, value } in snapshot.entries {
            if self.set(key, value) {
                stored += 1;
            }
        }
        stored
    }
}
