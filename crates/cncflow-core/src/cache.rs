//! Last-known-state caches with explicit reload-from-storage recovery.
//!
//! The caches here are never the system of record. A strategy reads through
//! them to avoid a storage round-trip per record, mutates them while applying
//! a batch, and must [`StateCache::reload`] (or at least invalidate) every key
//! it touched when the surrounding transaction fails. An invalidated entry is
//! transparently re-read from storage on the next [`StateCache::get_or_load`].
//!
//! Entries distinguish *unknown* (never loaded, or invalidated) from *known
//! absent* (storage was consulted and holds nothing for the key), so a miss
//! in storage is not re-queried on every record.
//!
//! # Example
//! ```
//! use cncflow_core::cache::StateCache;
//!
//! let mut cache: StateCache<&str, i64> = StateCache::new();
//! let value = cache.get_or_load(&"spindle", |_| Ok(Some(3))).unwrap();
//! assert_eq!(value, Some(&3));
//!
//! cache.invalidate(&"spindle");
//! assert!(cache.get(&"spindle").is_none());
//! ```

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use crate::error::Result;

/// Cache hit/miss/reload statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries filled from storage on a miss.
    pub loads: u64,
    /// Explicit re-reads after a failed transaction.
    pub reloads: u64,
    /// Entries dropped by invalidation or `clear_except`.
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate as a fraction [0.0, 1.0]. Returns 0.0 if no lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Per-key projection of storage state.
#[derive(Debug, Clone)]
pub struct StateCache<K, V> {
    /// `None` values are known-absent keys.
    entries: HashMap<K, Option<V>>,
    stats: CacheStats,
}

impl<K, V> Default for StateCache<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            stats: CacheStats::default(),
        }
    }
}

impl<K: Hash + Eq + Clone, V> StateCache<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached keys, including known-absent ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Cached state for `key`.
    ///
    /// The outer `None` means "unknown"; `Some(None)` means storage holds
    /// nothing for the key.
    pub fn get(&mut self, key: &K) -> Option<Option<&V>> {
        if let Some(entry) = self.entries.get(key) {
            self.stats.hits += 1;
            Some(entry.as_ref())
        } else {
            self.stats.misses += 1;
            None
        }
    }

    /// Cached value for `key`, consulting `loader` when the key is unknown.
    pub fn get_or_load<F>(&mut self, key: &K, loader: F) -> Result<Option<&V>>
    where
        F: FnOnce(&K) -> Result<Option<V>>,
    {
        if self.entries.contains_key(key) {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
            let loaded = loader(key)?;
            self.stats.loads += 1;
            self.entries.insert(key.clone(), loaded);
        }
        Ok(self.entries.get(key).and_then(Option::as_ref))
    }

    /// Record the state just written to storage.
    pub fn insert(&mut self, key: K, value: V) {
        self.entries.insert(key, Some(value));
    }

    /// Record that storage no longer holds anything for `key`.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.insert(key.clone(), None).flatten()
    }

    /// Forget `key`; the next lookup goes to storage.
    pub fn invalidate(&mut self, key: &K) {
        if self.entries.remove(key).is_some() {
            self.stats.evictions += 1;
        }
    }

    pub fn invalidate_all(&mut self) {
        self.stats.evictions += self.entries.len() as u64;
        self.entries.clear();
    }

    /// Re-read `key` from storage and replace the cached entry.
    ///
    /// On loader failure the key is left unknown so it is re-read lazily.
    pub fn reload<F>(&mut self, key: &K, loader: F) -> Result<()>
    where
        F: FnOnce(&K) -> Result<Option<V>>,
    {
        self.entries.remove(key);
        let loaded = loader(key)?;
        self.stats.reloads += 1;
        self.entries.insert(key.clone(), loaded);
        Ok(())
    }

    /// Evict every entry whose key is not in `keep`.
    pub fn clear_except(&mut self, keep: &HashSet<K>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| keep.contains(key));
        let evicted = before - self.entries.len();
        self.stats.evictions += evicted as u64;
        evicted
    }

    /// Keys whose cached state is a present value.
    pub fn present_keys(&self) -> Vec<K> {
        self.entries
            .iter()
            .filter(|(_, v)| v.is_some())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Iterate present values.
    pub fn values(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k, v)))
    }
}

/// Single-slot cache holding the open interval of one module.
#[derive(Debug, Clone)]
pub struct CachedSlot<V> {
    /// `None` = unknown, `Some(None)` = known empty.
    state: Option<Option<V>>,
    reloads: u64,
}

impl<V> Default for CachedSlot<V> {
    fn default() -> Self {
        Self {
            state: None,
            reloads: 0,
        }
    }
}

impl<V> CachedSlot<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.state.is_some()
    }

    /// Cached value without touching storage; `None` if unknown or empty.
    pub fn peek(&self) -> Option<&V> {
        self.state.as_ref().and_then(Option::as_ref)
    }

    pub fn get_or_load<F>(&mut self, loader: F) -> Result<Option<&V>>
    where
        F: FnOnce() -> Result<Option<V>>,
    {
        if self.state.is_none() {
            self.state = Some(loader()?);
        }
        Ok(self.peek())
    }

    pub fn set(&mut self, value: Option<V>) {
        self.state = Some(value);
    }

    pub fn take(&mut self) -> Option<V> {
        self.state.take().flatten()
    }

    pub fn invalidate(&mut self) {
        self.state = None;
    }

    /// Replace the slot with the storage view; on failure the slot stays unknown.
    pub fn reload<F>(&mut self, loader: F) -> Result<()>
    where
        F: FnOnce() -> Result<Option<V>>,
    {
        self.state = None;
        self.state = Some(loader()?);
        self.reloads += 1;
        Ok(())
    }

    pub fn reload_count(&self) -> u64 {
        self.reloads
    }
}
