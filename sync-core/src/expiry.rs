//! TTL cache for discovery advertisements.
//!
//! Entries stay alive while advertisements keep arriving and expire once
//! nothing has refreshed them for the configured TTL.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Default lifetime of a discovery entry without refresh.
pub const DEFAULT_DISCOVERY_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    refreshed_at: Instant,
}

/// Map whose entries expire when not refreshed.
#[derive(Debug, Clone)]
pub struct ExpiringMap<K, V> {
    ttl: Duration,
    entries: HashMap<K, Entry<V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> ExpiringMap<K, V> {
    /// Create an empty map with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Insert or refresh an entry. Returns `true` if the key was not present.
    ///
    /// A refresh keeps the original value and only extends its lifetime,
    /// unless `replace` returns a new value for it.
    pub fn observe(
        &mut self,
        key: K,
        value: V,
        now: Instant,
        replace: impl FnOnce(&V, V) -> V,
    ) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.value = replace(&entry.value, value);
                entry.refreshed_at = now;
                false
            }
            None => {
                self.entries.insert(
                    key,
                    Entry {
                        value,
                        refreshed_at: now,
                    },
                );
                true
            }
        }
    }

    /// Remove and return every entry not refreshed within the TTL.
    pub fn expire(&mut self, now: Instant) -> Vec<(K, V)> {
        let ttl = self.ttl;
        let stale: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.refreshed_at) >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|e| (k, e.value)))
            .collect()
    }

    /// Remove one entry.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Look up a live entry.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    /// All entries currently held.
    pub fn values(&self) -> Vec<V> {
        self.entries.values().map(|e| e.value.clone()).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
