//! Bounded Local Tier - in-process hot cache
//!
//! Entry-count bounded LRU with TTL awareness.
//!
//! # Design
//!
//! - Single `parking_lot::Mutex` around the map and its recency index; no
//!   lock is ever held across an await point
//! - Recency is a monotonically increasing access tick; the lowest tick is
//!   the coldest entry
//! - This is the only tier that drops live data for capacity reasons

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use super::entry::CacheEntry;

/// Bounded tier configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum number of entries
    pub max_entries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: super::DEFAULT_MEMORY_SIZE,
        }
    }
}

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

#[derive(Default)]
struct LruState {
    slots: HashMap<String, Slot>,
    /// tick -> key, coldest first
    recency: BTreeMap<u64, String>,
    next_tick: u64,
}

impl LruState {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn touch(&mut self, key: &str) {
        let tick = self.bump();
        if let Some(slot) = self.slots.get_mut(key) {
            self.recency.remove(&slot.tick);
            slot.tick = tick;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        self.recency.remove(&slot.tick);
        Some(slot.entry)
    }

    fn pop_coldest(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.slots.remove(&key);
        Some(key)
    }
}

/// In-process LRU tier
pub struct BoundedLocalTier {
    state: Mutex<LruState>,
    config: MemoryConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl BoundedLocalTier {
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            state: Mutex::new(LruState::default()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up an entry.
    ///
    /// An expired entry is returned only when `allow_stale` is set; the
    /// caller tells fresh from stale by comparing `expires_at` with the
    /// clock. Without `allow_stale` the expired entry is dropped.
    pub fn get(&self, key: &str, now_ms: u64, allow_stale: bool) -> Option<CacheEntry> {
        let mut state = self.state.lock();

        let expired = match state.slots.get(key) {
            Some(slot) => slot.entry.is_expired(now_ms),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired && !allow_stale {
            state.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        state.touch(key);
        self.hits.fetch_add(1, Ordering::Relaxed);
        state.slots.get(key).map(|slot| slot.entry.clone())
    }

    /// Look up without touching recency or counters
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.state.lock().slots.get(key).map(|slot| slot.entry.clone())
    }

    /// Insert or replace an entry, evicting the coldest entries past capacity
    pub fn set(&self, key: &str, entry: CacheEntry) {
        if self.config.max_entries == 0 {
            return;
        }

        let mut state = self.state.lock();
        state.remove(key);

        while state.slots.len() >= self.config.max_entries {
            match state.pop_coldest() {
                Some(evicted) => {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(key = %evicted, "Evicted coldest entry");
                }
                None => break,
            }
        }

        let tick = state.bump();
        state.recency.insert(tick, key.to_string());
        state.slots.insert(key.to_string(), Slot { entry, tick });
    }

    /// Remove an entry
    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Remove every entry carrying `tag`, returning the removed keys
    pub fn delete_by_tag(&self, tag: &str) -> Vec<String> {
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.has_tag(tag))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            state.remove(key);
        }
        keys
    }

    /// Check if the tier holds a key (expired or not)
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().slots.contains_key(key)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.slots.clear();
        state.recency.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.config.max_entries
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get tier statistics
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            entries: self.len(),
            capacity: self.capacity(),
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

impl Default for BoundedLocalTier {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded tier statistics
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn entry(value: i64, now: u64, ttl_ms: u64) -> CacheEntry {
        CacheEntry::new(json!(value), now, Duration::from_millis(ttl_ms))
    }

    fn tier(max_entries: usize) -> BoundedLocalTier {
        BoundedLocalTier::with_config(MemoryConfig { max_entries })
    }

    #[test]
    fn test_set_get() {
        let cache = tier(10);
        cache.set("a", entry(1, 0, 100));

        let got = cache.get("a", 50, false).unwrap();
        assert_eq!(got.value, json!(1));
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 0);
    }

    #[test]
    fn test_miss() {
        let cache = tier(10);
        assert!(cache.get("missing", 0, false).is_none());
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_expired_entry_dropped_without_stale_tolerance() {
        let cache = tier(10);
        cache.set("a", entry(1, 0, 100));

        assert!(cache.get("a", 100, false).is_none());
        assert!(!cache.contains("a"));
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_expired_entry_served_with_stale_tolerance() {
        let cache = tier(10);
        cache.set("a", entry(1, 0, 100));

        let stale = cache.get("a", 500, true).unwrap();
        assert!(stale.is_expired(500));
        assert_eq!(stale.value, json!(1));
        assert!(cache.contains("a"));
    }

    #[test]
    fn test_lru_eviction_by_access_order() {
        let cache = tier(3);
        cache.set("a", entry(1, 0, 1_000));
        cache.set("b", entry(2, 0, 1_000));
        cache.set("c", entry(3, 0, 1_000));

        // "a" becomes most recently used, "b" is now coldest
        cache.get("a", 1, false);
        cache.set("d", entry(4, 0, 1_000));

        assert_eq!(cache.len(), 3);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_replace_does_not_evict() {
        let cache = tier(2);
        cache.set("a", entry(1, 0, 1_000));
        cache.set("b", entry(2, 0, 1_000));
        cache.set("a", entry(10, 0, 1_000));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evictions(), 0);
        assert_eq!(cache.peek("a").unwrap().value, json!(10));
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let cache = tier(0);
        cache.set("a", entry(1, 0, 1_000));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_delete_by_tag() {
        let cache = tier(10);
        cache.set("a", entry(1, 0, 1_000).with_tags(["g"]));
        cache.set("b", entry(2, 0, 1_000).with_tags(["g", "h"]));
        cache.set("c", entry(3, 0, 1_000).with_tags(["h"]));

        let mut removed = cache.delete_by_tag("g");
        removed.sort();
        assert_eq!(removed, vec!["a".to_string(), "b".to_string()]);
        assert!(cache.contains("c"));
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = tier(10);
        cache.set("a", entry(1, 0, 1_000));
        cache.set("b", entry(2, 0, 1_000));

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());

        for i in 0..10 {
            cache.set(&format!("k{}", i), entry(i, 0, 1_000));
        }
        assert_eq!(cache.len(), 10);
        assert_eq!(cache.evictions(), 0);
    }
}
