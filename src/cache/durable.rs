//! Durable Local Tier - on-device persistent mirror of hot entries
//!
//! Best-effort persistence: every failure here degrades to a miss or a
//! dropped write, never to an error the caller sees.
//!
//! # Design
//!
//! - Records live under a namespace prefix in a [`PersistentStore`]
//! - Records are JSON [`DurableRecord`]s; anything unparseable is a miss
//! - A failed write purges the whole namespace and is swallowed
//! - A background sweeper removes expired records on an interval

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::SharedClock;
use super::entry::{CacheEntry, DurableRecord};
use super::key::KeyCodec;
use super::store::PersistentStore;

/// Durable tier - persistent key-value mirror
pub struct DurableLocalTier {
    store: Arc<dyn PersistentStore>,
    codec: KeyCodec,
    clock: SharedClock,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
    corrupt_records: AtomicU64,
    swept: AtomicU64,
}

impl DurableLocalTier {
    /// Create a tier over `store`, scoped to `namespace`
    pub fn new(store: Arc<dyn PersistentStore>, namespace: &str, clock: SharedClock) -> Self {
        Self {
            store,
            codec: KeyCodec::new(namespace),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            corrupt_records: AtomicU64::new(0),
            swept: AtomicU64::new(0),
        }
    }

    /// Read a record.
    ///
    /// Expired records are returned only with `allow_stale`; otherwise they
    /// are removed and reported as a miss.
    pub async fn get(&self, key: &str, allow_stale: bool) -> Option<CacheEntry> {
        let physical = self.codec.namespaced(key);
        let entry = match self.read_record(&physical).await {
            Some(entry) => entry,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if entry.is_expired(self.clock.now_ms()) && !allow_stale {
            self.remove_physical(&physical).await;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Read a live record without touching counters
    pub async fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.read_record(&self.codec.namespaced(key))
            .await
            .filter(|entry| !entry.is_expired(self.clock.now_ms()))
    }

    /// Persist an entry. Returns false if the write was dropped.
    pub async fn set(&self, key: &str, entry: &CacheEntry) -> bool {
        let physical = self.codec.namespaced(key);
        let text = match serde_json::to_string(&DurableRecord::from(entry)) {
            Ok(text) => text,
            Err(e) => {
                warn!(key = %key, "Failed to encode durable record: {}", e);
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        match self.store.set_item(&physical, &text).await {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, "Durable write failed, purging namespace: {}", e);
                let purged = self.clear().await;
                debug!("Purged {} durable records after failed write", purged);
                false
            }
        }
    }

    /// Remove a record
    pub async fn delete(&self, key: &str) -> bool {
        let physical = self.codec.namespaced(key);
        match self.store.get_item(&physical).await {
            Ok(Some(_)) => self.remove_physical(&physical).await,
            _ => false,
        }
    }

    /// Remove every record tagged with `tag`, by key scan
    pub async fn delete_by_tag(&self, tag: &str) -> usize {
        let mut removed = 0;
        for physical in self.namespaced_keys().await {
            let tagged = self
                .read_record(&physical)
                .await
                .map(|entry| entry.has_tag(tag))
                .unwrap_or(false);
            if tagged && self.remove_physical(&physical).await {
                removed += 1;
            }
        }
        removed
    }

    /// Remove every record under the namespace
    pub async fn clear(&self) -> usize {
        let mut removed = 0;
        for physical in self.namespaced_keys().await {
            if self.remove_physical(&physical).await {
                removed += 1;
            }
        }
        removed
    }

    /// Remove expired and unreadable records. Returns the number removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut removed = 0;

        for physical in self.namespaced_keys().await {
            let expired = match self.read_record(&physical).await {
                Some(entry) => entry.is_expired(now),
                // Corrupt records were already dropped by read_record
                None => continue,
            };
            if expired && self.remove_physical(&physical).await {
                removed += 1;
            }
        }

        self.swept.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Number of records under the namespace
    pub async fn len(&self) -> usize {
        self.namespaced_keys().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Get tier statistics
    pub async fn stats(&self) -> DurableStats {
        DurableStats {
            entries: self.len().await,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            corrupt_records: self.corrupt_records.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }

    async fn read_record(&self, physical: &str) -> Option<CacheEntry> {
        let text = match self.store.get_item(physical).await {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                debug!(key = %physical, "Durable read failed: {}", e);
                return None;
            }
        };

        match serde_json::from_str::<DurableRecord>(&text) {
            Ok(record) => Some(record.into()),
            Err(e) => {
                debug!(key = %physical, "Dropping unparseable durable record: {}", e);
                self.corrupt_records.fetch_add(1, Ordering::Relaxed);
                self.remove_physical(physical).await;
                None
            }
        }
    }

    async fn remove_physical(&self, physical: &str) -> bool {
        match self.store.remove_item(physical).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %physical, "Durable remove failed: {}", e);
                false
            }
        }
    }

    async fn namespaced_keys(&self) -> Vec<String> {
        match self.store.keys().await {
            Ok(keys) => keys
                .into_iter()
                .filter(|k| self.codec.strip(k).is_some())
                .collect(),
            Err(e) => {
                warn!("Durable key listing failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Durable tier statistics
#[derive(Debug, Clone, Serialize)]
pub struct DurableStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub corrupt_records: u64,
    pub swept: u64,
}

// =============================================================================
// Sweeper
// =============================================================================

/// Owned background task that periodically sweeps expired records
pub struct DurableSweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl DurableSweeper {
    /// Start sweeping `tier` every `interval`. The first sweep runs one
    /// interval after start.
    pub fn start(tier: Arc<DurableLocalTier>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let period = interval.max(Duration::from_millis(1));
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Durable sweeper stopping");
                        break;
                    }
                    _ = tick.tick() => {
                        let removed = tier.sweep_expired().await;
                        if removed > 0 {
                            info!("Swept {} expired durable records", removed);
                        }
                    }
                }
            }
        });

        Self { cancel, handle }
    }

    /// Stop the sweeper and wait for it to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Durable sweeper task failed: {}", e);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
