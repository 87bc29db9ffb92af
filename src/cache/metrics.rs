//! Engine Metrics Collection
//!
//! Counters for the orchestration layer. Per-tier counters live in the tiers
//! themselves and are merged into [`super::engine::CacheStats`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::Tier;

/// Engine metrics collector
#[derive(Debug, Default)]
pub struct EngineMetrics {
    // Lookups
    memory_hits: AtomicU64,
    durable_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,

    // Fetches
    fetches: AtomicU64,
    fetch_errors: AtomicU64,
    coalesced: AtomicU64,
    revalidations: AtomicU64,
    prefetches: AtomicU64,
    background_failures: AtomicU64,

    // Movement and writes
    promotions: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    tag_invalidations: AtomicU64,

    // Fetch latency (microseconds, exponential moving average)
    fetch_latency_us: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, tier: Tier) {
        let counter = match tier {
            Tier::Memory => &self.memory_hits,
            Tier::Durable => &self.durable_hits,
            Tier::Remote => &self.remote_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch(&self, latency: Duration, ok: bool) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.fetch_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.update_latency_ema(&self.fetch_latency_us, latency);
    }

    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_revalidation(&self) {
        self.revalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch(&self) {
        self.prefetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_background_failure(&self) {
        self.background_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tag_invalidation(&self) {
        self.tag_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.memory_hits.load(Ordering::Relaxed)
            + self.durable_hits.load(Ordering::Relaxed)
            + self.remote_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hits over lookups; a lookup that found nothing in any tier is a miss
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            durable_hits: self.durable_hits.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            revalidations: self.revalidations.load(Ordering::Relaxed),
            prefetches: self.prefetches.load(Ordering::Relaxed),
            background_failures: self.background_failures.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            tag_invalidations: self.tag_invalidations.load(Ordering::Relaxed),
            fetch_latency_us: self.fetch_latency_us.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.memory_hits,
            &self.durable_hits,
            &self.remote_hits,
            &self.misses,
            &self.stale_served,
            &self.fetches,
            &self.fetch_errors,
            &self.coalesced,
            &self.revalidations,
            &self.prefetches,
            &self.background_failures,
            &self.promotions,
            &self.sets,
            &self.deletes,
            &self.tag_invalidations,
            &self.fetch_latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of the engine counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineMetricsSnapshot {
    pub memory_hits: u64,
    pub durable_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub stale_served: u64,
    pub fetches: u64,
    pub fetch_errors: u64,
    pub coalesced: u64,
    pub revalidations: u64,
    pub prefetches: u64,
    pub background_failures: u64,
    pub promotions: u64,
    pub sets: u64,
    pub deletes: u64,
    pub tag_invalidations: u64,
    pub fetch_latency_us: u64,
}

/// Latency tracker for measuring operation duration
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let metrics = EngineMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);

        metrics.record_hit(Tier::Memory);
        metrics.record_hit(Tier::Durable);
        metrics.record_hit(Tier::Remote);
        metrics.record_miss();

        assert_eq!(metrics.hits(), 3);
        assert!((metrics.hit_ratio() - 0.75).abs() < f64::EPSILON);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.memory_hits, 1);
        assert_eq!(snapshot.durable_hits, 1);
        assert_eq!(snapshot.remote_hits, 1);
    }

    #[test]
    fn test_fetch_latency_ema() {
        let metrics = EngineMetrics::new();
        metrics.record_fetch(Duration::from_micros(1_000), true);
        assert_eq!(metrics.snapshot().fetch_latency_us, 1_000);

        metrics.record_fetch(Duration::from_micros(2_000), false);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fetch_latency_us, 1_100);
        assert_eq!(snapshot.fetches, 2);
        assert_eq!(snapshot.fetch_errors, 1);
    }

    #[test]
    fn test_reset() {
        let metrics = EngineMetrics::new();
        metrics.record_promotion();
        metrics.record_coalesced();
        metrics.record_set();
        metrics.reset();
        assert_eq!(metrics.snapshot(), EngineMetricsSnapshot::default());
    }
}
