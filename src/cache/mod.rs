//! Multi-Tier Cache
//!
//! A bounded memory tier, a durable on-device tier and a shared remote tier
//! behind one engine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          Cache Engine                                     │
//! │           single-flight fetches · prefetch · stale-while-revalidate      │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Memory (LRU)         │ Durable              │ Remote                     │
//! │  ┌────────────────┐   │ ┌────────────────┐   │ ┌────────────────────┐     │
//! │  │ entry-count    │   │ │ PersistentStore│   │ │ RemoteStore        │     │
//! │  │ bound, TTL     │   │ │ + sweeper      │   │ │ deadlines, backoff │     │
//! │  └────────────────┘   │ └────────────────┘   │ └────────────────────┘     │
//! │         ▲             │         ▲            │           │                │
//! │         └─────────────┴─────────┴── promotion ┴───────────┘                │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Keys are normalized by [`KeyCodec`] before they reach any tier.

mod clock;
mod durable;
mod engine;
mod entry;
mod health;
mod key;
mod memory;
mod metrics;
pub mod remote;
mod single_flight;
pub mod store;

use std::time::Duration;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use durable::{DurableLocalTier, DurableStats, DurableSweeper};
pub use engine::{CacheEngine, CacheEngineBuilder, CacheOptions, CacheStats, TagInvalidation};
pub use entry::{CacheEntry, DurableRecord, Metadata};
pub use health::{HealthCheckResult, HealthReport, HealthStatus};
pub use key::KeyCodec;
pub use memory::{BoundedLocalTier, MemoryConfig, MemoryStats};
pub use metrics::{EngineMetrics, EngineMetricsSnapshot};
pub use remote::{ConnectionState, RemoteStats, RemoteTier};
pub use single_flight::SingleFlight;
pub use store::{FileStore, InMemoryStore, PersistentStore};

/// Default memory tier capacity (entries)
pub const DEFAULT_MEMORY_SIZE: usize = 500;

/// Default entry lifetime
pub const DEFAULT_MEMORY_TTL: Duration = Duration::from_secs(5 * 60);

/// Default upper bound on durable record lifetime
pub const DEFAULT_DURABLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default durable sweep period
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default prefetch threshold (fraction of lifetime)
pub const DEFAULT_PREFETCH_THRESHOLD: f64 = 0.8;

/// Default physical key prefix
pub const DEFAULT_NAMESPACE: &str = "cache:";

/// Cache tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// In-process LRU
    Memory,
    /// On-device persistence
    Durable,
    /// Shared networked store
    Remote,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Memory => write!(f, "memory"),
            Tier::Durable => write!(f, "durable"),
            Tier::Remote => write!(f, "remote"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert!(DEFAULT_MEMORY_TTL < DEFAULT_DURABLE_TTL);
        assert!((0.0..=1.0).contains(&DEFAULT_PREFETCH_THRESHOLD));
        assert!(DEFAULT_NAMESPACE.ends_with(':'));
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(Tier::Memory.to_string(), "memory");
        assert_eq!(Tier::Remote.to_string(), "remote");
    }
}
