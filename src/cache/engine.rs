//! Cache Engine - Unified Multi-Tier Cache
//!
//! Orchestrates the bounded memory tier, the durable tier and the remote tier
//! behind one read/write contract.
//!
//! # Read path
//!
//! ```text
//!  get_or_fetch(key)
//!      │
//!      ├─ bypass_cache / force_refresh ──▶ fetch (single-flight) ──▶ store
//!      │
//!      ├─ memory ──▶ durable ──▶ remote      first valid hit wins,
//!      │                                      slower hits promoted upward
//!      │
//!      ├─ stale hit (stale_while_revalidate) ──▶ background revalidate
//!      ├─ fresh hit past prefetch_threshold   ──▶ background prefetch
//!      │
//!      └─ miss ──▶ fetch (single-flight) ──▶ store in every tier
//! ```
//!
//! Tier failures never reach the caller. Only fetch errors and decoding a
//! value into the caller's type do.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use dashmap::DashSet;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::clock::{SharedClock, SystemClock};
use super::durable::{DurableLocalTier, DurableStats, DurableSweeper};
use super::entry::{CacheEntry, Metadata};
use super::health::{HealthCheckResult, HealthReport};
use super::key::KeyCodec;
use super::memory::{BoundedLocalTier, MemoryConfig, MemoryStats};
use super::metrics::{EngineMetrics, EngineMetricsSnapshot, LatencyTracker};
use super::remote::{ConnectionState, RemoteStats, RemoteStore, RemoteTier, RestKvStore};
use super::single_flight::{FlightResult, SingleFlight};
use super::store::PersistentStore;
use super::Tier;
use crate::config::CacheConfig;
use crate::error::{Error, Result, SharedError};

// =============================================================================
// Options
// =============================================================================

/// Per-call options for reads and writes
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Entry lifetime; the configured memory TTL when unset
    pub ttl: Option<Duration>,
    /// Labels for group invalidation
    pub tags: Vec<String>,
    /// Skip every tier read and fetch
    pub bypass_cache: bool,
    /// Fetch and overwrite even if a valid entry exists
    pub force_refresh: bool,
    /// Stored with the entry, never interpreted
    pub metadata: Metadata,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    fn skips_reads(&self) -> bool {
        self.bypass_cache || self.force_refresh
    }
}

/// Lookup result
#[derive(Debug, Clone)]
struct Hit {
    entry: CacheEntry,
    tier: Tier,
}

#[derive(Debug, Clone, Copy)]
enum Refresh {
    Revalidate,
    Prefetch,
}

impl std::fmt::Display for Refresh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Refresh::Revalidate => write!(f, "revalidate"),
            Refresh::Prefetch => write!(f, "prefetch"),
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`CacheEngine`]
pub struct CacheEngineBuilder {
    config: CacheConfig,
    clock: Option<SharedClock>,
    durable_store: Option<Arc<dyn PersistentStore>>,
    remote_store: Option<Arc<dyn RemoteStore>>,
}

impl CacheEngineBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            clock: None,
            durable_store: None,
            remote_store: None,
        }
    }

    /// Time source for entry timestamps (system clock by default)
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Persistent surface for the durable tier. Without one the engine runs
    /// without a durable tier.
    pub fn durable_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.durable_store = Some(store);
        self
    }

    /// Remote backend. Without one, a REST backend is built from the remote
    /// endpoint settings if they are present.
    pub fn remote_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.remote_store = Some(store);
        self
    }

    pub fn build(self) -> Result<CacheEngine> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let memory = BoundedLocalTier::with_config(MemoryConfig {
            max_entries: config.memory_size,
        });

        let durable = match (config.persistence_enabled, self.durable_store) {
            (true, Some(store)) => Some(Arc::new(DurableLocalTier::new(
                store,
                &config.namespace,
                clock.clone(),
            ))),
            (true, None) => {
                info!("No persistent store supplied, running without durable tier");
                None
            }
            (false, _) => None,
        };

        let remote_store: Option<Arc<dyn RemoteStore>> = if !config.use_remote_cache {
            None
        } else if let Some(store) = self.remote_store {
            Some(store)
        } else if let Some((url, token)) = config.remote.endpoint() {
            let store = RestKvStore::new(url, token, config.remote.connect_timeout())?;
            Some(Arc::new(store))
        } else {
            info!("Remote endpoint not configured, running without remote tier");
            None
        };
        let remote = remote_store
            .map(|store| RemoteTier::new(store, &config.remote, &config.namespace, clock.clone()));

        info!(
            memory_size = config.memory_size,
            durable = durable.is_some(),
            remote = remote.is_some(),
            stale_while_revalidate = config.stale_while_revalidate,
            "Cache engine created"
        );

        Ok(CacheEngine {
            inner: Arc::new(EngineInner {
                config,
                clock,
                memory,
                durable,
                remote,
                flights: SingleFlight::new(),
                refreshing: DashSet::new(),
                sweeper: Mutex::new(None),
                metrics: EngineMetrics::new(),
                started: Instant::now(),
            }),
        })
    }
}

// =============================================================================
// Engine
// =============================================================================

struct EngineInner {
    config: CacheConfig,
    clock: SharedClock,
    memory: BoundedLocalTier,
    durable: Option<Arc<DurableLocalTier>>,
    remote: Option<RemoteTier>,
    /// Normalized key -> running fetch
    flights: SingleFlight<Value>,
    /// Keys with a background refresh scheduled
    refreshing: DashSet<String>,
    sweeper: Mutex<Option<DurableSweeper>>,
    metrics: EngineMetrics,
    started: Instant,
}

/// Multi-tier cache engine. Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine").finish_non_exhaustive()
    }
}

impl CacheEngine {
    pub fn builder(config: CacheConfig) -> CacheEngineBuilder {
        CacheEngineBuilder::new(config)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Start background maintenance (the durable sweep)
    pub fn start(&self) {
        let Some(durable) = &self.inner.durable else {
            return;
        };
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(DurableSweeper::start(
                durable.clone(),
                self.inner.config.sweep_interval(),
            ));
            info!(interval = ?self.inner.config.sweep_interval(), "Durable sweeper started");
        }
    }

    /// Stop background maintenance and disconnect the remote tier
    pub async fn shutdown(&self) {
        let sweeper = self.inner.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }
        if let Some(remote) = &self.inner.remote {
            remote.shutdown();
        }
        info!("Cache engine shut down");
    }

    /// Read a cached value without fetching
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_with(key, &CacheOptions::default()).await
    }

    /// Read a cached value without fetching, honoring `opts`.
    ///
    /// With `bypass_cache` or `force_refresh` there is nothing to return.
    #[instrument(skip(self, opts))]
    pub async fn get_with<T: DeserializeOwned>(
        &self,
        key: &str,
        opts: &CacheOptions,
    ) -> Result<Option<T>> {
        let key = KeyCodec::normalize(key);
        if opts.skips_reads() {
            return Ok(None);
        }

        match self.inner.lookup(&key).await {
            Some(hit) => {
                if hit.entry.is_expired(self.inner.clock.now_ms()) {
                    self.inner.metrics.record_stale_served();
                }
                hit.entry
                    .decode()
                    .map(Some)
                    .map_err(|e| serialization_error(&key, e))
            }
            None => {
                self.inner.metrics.record_miss();
                Ok(None)
            }
        }
    }

    /// Read a value, fetching and caching it on a miss.
    ///
    /// Concurrent calls for the same key share one `fetch`; its error is
    /// returned to every one of them and nothing is cached.
    #[instrument(skip(self, opts, fetch))]
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, opts: CacheOptions, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let key = KeyCodec::normalize(key);

        if opts.skips_reads() {
            debug!(key = %key, "Skipping tier reads");
            return self.fetch_shared(key, opts, fetch).await;
        }

        let Some(hit) = self.inner.lookup(&key).await else {
            self.inner.metrics.record_miss();
            return self.fetch_shared(key, opts, fetch).await;
        };

        let now = self.inner.clock.now_ms();
        debug!(key = %key, tier = %hit.tier, "Serving cached value");
        if hit.entry.is_expired(now) {
            self.inner.metrics.record_stale_served();
            self.inner
                .schedule_refresh(key.clone(), opts, fetch, Refresh::Revalidate);
        } else if hit.entry.elapsed_fraction(now) >= self.inner.config.prefetch_threshold {
            self.inner
                .schedule_refresh(key.clone(), opts, fetch, Refresh::Prefetch);
        }

        hit.entry.decode().map_err(|e| serialization_error(&key, e))
    }

    async fn fetch_shared<T, F, Fut>(&self, key: String, opts: CacheOptions, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let flight_key = key.clone();
        let (result, joined) = self
            .inner
            .flights
            .run(&key, move || inner.fetch_and_store(flight_key, opts, fetch))
            .await;

        if joined {
            self.inner.metrics.record_coalesced();
            debug!(key = %key, "Joined in-flight fetch");
        }

        let value = result.map_err(|source| Error::Fetch {
            key: key.clone(),
            source,
        })?;
        serde_json::from_value(value).map_err(|e| serialization_error(&key, e))
    }

    /// Write a value to every tier
    #[instrument(skip(self, value, opts))]
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, opts: CacheOptions) -> Result<()> {
        let key = KeyCodec::normalize(key);
        let value = serde_json::to_value(value).map_err(|e| serialization_error(&key, e))?;

        self.inner.store(&key, value, &opts).await;
        Ok(())
    }

    /// Remove a key from every tier
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) {
        let key = KeyCodec::normalize(key);
        self.inner.metrics.record_delete();

        self.inner.memory.delete(&key);
        if let Some(durable) = &self.inner.durable {
            durable.delete(&key).await;
        }
        if let Some(remote) = &self.inner.remote {
            if !remote.delete(&key).await {
                debug!(key = %key, "Remote delete not applied");
            }
        }
    }

    /// Remove every entry carrying `tag` from every tier
    #[instrument(skip(self))]
    pub async fn delete_by_tag(&self, tag: &str) -> TagInvalidation {
        let tag = KeyCodec::normalize(tag);
        self.inner.metrics.record_tag_invalidation();

        let memory = self.inner.memory.delete_by_tag(&tag).len();
        let durable = match &self.inner.durable {
            Some(durable) => durable.delete_by_tag(&tag).await,
            None => 0,
        };
        let remote = match &self.inner.remote {
            Some(remote) => remote.delete_by_tag(&tag).await,
            None => false,
        };

        info!(tag = %tag, memory, durable, remote, "Tag invalidated");
        TagInvalidation {
            tag,
            memory,
            durable,
            remote,
        }
    }

    /// Empty every tier
    #[instrument(skip(self))]
    pub async fn clear(&self) {
        self.inner.memory.clear();
        if let Some(durable) = &self.inner.durable {
            durable.clear().await;
        }
        if let Some(remote) = &self.inner.remote {
            if !remote.clear().await {
                warn!("Remote clear not applied");
            }
        }
        info!("Cache cleared");
    }

    /// Whether any tier holds a live entry for `key`. Never fetches or
    /// promotes.
    pub async fn has(&self, key: &str) -> bool {
        let key = KeyCodec::normalize(key);
        let now = self.inner.clock.now_ms();

        if self
            .inner
            .memory
            .peek(&key)
            .is_some_and(|entry| !entry.is_expired(now))
        {
            return true;
        }
        if let Some(durable) = &self.inner.durable {
            if durable.peek(&key).await.is_some() {
                return true;
            }
        }
        match &self.inner.remote {
            Some(remote) => remote
                .get(&key)
                .await
                .is_some_and(|entry| !entry.is_expired(now)),
            None => false,
        }
    }

    /// Run one durable sweep now. Returns the number of records removed.
    pub async fn sweep(&self) -> usize {
        match &self.inner.durable {
            Some(durable) => durable.sweep_expired().await,
            None => 0,
        }
    }

    /// Engine and tier statistics
    pub async fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        let durable = match &inner.durable {
            Some(durable) => Some(durable.stats().await),
            None => None,
        };
        CacheStats {
            engine: inner.metrics.snapshot(),
            memory: inner.memory.stats(),
            durable,
            remote: inner
                .remote
                .as_ref()
                .map(|remote| remote.stats())
                .unwrap_or_else(RemoteStats::disabled),
            in_flight: inner.flights.len(),
            refreshing: inner.refreshing.len(),
        }
    }

    /// Per-tier health. Tries to connect the remote tier if it has never connected.
    pub async fn health(&self) -> HealthReport {
        let inner = &self.inner;
        let mut checks = Vec::with_capacity(3);

        if inner.memory.capacity() == 0 {
            checks.push(HealthCheckResult::degraded("memory", "capacity is zero"));
        } else {
            checks.push(HealthCheckResult::healthy("memory"));
        }

        match &inner.durable {
            Some(_) => checks.push(HealthCheckResult::healthy("durable")),
            None if inner.config.persistence_enabled => checks.push(HealthCheckResult::degraded(
                "durable",
                "no persistent store available",
            )),
            None => {}
        }

        match &inner.remote {
            Some(remote) => {
                if remote.state() == ConnectionState::Disconnected && !remote.reconnect_pending() {
                    remote.connect().await;
                }
                let state = remote.state();
                if state == ConnectionState::Connected {
                    checks.push(HealthCheckResult::healthy("remote"));
                } else {
                    checks.push(HealthCheckResult::degraded("remote", state.to_string()));
                }
            }
            None if inner.config.use_remote_cache => checks.push(HealthCheckResult::degraded(
                "remote",
                "remote endpoint not configured",
            )),
            None => {}
        }

        HealthReport::new(checks, inner.started.elapsed())
    }
}

impl EngineInner {
    /// Walk the tiers fastest first, promoting slower hits
    async fn lookup(&self, key: &str) -> Option<Hit> {
        let allow_stale = self.config.stale_while_revalidate;
        let now = self.clock.now_ms();

        if let Some(entry) = self.memory.get(key, now, allow_stale) {
            self.metrics.record_hit(Tier::Memory);
            debug!(key = %key, tier = %Tier::Memory, "Cache hit");
            return Some(Hit {
                entry,
                tier: Tier::Memory,
            });
        }

        if let Some(durable) = &self.durable {
            if let Some(entry) = durable.get(key, allow_stale).await {
                self.metrics.record_hit(Tier::Durable);
                debug!(key = %key, tier = %Tier::Durable, "Cache hit");
                self.promote(key, &entry, Tier::Durable).await;
                return Some(Hit {
                    entry,
                    tier: Tier::Durable,
                });
            }
        }

        if let Some(remote) = &self.remote {
            if let Some(entry) = remote.get(key).await {
                if entry.is_expired(self.clock.now_ms()) && !allow_stale {
                    debug!(key = %key, "Ignoring expired remote entry");
                    return None;
                }
                self.metrics.record_hit(Tier::Remote);
                debug!(key = %key, tier = %Tier::Remote, "Cache hit");
                self.promote(key, &entry, Tier::Remote).await;
                return Some(Hit {
                    entry,
                    tier: Tier::Remote,
                });
            }
        }

        debug!(key = %key, "Cache miss");
        None
    }

    /// Copy an entry found in `from` into every faster tier
    async fn promote(&self, key: &str, entry: &CacheEntry, from: Tier) {
        if from == Tier::Remote {
            if let Some(durable) = &self.durable {
                durable.set(key, &self.durable_copy(entry)).await;
                self.metrics.record_promotion();
            }
        }
        self.memory.set(key, entry.clone());
        self.metrics.record_promotion();
        debug!(key = %key, from = %from, "Promoted entry");
    }

    /// Durable records never outlive the durable TTL
    fn durable_copy(&self, entry: &CacheEntry) -> CacheEntry {
        let cap = entry
            .created_at
            .saturating_add(self.config.durable_ttl_ms);
        let mut copy = entry.clone();
        copy.expires_at = copy.expires_at.min(cap);
        copy
    }

    fn build_entry(&self, value: Value, opts: &CacheOptions) -> CacheEntry {
        let ttl = opts.ttl.unwrap_or_else(|| self.config.memory_ttl());
        CacheEntry::new(value, self.clock.now_ms(), ttl)
            .with_tags(opts.tags.iter().map(|tag| KeyCodec::normalize(tag)))
            .with_metadata(opts.metadata.clone())
    }

    /// Write to every tier, fastest first. Durable and remote failures are
    /// only logged.
    async fn store(&self, key: &str, value: Value, opts: &CacheOptions) {
        let entry = self.build_entry(value, opts);
        self.metrics.record_set();

        self.memory.set(key, entry.clone());
        if let Some(durable) = &self.durable {
            durable.set(key, &self.durable_copy(&entry)).await;
        }
        if let Some(remote) = &self.remote {
            if !remote.set(key, &entry).await {
                debug!(key = %key, "Remote write not applied");
            }
        }
    }

    /// Body of a single-flight fetch: call the fetch function, then store
    async fn fetch_and_store<T, F, Fut>(
        self: Arc<Self>,
        key: String,
        opts: CacheOptions,
        fetch: F,
    ) -> FlightResult<Value>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let tracker = LatencyTracker::start();
        let fetched = fetch().await;
        self.metrics.record_fetch(tracker.elapsed(), fetched.is_ok());

        let value = fetched
            .and_then(|value| {
                serde_json::to_value(value).context("fetched value is not serializable")
            })
            .map_err(|e| {
                warn!(key = %key, "Fetch failed: {:#}", e);
                SharedError::new(e)
            })?;

        self.store(&key, value.clone(), &opts).await;
        Ok(value)
    }

    /// Schedule a deduplicated background refresh. Skipped when a fetch or a
    /// refresh for the key is already running.
    fn schedule_refresh<T, F, Fut>(self: &Arc<Self>, key: String, opts: CacheOptions, fetch: F, kind: Refresh)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if self.flights.in_flight(&key) {
            debug!(key = %key, kind = %kind, "Fetch already in flight, skipping refresh");
            return;
        }
        if !self.refreshing.insert(key.clone()) {
            debug!(key = %key, kind = %kind, "Refresh already scheduled");
            return;
        }

        match kind {
            Refresh::Revalidate => self.metrics.record_revalidation(),
            Refresh::Prefetch => self.metrics.record_prefetch(),
        }
        debug!(key = %key, kind = %kind, "Scheduling background refresh");

        let worker = Arc::clone(self);
        let flight_key = key.clone();
        let (flight, _) = self
            .flights
            .begin(&key, move || worker.fetch_and_store(flight_key, opts, fetch));

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = flight.await {
                inner.metrics.record_background_failure();
                warn!(key = %key, kind = %kind, "Background refresh failed, keeping cached value: {}", e);
            }
            inner.refreshing.remove(&key);
        });
    }
}

fn serialization_error(key: &str, err: serde_json::Error) -> Error {
    Error::Serialization {
        key: key.to_string(),
        reason: err.to_string(),
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Result of a tag invalidation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagInvalidation {
    /// Normalized tag
    pub tag: String,
    /// Entries removed from the memory tier
    pub memory: usize,
    /// Records removed from the durable tier
    pub durable: usize,
    /// Remote invalidation applied
    pub remote: bool,
}

/// Engine and tier statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub engine: EngineMetricsSnapshot,
    pub memory: MemoryStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable: Option<DurableStats>,
    pub remote: RemoteStats,
    /// Fetches currently running
    pub in_flight: usize,
    /// Background refreshes currently scheduled
    pub refreshing: usize,
}

// =============================================================================
// Tests
// =============================================================================
