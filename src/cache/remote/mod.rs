//! Remote Tier - shared networked cache
//!
//! Lets several application instances observe the same cache. Every failure
//! here degrades to a sentinel (`None` / `false`) so the engine can fall back
//! to the local tiers.
//!
//! # Connection state machine
//!
//! ```text
//!              connect() ok
//!  Disconnected ───────────▶ Connected
//!     ▲   │                      │
//!     │   │ connect() fails      │ connection-class error
//!     │   ▼                      ▼
//!     │  Backoff timer ◀─────────┘
//!     │   │ base * 2^attempt (capped), max_retries
//!     └───┘ retries exhausted: wait for next explicit call
//!
//!  disconnect() ──▶ Closed (no automatic reconnects until connect())
//! ```
//!
//! Concurrent `connect()` calls share one in-flight attempt.

mod backend;
mod backoff;
mod rest;

pub use backend::{InMemoryRemoteStore, RemoteStore};
pub use backoff::Backoff;
pub use rest::RestKvStore;

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::SharedClock;
use super::entry::CacheEntry;
use super::key::KeyCodec;
use crate::config::RemoteConfig;
use crate::error::RemoteError;

/// Keys deleted per DEL command during `clear`
const DELETE_BATCH: usize = 100;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Explicitly disconnected; no automatic reconnects
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

struct ReconnectTimer {
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn RemoteStore>,
    codec: KeyCodec,
    clock: SharedClock,
    connect_timeout: Duration,
    op_timeout: Duration,
    backoff: Backoff,
    state: Mutex<ConnectionState>,
    connecting: Mutex<Option<Shared<BoxFuture<'static, bool>>>>,
    reconnect: Mutex<Option<ReconnectTimer>>,
    attempts: AtomicU32,
    hits: AtomicU64,
    misses: AtomicU64,
    operations: AtomicU64,
    errors: AtomicU64,
    reconnects_scheduled: AtomicU64,
    started: Instant,
}

/// Client for the shared key-value service
#[derive(Clone)]
pub struct RemoteTier {
    inner: Arc<Inner>,
}

impl RemoteTier {
    /// Create a tier over `store`. No connection is made until first use.
    pub fn new(
        store: Arc<dyn RemoteStore>,
        config: &RemoteConfig,
        namespace: &str,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                codec: KeyCodec::new(namespace),
                clock,
                connect_timeout: config.connect_timeout(),
                op_timeout: config.op_timeout(),
                backoff: config.backoff(),
                state: Mutex::new(ConnectionState::Disconnected),
                connecting: Mutex::new(None),
                reconnect: Mutex::new(None),
                attempts: AtomicU32::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                operations: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                reconnects_scheduled: AtomicU64::new(0),
                started: Instant::now(),
            }),
        }
    }

    /// Connect explicitly. Resets the retry budget and cancels any pending
    /// reconnect timer.
    pub async fn connect(&self) -> bool {
        self.inner.cancel_reconnect();
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Closed {
                *state = ConnectionState::Disconnected;
            }
        }
        self.inner.attempts.store(0, Ordering::Relaxed);
        self.inner.connect_shared().await
    }

    /// Force the disconnected state; no reconnects until [`RemoteTier::connect`]
    pub fn disconnect(&self) {
        self.inner.cancel_reconnect();
        *self.inner.state.lock() = ConnectionState::Closed;
        info!(backend = self.inner.store.name(), "Remote tier disconnected");
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// True while a backoff timer is waiting to reconnect
    pub fn reconnect_pending(&self) -> bool {
        self.inner.reconnect.lock().is_some()
    }

    /// Read an entry
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let physical = self.inner.codec.namespaced(key);
        let result = self
            .inner
            .run("get", || self.inner.store.get(&physical))
            .await;

        let text = match result {
            Ok(Some(text)) => text,
            Ok(None) => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Remote get failed: {}", e);
                return None;
            }
        };

        match serde_json::from_str::<CacheEntry>(&text) {
            Ok(entry) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Err(e) => {
                self.inner.errors.fetch_add(1, Ordering::Relaxed);
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, "Discarding undecodable remote entry: {}", e);
                None
            }
        }
    }

    /// Write an entry and index it under its tags. A tag index lives at least
    /// as long as its longest-lived member.
    pub async fn set(&self, key: &str, entry: &CacheEntry) -> bool {
        let ttl_ms = entry.expires_at.saturating_sub(self.inner.clock.now_ms());
        if ttl_ms == 0 {
            debug!(key = %key, "Skipping remote write of already expired entry");
            return false;
        }
        let ttl_secs = ttl_ms.div_ceil(1_000).max(1);

        let text = match serde_json::to_string(entry) {
            Ok(text) => text,
            Err(e) => {
                self.inner.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, "Failed to encode remote entry: {}", e);
                return false;
            }
        };

        let physical = self.inner.codec.namespaced(key);
        if let Err(e) = self
            .inner
            .run("set", || self.inner.store.set_ex(&physical, &text, ttl_secs))
            .await
        {
            debug!(key = %key, "Remote set failed: {}", e);
            return false;
        }

        let members = [physical];
        for tag in &entry.tags {
            let index = self.inner.codec.namespaced_tag(tag);
            let indexed = self
                .inner
                .run("sadd", || self.inner.store.sadd(&index, &members))
                .await;
            let expired = match indexed {
                Ok(()) => {
                    self.inner
                        .run("expire", || self.inner.store.expire_gt(&index, ttl_secs))
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = expired {
                warn!(key = %key, tag = %tag, "Remote tag index update failed: {}", e);
                return false;
            }
        }

        true
    }

    /// Delete an entry
    pub async fn delete(&self, key: &str) -> bool {
        let keys = [self.inner.codec.namespaced(key)];
        match self.inner.run("del", || self.inner.store.del(&keys)).await {
            Ok(_) => true,
            Err(e) => {
                debug!(key = %key, "Remote delete failed: {}", e);
                false
            }
        }
    }

    /// Delete every member of a tag's index, then the index itself
    pub async fn delete_by_tag(&self, tag: &str) -> bool {
        let index = self.inner.codec.namespaced_tag(tag);

        let members = match self
            .inner
            .run("smembers", || self.inner.store.smembers(&index))
            .await
        {
            Ok(members) => members,
            Err(e) => {
                warn!(tag = %tag, "Remote tag lookup failed: {}", e);
                return false;
            }
        };

        if !members.is_empty() {
            if let Err(e) = self.inner.run("del", || self.inner.store.del(&members)).await {
                warn!(tag = %tag, "Remote tag member delete failed: {}", e);
                return false;
            }
        }

        let index_key = [index];
        match self.inner.run("del", || self.inner.store.del(&index_key)).await {
            Ok(_) => {
                debug!(tag = %tag, members = members.len(), "Remote tag invalidated");
                true
            }
            Err(e) => {
                warn!(tag = %tag, "Remote tag index delete failed: {}", e);
                false
            }
        }
    }

    /// Delete every key under the namespace
    pub async fn clear(&self) -> bool {
        let prefix = self.inner.codec.namespace().to_string();
        let keys = match self
            .inner
            .run("scan", || self.inner.store.scan_prefix(&prefix))
            .await
        {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Remote clear scan failed: {}", e);
                return false;
            }
        };

        for batch in keys.chunks(DELETE_BATCH) {
            if let Err(e) = self.inner.run("del", || self.inner.store.del(batch)).await {
                warn!("Remote clear delete failed: {}", e);
                return false;
            }
        }
        true
    }

    /// Stop reconnect timers and close the connection
    pub fn shutdown(&self) {
        self.disconnect();
    }

    /// Local counters; nothing here is read from the service
    pub fn stats(&self) -> RemoteStats {
        let inner = &self.inner;
        let state = self.state();
        RemoteStats {
            enabled: true,
            backend: inner.store.name().to_string(),
            connected: state == ConnectionState::Connected,
            state: Some(state),
            hits: inner.hits.load(Ordering::Relaxed),
            misses: inner.misses.load(Ordering::Relaxed),
            operations: inner.operations.load(Ordering::Relaxed),
            errors: inner.errors.load(Ordering::Relaxed),
            reconnect_attempts: inner.attempts.load(Ordering::Relaxed),
            reconnects_scheduled: inner.reconnects_scheduled.load(Ordering::Relaxed),
            uptime_ms: inner.started.elapsed().as_millis() as u64,
        }
    }
}

impl Inner {
    /// Join the in-flight connection attempt or start one
    fn connect_shared(self: &Arc<Self>) -> Shared<BoxFuture<'static, bool>> {
        let mut slot = self.connecting.lock();
        if let Some(attempt) = slot.as_ref() {
            return attempt.clone();
        }

        let inner = Arc::clone(self);
        let attempt = async move { inner.try_connect().await }.boxed().shared();
        *slot = Some(attempt.clone());
        attempt
    }

    async fn try_connect(self: Arc<Self>) -> bool {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Connecting;
            }
        }

        let outcome = match tokio::time::timeout(self.connect_timeout, self.store.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RemoteError::Connection(format!(
                "connect timed out after {:?}",
                self.connect_timeout
            ))),
        };

        let connected = match outcome {
            Ok(()) => {
                let mut state = self.state.lock();
                if *state == ConnectionState::Closed {
                    drop(state);
                    debug!(
                        backend = self.store.name(),
                        "Connect finished after disconnect, staying closed"
                    );
                    false
                } else {
                    *state = ConnectionState::Connected;
                    drop(state);
                    self.attempts.store(0, Ordering::Relaxed);
                    info!(backend = self.store.name(), "Remote tier connected");
                    true
                }
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(backend = self.store.name(), "Remote connect failed: {}", e);
                {
                    let mut state = self.state.lock();
                    if *state != ConnectionState::Closed {
                        *state = ConnectionState::Disconnected;
                    }
                }
                self.schedule_reconnect();
                false
            }
        };

        self.connecting.lock().take();
        connected
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if *self.state.lock() == ConnectionState::Closed {
            return;
        }

        let mut timer = self.reconnect.lock();
        if timer.is_some() {
            return;
        }

        let attempt = self.attempts.load(Ordering::Relaxed);
        let Some(delay) = self.backoff.delay(attempt) else {
            warn!(
                attempts = attempt,
                "Remote reconnect retries exhausted, waiting for next call"
            );
            return;
        };
        self.attempts.store(attempt + 1, Ordering::Relaxed);
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
        debug!(attempt = attempt + 1, ?delay, "Scheduling remote reconnect");

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    inner.reconnect.lock().take();
                    inner.connect_shared().await;
                }
            }
        });

        *timer = Some(ReconnectTimer {
            cancel,
            _handle: handle,
        });
    }

    fn cancel_reconnect(&self) {
        if let Some(timer) = self.reconnect.lock().take() {
            timer.cancel.cancel();
        }
    }

    /// Make sure a connection exists before an operation.
    ///
    /// Fails fast while a backoff timer is pending or after an explicit
    /// disconnect; otherwise (never connected, or retries exhausted) this is
    /// the "next explicit call" that starts a fresh connection attempt.
    async fn ensure_connected(self: &Arc<Self>) -> Result<(), RemoteError> {
        match *self.state.lock() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closed => return Err(RemoteError::NotConnected),
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }

        if self.reconnect.lock().is_some() {
            return Err(RemoteError::NotConnected);
        }

        let joining = self.connecting.lock().is_some();
        if !joining {
            self.attempts.store(0, Ordering::Relaxed);
        }

        if self.connect_shared().await {
            Ok(())
        } else {
            Err(RemoteError::NotConnected)
        }
    }

    fn mark_disconnected(self: &Arc<Self>, err: &RemoteError) {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Connected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        warn!(backend = self.store.name(), "Remote connection lost: {}", err);
        self.schedule_reconnect();
    }

    /// Run one operation under the operation deadline
    async fn run<T, F, Fut>(self: &Arc<Self>, op: &'static str, f: F) -> Result<T, RemoteError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.ensure_connected().await?;
        self.operations.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(self.op_timeout, f()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                if e.is_connection() {
                    self.mark_disconnected(&e);
                } else {
                    debug!(op, "Remote operation failed: {}", e);
                }
                Err(e)
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                debug!(op, timeout = ?self.op_timeout, "Remote operation timed out");
                Err(RemoteError::Timeout(self.op_timeout))
            }
        }
    }
}

/// Remote tier statistics
#[derive(Debug, Clone, Serialize)]
pub struct RemoteStats {
    pub enabled: bool,
    pub backend: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ConnectionState>,
    pub hits: u64,
    pub misses: u64,
    pub operations: u64,
    pub errors: u64,
    pub reconnect_attempts: u32,
    pub reconnects_scheduled: u64,
    pub uptime_ms: u64,
}

impl RemoteStats {
    /// Stats reported when no remote tier is configured
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            backend: "none".to_string(),
            connected: false,
            state: None,
            hits: 0,
            misses: 0,
            operations: 0,
            errors: 0,
            reconnect_attempts: 0,
            reconnects_scheduled: 0,
            uptime_ms: 0,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
