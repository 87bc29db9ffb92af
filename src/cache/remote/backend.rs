//! Remote key-value store backends
//!
//! The remote tier talks to a [`RemoteStore`]: a small command surface
//! (strings with expiry plus sets) that any shared key-value service offers.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::cache::clock::SharedClock;
use crate::error::RemoteError;

/// Shared key-value service
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Connectivity check
    async fn ping(&self) -> Result<(), RemoteError>;

    /// Read a string value
    async fn get(&self, key: &str) -> Result<Option<String>, RemoteError>;

    /// Write a string value with an expiry in seconds
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), RemoteError>;

    /// Delete keys, returning how many existed
    async fn del(&self, keys: &[String]) -> Result<u64, RemoteError>;

    /// Add members to a set
    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), RemoteError>;

    /// Read every member of a set
    async fn smembers(&self, key: &str) -> Result<Vec<String>, RemoteError>;

    /// Raise the expiry of an existing key to at least `ttl_secs` from now.
    /// A key without an expiry gets one; a later expiry is never shortened.
    async fn expire_gt(&self, key: &str, ttl_secs: u64) -> Result<(), RemoteError>;

    /// List keys starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, RemoteError>;

    /// Backend name for logs and stats
    fn name(&self) -> &'static str;
}

// =============================================================================
// In-Memory Backend
// =============================================================================

#[derive(Debug, Clone)]
enum Stored {
    Str(String),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Stored,
    expires_at: Option<u64>,
}

/// In-process stand-in for a shared key-value service.
///
/// Honors expiry through the injected clock and can be made unreachable or
/// slow to exercise the remote tier's failure handling.
pub struct InMemoryRemoteStore {
    data: DashMap<String, Slot>,
    clock: SharedClock,
    reachable: AtomicBool,
    latency: RwLock<Duration>,
    pings: AtomicU64,
}

impl InMemoryRemoteStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            data: DashMap::new(),
            clock,
            reachable: AtomicBool::new(true),
            latency: RwLock::new(Duration::ZERO),
            pings: AtomicU64::new(0),
        }
    }

    /// Simulate an outage (false) or recovery (true)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay every command by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Number of ping calls observed
    pub fn ping_count(&self) -> u64 {
        self.pings.load(Ordering::Relaxed)
    }

    /// Live (non-expired) key count
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.data.iter().filter(|e| live(e.value(), now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining TTL of a key in milliseconds, if it has one
    pub fn ttl_ms(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_ms();
        self.data
            .get(key)
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_sub(now))
    }

    async fn enter(&self) -> Result<u64, RemoteError> {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Connection("connection refused".into()));
        }
        Ok(self.clock.now_ms())
    }

    fn live_slot(&self, key: &str, now: u64) -> Option<Slot> {
        let slot = self.data.get(key)?.clone();
        if live(&slot, now) {
            Some(slot)
        } else {
            self.data.remove(key);
            None
        }
    }
}

fn live(slot: &Slot, now: u64) -> bool {
    slot.expires_at.map(|at| now < at).unwrap_or(true)
}

fn wrong_type(key: &str) -> RemoteError {
    RemoteError::Protocol(format!("WRONGTYPE operation against key {}", key))
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn ping(&self) -> Result<(), RemoteError> {
        self.pings.fetch_add(1, Ordering::Relaxed);
        self.enter().await.map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RemoteError> {
        let now = self.enter().await?;
        match self.live_slot(key, now) {
            Some(Slot {
                value: Stored::Str(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), RemoteError> {
        let now = self.enter().await?;
        self.data.insert(
            key.to_string(),
            Slot {
                value: Stored::Str(value.to_string()),
                expires_at: Some(now + ttl_secs * 1_000),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, RemoteError> {
        let now = self.enter().await?;
        let mut removed = 0;
        for key in keys {
            if let Some((_, slot)) = self.data.remove(key) {
                if live(&slot, now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), RemoteError> {
        let now = self.enter().await?;
        let mut slot = self.live_slot(key, now).unwrap_or(Slot {
            value: Stored::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Stored::Set(set) => set.extend(members.iter().cloned()),
            Stored::Str(_) => return Err(wrong_type(key)),
        }
        self.data.insert(key.to_string(), slot);
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, RemoteError> {
        let now = self.enter().await?;
        match self.live_slot(key, now) {
            Some(Slot {
                value: Stored::Set(set),
                ..
            }) => Ok(set.into_iter().collect()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn expire_gt(&self, key: &str, ttl_secs: u64) -> Result<(), RemoteError> {
        let now = self.enter().await?;
        let wanted = now + ttl_secs * 1_000;
        if let Some(mut slot) = self.data.get_mut(key) {
            slot.expires_at = Some(slot.expires_at.map_or(wanted, |at| at.max(wanted)));
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let now = self.enter().await?;
        Ok(self
            .data
            .iter()
            .filter(|e| e.key().starts_with(prefix) && live(e.value(), now))
            .map(|e| e.key().clone())
            .collect())
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use std::sync::Arc;

    fn store() -> (Arc<ManualClock>, InMemoryRemoteStore) {
        let clock = Arc::new(ManualClock::new(0));
        (clock.clone(), InMemoryRemoteStore::new(clock))
    }

    #[tokio::test]
    async fn test_strings_expire() {
        let (clock, store) = store();
        store.set_ex("k", "v", 2).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.ttl_ms("k"), Some(2_000));

        clock.advance(Duration::from_secs(2));
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sets() {
        let (_clock, store) = store();
        store.sadd("s", &["a".into(), "b".into()]).await.unwrap();
        store.sadd("s", &["b".into(), "c".into()]).await.unwrap();
        assert_eq!(store.smembers("s").await.unwrap(), vec!["a", "b", "c"]);
        assert!(store.smembers("missing").await.unwrap().is_empty());

        store.set_ex("str", "v", 10).await.unwrap();
        assert!(matches!(
            store.smembers("str").await,
            Err(RemoteError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_del_and_scan() {
        let (_clock, store) = store();
        store.set_ex("ns:a", "1", 10).await.unwrap();
        store.set_ex("ns:b", "2", 10).await.unwrap();
        store.set_ex("other:c", "3", 10).await.unwrap();

        let mut keys = store.scan_prefix("ns:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["ns:a", "ns:b"]);

        assert_eq!(store.del(&keys).await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_expire_gt_never_shortens() {
        let (clock, store) = store();
        store.sadd("s", &["a".into()]).await.unwrap();
        assert_eq!(store.ttl_ms("s"), None);

        store.expire_gt("s", 60).await.unwrap();
        assert_eq!(store.ttl_ms("s"), Some(60_000));

        store.expire_gt("s", 5).await.unwrap();
        assert_eq!(store.ttl_ms("s"), Some(60_000));

        clock.advance(Duration::from_secs(10));
        store.expire_gt("s", 120).await.unwrap();
        assert_eq!(store.ttl_ms("s"), Some(120_000));

        store.expire_gt("missing", 10).await.unwrap();
        assert!(store.smembers("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable() {
        let (_clock, store) = store();
        store.set_reachable(false);
        assert!(matches!(store.ping().await, Err(RemoteError::Connection(_))));
        assert!(store.get("k").await.unwrap_err().is_connection());

        store.set_reachable(true);
        assert!(store.ping().await.is_ok());
        assert_eq!(store.ping_count(), 2);
    }
}
