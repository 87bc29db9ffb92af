//! Cache Entry Types
//!
//! Entries are immutable once written. A logical update builds a new entry
//! and replaces the old one in every tier.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form metadata attached to an entry. The engine never inspects it.
pub type Metadata = BTreeMap<String, Value>;

/// A cached value with its lifetime and labels.
///
/// This is also the wire format of the remote tier (JSON, camelCase).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T = Value> {
    pub value: T,
    /// Creation time (epoch ms)
    pub created_at: u64,
    /// Expiry time (epoch ms)
    pub expires_at: u64,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
}

impl<T> CacheEntry<T> {
    /// Create an entry that lives for `ttl` from `now_ms`
    pub fn new(value: T, now_ms: u64, ttl: Duration) -> Self {
        Self {
            value,
            created_at: now_ms,
            expires_at: now_ms.saturating_add(ttl.as_millis() as u64),
            tags: BTreeSet::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Past `expires_at`
    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    /// Total lifetime in milliseconds
    #[inline]
    pub fn lifetime_ms(&self) -> u64 {
        self.expires_at.saturating_sub(self.created_at)
    }

    /// Time left before expiry (zero once expired)
    #[inline]
    pub fn remaining(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now_ms))
    }

    /// Fraction of the lifetime already elapsed, clamped to `0.0..=1.0`
    pub fn elapsed_fraction(&self, now_ms: u64) -> f64 {
        let lifetime = self.lifetime_ms();
        if lifetime == 0 {
            return 1.0;
        }
        let elapsed = now_ms.saturating_sub(self.created_at) as f64;
        (elapsed / lifetime as f64).min(1.0)
    }

    /// Check tag membership
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

impl CacheEntry<Value> {
    /// Decode the JSON value into a caller type
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.value)
    }
}

/// On-disk record of the durable tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableRecord {
    pub value: Value,
    /// Creation time (epoch ms)
    pub timestamp: u64,
    /// Expiry time (epoch ms)
    pub expiry: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl From<&CacheEntry> for DurableRecord {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            value: entry.value.clone(),
            timestamp: entry.created_at,
            expiry: entry.expires_at,
            tags: (!entry.tags.is_empty()).then(|| entry.tags.iter().cloned().collect()),
            metadata: (!entry.metadata.is_empty()).then(|| entry.metadata.clone()),
        }
    }
}

impl From<DurableRecord> for CacheEntry {
    fn from(record: DurableRecord) -> Self {
        Self {
            value: record.value,
            created_at: record.timestamp,
            expires_at: record.expiry,
            tags: record.tags.unwrap_or_default().into_iter().collect(),
            metadata: record.metadata.unwrap_or_default(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
