//! Engine configuration
//!
//! Durations are stored as millisecond integers so the structs serialize
//! cleanly; use the accessor methods to get `Duration`s.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::remote::Backoff;
use crate::cache::{
    DEFAULT_DURABLE_TTL, DEFAULT_MEMORY_SIZE, DEFAULT_MEMORY_TTL, DEFAULT_NAMESPACE,
    DEFAULT_PREFETCH_THRESHOLD, DEFAULT_SWEEP_INTERVAL,
};
use crate::error::{Error, Result};

/// Environment variable holding the remote endpoint URL
pub const REMOTE_URL_ENV: &str = "KV_REST_API_URL";

/// Environment variable holding the remote bearer token
pub const REMOTE_TOKEN_ENV: &str = "KV_REST_API_TOKEN";

// =============================================================================
// Cache Configuration
// =============================================================================

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memory tier capacity (entries)
    pub memory_size: usize,
    /// Default lifetime of entries written without an explicit TTL
    pub memory_ttl_ms: u64,
    /// Upper bound on a durable record's lifetime, counted from its creation
    pub durable_ttl_ms: u64,
    /// Enable the durable tier
    pub persistence_enabled: bool,
    /// Byte size above which compression would be considered (advisory)
    pub compression_threshold: usize,
    /// Serve expired entries while refreshing them in the background
    pub stale_while_revalidate: bool,
    /// Fraction of an entry's lifetime after which a read triggers a prefetch
    pub prefetch_threshold: f64,
    /// Enable the remote tier
    pub use_remote_cache: bool,
    /// Physical key prefix for the durable and remote tiers
    pub namespace: String,
    /// Durable sweep period
    pub sweep_interval_ms: u64,
    /// Remote service settings
    pub remote: RemoteConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            memory_ttl_ms: DEFAULT_MEMORY_TTL.as_millis() as u64,
            durable_ttl_ms: DEFAULT_DURABLE_TTL.as_millis() as u64,
            persistence_enabled: true,
            compression_threshold: 1024,
            stale_while_revalidate: false,
            prefetch_threshold: DEFAULT_PREFETCH_THRESHOLD,
            use_remote_cache: true,
            namespace: DEFAULT_NAMESPACE.to_string(),
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL.as_millis() as u64,
            remote: RemoteConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn memory_ttl(&self) -> Duration {
        Duration::from_millis(self.memory_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.prefetch_threshold) {
            return Err(Error::Config(format!(
                "prefetch_threshold must be within 0..=1, got {}",
                self.prefetch_threshold
            )));
        }
        if self.memory_ttl_ms == 0 {
            return Err(Error::Config("memory_ttl_ms must be positive".into()));
        }
        if self.persistence_enabled && self.durable_ttl_ms == 0 {
            return Err(Error::Config("durable_ttl_ms must be positive".into()));
        }
        if self.persistence_enabled && self.sweep_interval_ms == 0 {
            return Err(Error::Config("sweep_interval_ms must be positive".into()));
        }
        if self.use_remote_cache {
            self.remote.validate()?;
        }
        Ok(())
    }

    /// Defaults overridden by `TIERCACHE_*` variables and the remote
    /// endpoint variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse("TIERCACHE_MEMORY_SIZE")? {
            config.memory_size = v;
        }
        if let Some(v) = env_parse("TIERCACHE_MEMORY_TTL_MS")? {
            config.memory_ttl_ms = v;
        }
        if let Some(v) = env_parse("TIERCACHE_DURABLE_TTL_MS")? {
            config.durable_ttl_ms = v;
        }
        if let Some(v) = env_parse("TIERCACHE_PERSISTENCE_ENABLED")? {
            config.persistence_enabled = v;
        }
        if let Some(v) = env_parse("TIERCACHE_COMPRESSION_THRESHOLD")? {
            config.compression_threshold = v;
        }
        if let Some(v) = env_parse("TIERCACHE_STALE_WHILE_REVALIDATE")? {
            config.stale_while_revalidate = v;
        }
        if let Some(v) = env_parse("TIERCACHE_PREFETCH_THRESHOLD")? {
            config.prefetch_threshold = v;
        }
        if let Some(v) = env_parse("TIERCACHE_USE_REMOTE_CACHE")? {
            config.use_remote_cache = v;
        }
        if let Some(v) = env_var("TIERCACHE_NAMESPACE") {
            config.namespace = v;
        }
        if let Some(v) = env_parse("TIERCACHE_SWEEP_INTERVAL_MS")? {
            config.sweep_interval_ms = v;
        }

        config.remote = RemoteConfig::from_env()?;
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Remote Configuration
// =============================================================================

/// Remote tier settings
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Service endpoint
    pub url: Option<String>,
    /// Bearer token
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub connect_timeout_ms: u64,
    pub op_timeout_ms: u64,
    /// First reconnect delay
    pub backoff_base_ms: u64,
    /// Reconnect delay cap
    pub backoff_max_ms: u64,
    /// Reconnect attempts before waiting for the next explicit call
    pub max_retries: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            connect_timeout_ms: 5_000,
            op_timeout_ms: 2_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            max_retries: 5,
        }
    }
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("op_timeout_ms", &self.op_timeout_ms)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .field("backoff_max_ms", &self.backoff_max_ms)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl RemoteConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            max_retries: self.max_retries,
        }
    }

    /// URL and token, when both are set
    pub fn endpoint(&self) -> Option<(&str, &str)> {
        match (self.url.as_deref(), self.token.as_deref()) {
            (Some(url), Some(token)) if !url.is_empty() => Some((url, token)),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.op_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(Error::Config("remote timeouts must be positive".into()));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::Config(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        Ok(())
    }

    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            url: env_var(REMOTE_URL_ENV),
            token: env_var(REMOTE_TOKEN_ENV),
            ..Self::default()
        };

        if let Some(v) = env_parse("TIERCACHE_REMOTE_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout_ms = v;
        }
        if let Some(v) = env_parse("TIERCACHE_REMOTE_OP_TIMEOUT_MS")? {
            config.op_timeout_ms = v;
        }
        if let Some(v) = env_parse("TIERCACHE_REMOTE_BACKOFF_BASE_MS")? {
            config.backoff_base_ms = v;
        }
        if let Some(v) = env_parse("TIERCACHE_REMOTE_BACKOFF_MAX_MS")? {
            config.backoff_max_ms = v;
        }
        if let Some(v) = env_parse("TIERCACHE_REMOTE_MAX_RETRIES")? {
            config.max_retries = v;
        }
        Ok(config)
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {}={:?}: {}", name, raw, e)))
        })
        .transpose()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.namespace, "cache:");
        assert!(!config.stale_while_revalidate);
        assert_eq!(config.memory_ttl(), DEFAULT_MEMORY_TTL);
    }

    #[test]
    fn test_prefetch_threshold_range() {
        let config = CacheConfig {
            prefetch_threshold: 1.5,
            ..CacheConfig::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = CacheConfig {
            prefetch_threshold: 1.0,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_remote_backoff_ordering() {
        let remote = RemoteConfig {
            backoff_base_ms: 10_000,
            backoff_max_ms: 1_000,
            ..RemoteConfig::default()
        };
        assert_matches!(remote.validate(), Err(Error::Config(_)));

        // Ignored while the remote tier is disabled
        let config = CacheConfig {
            use_remote_cache: false,
            remote,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_remote_endpoint_requires_url_and_token() {
        let mut remote = RemoteConfig::default();
        assert!(remote.endpoint().is_none());

        remote.url = Some("https://kv.example.com".into());
        assert!(remote.endpoint().is_none());

        remote.token = Some("secret".into());
        assert_eq!(remote.endpoint(), Some(("https://kv.example.com", "secret")));
    }

    #[test]
    fn test_token_is_redacted() {
        let remote = RemoteConfig {
            token: Some("secret".into()),
            ..RemoteConfig::default()
        };
        assert!(!format!("{:?}", remote).contains("secret"));
        assert!(!serde_json::to_string(&remote).unwrap().contains("secret"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"memory_size": 10, "remote": {"max_retries": 1}}"#).unwrap();
        assert_eq!(config.memory_size, 10);
        assert_eq!(config.remote.max_retries, 1);
        assert_eq!(config.remote.op_timeout_ms, 2_000);
        assert_eq!(config.prefetch_threshold, DEFAULT_PREFETCH_THRESHOLD);
    }

    #[test]
    fn test_backoff_from_config() {
        let backoff = RemoteConfig::default().backoff();
        assert_eq!(backoff.base, Duration::from_secs(1));
        assert_eq!(backoff.max_delay, Duration::from_secs(30));
        assert_eq!(backoff.max_retries, 5);
    }
}
