//! tiercache - Multi-Tier Cache Engine
//!
//! Sits in front of expensive upstream calls and coordinates three storage
//! tiers of different latency and durability:
//!
//! ```text
//! CacheEngine ──▶ Memory (LRU) ──▶ Durable (on-device) ──▶ Remote (shared KV)
//! ```
//!
//! Concurrent fetches for the same key are coalesced, entries nearing expiry
//! are refreshed in the background, and any tier can fail without the caller
//! seeing more than a cache miss.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tiercache::cache::{CacheEngine, CacheOptions};
//! use tiercache::config::CacheConfig;
//!
//! # async fn demo() -> tiercache::error::Result<()> {
//! let engine = CacheEngine::builder(CacheConfig::default()).build()?;
//! let opts = CacheOptions::new().ttl(Duration::from_secs(60)).tags(["users"]);
//!
//! let name: String = engine
//!     .get_or_fetch("user:42", opts, || async { Ok("Ada".to_string()) })
//!     .await?;
//! # let _ = name;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, engine, single-flight and health
//! - [`config`] - Engine configuration
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod error;

pub use cache::{CacheEngine, CacheOptions};
pub use config::CacheConfig;
pub use error::{Error, Result};
