//! End-to-end behavior of the cache engine across all three tiers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;

use tiercache::cache::remote::{InMemoryRemoteStore, RemoteStore};
use tiercache::cache::{CacheEngine, CacheOptions, FileStore, InMemoryStore, ManualClock};
use tiercache::config::CacheConfig;
use tiercache::Error;

// =============================================================================
// Fixtures
// =============================================================================

const START_MS: u64 = 1_700_000_000_000;

struct Fixture {
    clock: Arc<ManualClock>,
    remote: Arc<InMemoryRemoteStore>,
    engine: CacheEngine,
}

fn fixture(config: CacheConfig) -> Fixture {
    let clock = Arc::new(ManualClock::new(START_MS));
    let remote = Arc::new(InMemoryRemoteStore::new(clock.clone()));
    let engine = engine_on(config, clock.clone(), remote.clone());
    Fixture {
        clock,
        remote,
        engine,
    }
}

fn engine_on(
    config: CacheConfig,
    clock: Arc<ManualClock>,
    remote: Arc<InMemoryRemoteStore>,
) -> CacheEngine {
    CacheEngine::builder(config)
        .clock(clock)
        .durable_store(Arc::new(InMemoryStore::new()))
        .remote_store(remote)
        .build()
        .unwrap()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
}

fn profile(name: &str) -> Profile {
    Profile { name: name.into() }
}

async fn wait_for_refreshes(engine: &CacheEngine) {
    for _ in 0..500 {
        if engine.stats().await.refreshing == 0 {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("background refresh did not finish");
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn user_profile_is_refreshed_after_ttl() {
    let f = fixture(CacheConfig::default());
    let opts = CacheOptions::new().ttl(Duration::from_millis(5_000));

    f.engine
        .set("user:42", &profile("Ada"), opts.clone())
        .await
        .unwrap();
    let now: Option<Profile> = f.engine.get("user:42").await.unwrap();
    assert_eq!(now, Some(profile("Ada")));

    f.clock.advance(Duration::from_millis(6_000));

    let refreshed = f
        .engine
        .get_or_fetch("user:42", opts.clone(), || async { Ok(profile("Ada2")) })
        .await
        .unwrap();
    assert_eq!(refreshed, profile("Ada2"));

    let again = f
        .engine
        .get_or_fetch("user:42", opts, || async { Ok(profile("Ada3")) })
        .await
        .unwrap();
    assert_eq!(again, profile("Ada2"));
    assert_eq!(f.engine.stats().await.engine.fetches, 1);
}

#[tokio::test]
async fn init_chat_tag_invalidation() {
    let f = fixture(CacheConfig::default());
    let tagged = CacheOptions::new().tags(["init-chat"]);

    f.engine.set("chat:model", &"m1", tagged.clone()).await.unwrap();
    f.engine.set("chat:agents", &json!(["a", "b"]), tagged).await.unwrap();
    f.engine.set("chat:theme", &"dark", CacheOptions::new()).await.unwrap();

    let report = f.engine.delete_by_tag("init-chat").await;
    assert_eq!(report.memory, 2);
    assert!(report.remote);

    assert_eq!(f.engine.get::<String>("chat:model").await.unwrap(), None);
    assert_eq!(f.engine.get::<serde_json::Value>("chat:agents").await.unwrap(), None);
    assert_eq!(
        f.engine.get::<String>("chat:theme").await.unwrap().as_deref(),
        Some("dark")
    );

    // Another instance sharing the remote tier sees nothing either
    let other = engine_on(CacheConfig::default(), f.clock.clone(), f.remote.clone());
    assert_eq!(other.get::<String>("chat:model").await.unwrap(), None);
    assert!(f.remote.smembers("cache:TAG::init-chat").await.unwrap().is_empty());
}

#[tokio::test]
async fn tag_invalidation_reaches_long_lived_members() {
    let f = fixture(CacheConfig::default());
    let long = CacheOptions::new().ttl(Duration::from_secs(3_600)).tags(["g"]);
    let short = CacheOptions::new().ttl(Duration::from_secs(1)).tags(["g"]);

    f.engine.set("a", &1, long).await.unwrap();
    f.engine.set("b", &2, short).await.unwrap();
    f.clock.advance(Duration::from_secs(2));

    let report = f.engine.delete_by_tag("g").await;
    assert!(report.remote);
    assert_eq!(f.engine.get::<u32>("a").await.unwrap(), None);
    assert!(f.remote.get("cache:a").await.unwrap().is_none());
}

#[tokio::test]
async fn remote_outage_falls_back_to_fetch() {
    let f = fixture(CacheConfig::default());
    f.remote.set_reachable(false);

    let value = f
        .engine
        .get_or_fetch("agent:config", CacheOptions::new(), || async {
            Ok(json!({"temperature": 0.2}))
        })
        .await
        .unwrap();
    assert_eq!(value, json!({"temperature": 0.2}));

    let stats = f.engine.stats().await;
    assert!(!stats.remote.connected);
    assert_eq!(stats.engine.fetches, 1);

    // Served locally from now on
    let cached: Option<serde_json::Value> = f.engine.get("agent:config").await.unwrap();
    assert_eq!(cached, Some(json!({"temperature": 0.2})));
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn coalescing_runs_one_fetch_for_concurrent_callers() {
    let f = fixture(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let callers = (0..32).map(|_| {
        let engine = f.engine.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            engine
                .get_or_fetch("cad:analysis:7", CacheOptions::new(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(vec![1u32, 2, 3])
                })
                .await
        })
    });

    for caller in futures::future::join_all(callers).await {
        assert_eq!(caller.unwrap().unwrap(), vec![1, 2, 3]);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn coalesced_callers_share_the_fetch_error() {
    let f = fixture(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let attempt = |calls: Arc<AtomicUsize>| {
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err::<String, _>(anyhow::anyhow!("model service returned 503"))
        }
    };

    let (a, b, c) = tokio::join!(
        f.engine.get_or_fetch("k", CacheOptions::new(), attempt(calls.clone())),
        f.engine.get_or_fetch("k", CacheOptions::new(), attempt(calls.clone())),
        f.engine.get_or_fetch("k", CacheOptions::new(), attempt(calls.clone())),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in [a, b, c] {
        assert_matches!(result, Err(Error::Fetch { ref source, .. }) if source.to_string().contains("503"));
    }
    assert!(!f.engine.has("k").await);
}

#[tokio::test]
async fn promotion_survives_remote_loss() {
    let f = fixture(CacheConfig::default());
    f.engine.set("shared", &"from-a", CacheOptions::new()).await.unwrap();

    // Fresh instance: empty local tiers, same remote
    let b = engine_on(CacheConfig::default(), f.clock.clone(), f.remote.clone());
    assert_eq!(
        b.get::<String>("shared").await.unwrap().as_deref(),
        Some("from-a")
    );
    assert_eq!(b.stats().await.engine.remote_hits, 1);

    f.remote.set_reachable(false);
    assert_eq!(
        b.get::<String>("shared").await.unwrap().as_deref(),
        Some("from-a")
    );
    assert_eq!(b.stats().await.engine.memory_hits, 1);
}

#[tokio::test]
async fn durable_tier_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(START_MS));
    let config = CacheConfig {
        use_remote_cache: false,
        ..CacheConfig::default()
    };
    let open = || {
        CacheEngine::builder(config.clone())
            .clock(clock.clone())
            .durable_store(Arc::new(FileStore::open(dir.path()).unwrap()))
            .build()
            .unwrap()
    };

    open().set("report:9", &json!({"pages": 3}), CacheOptions::new()).await.unwrap();

    let restarted = open();
    let value: Option<serde_json::Value> = restarted.get("report:9").await.unwrap();
    assert_eq!(value, Some(json!({"pages": 3})));
    assert_eq!(restarted.stats().await.engine.durable_hits, 1);
}

#[tokio::test]
async fn stale_value_is_served_while_revalidating() {
    let f = fixture(CacheConfig {
        stale_while_revalidate: true,
        ..CacheConfig::default()
    });
    let opts = CacheOptions::new().ttl(Duration::from_secs(1));
    f.engine.set("k", &"old", opts.clone()).await.unwrap();
    f.clock.advance(Duration::from_secs(3));

    let served = f
        .engine
        .get_or_fetch("k", opts, || async { Ok("new".to_string()) })
        .await
        .unwrap();
    assert_eq!(served, "old");

    wait_for_refreshes(&f.engine).await;
    assert_eq!(f.engine.get::<String>("k").await.unwrap().as_deref(), Some("new"));
}

#[tokio::test]
async fn expired_entries_are_not_served_without_staleness_tolerance() {
    let f = fixture(CacheConfig::default());
    f.engine
        .set("k", &1, CacheOptions::new().ttl(Duration::from_secs(1)))
        .await
        .unwrap();
    f.clock.advance(Duration::from_secs(1));

    assert_eq!(f.engine.get::<u32>("k").await.unwrap(), None);
    assert_eq!(f.engine.stats().await.engine.misses, 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn reads_before_ttl_return_the_written_value(
        ttl_ms in 1u64..120_000,
        elapsed_pct in 0u64..100,
        value in any::<i64>(),
    ) {
        tokio_test::block_on(async {
            let f = fixture(CacheConfig {
                prefetch_threshold: 1.0,
                ..CacheConfig::default()
            });
            f.engine
                .set("k", &value, CacheOptions::new().ttl(Duration::from_millis(ttl_ms)))
                .await
                .unwrap();

            f.clock.advance(Duration::from_millis(ttl_ms * elapsed_pct / 100));
            let got: Option<i64> = f.engine.get("k").await.unwrap();
            assert_eq!(got, Some(value));
        });
    }
}
