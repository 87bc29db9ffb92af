//! tiercache - command-line access to the multi-tier cache
//!
//! Operates on the same durable directory and remote service an application
//! would use, and prints results as JSON.
//!
//! ```text
//! tiercache --durable-dir ./cache set user:42 '{"name":"Ada"}' --ttl-ms 5000
//! tiercache --durable-dir ./cache get user:42
//! tiercache delete-tag init-chat
//! tiercache stats
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::{CacheEngine, CacheOptions, FileStore};
use tiercache::config::CacheConfig;

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - multi-tier cache engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory backing the durable tier (durable tier disabled if unset)
    #[arg(long, env = "TIERCACHE_DURABLE_DIR")]
    durable_dir: Option<PathBuf>,

    /// Physical key prefix
    #[arg(long, env = "TIERCACHE_NAMESPACE")]
    namespace: Option<String>,

    /// Skip the remote tier even if an endpoint is configured
    #[arg(long)]
    no_remote: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read a key
    Get { key: String },

    /// Write a key. VALUE is parsed as JSON, or stored as a string.
    Set {
        key: String,
        value: String,
        /// Entry lifetime in milliseconds
        #[arg(long)]
        ttl_ms: Option<u64>,
        /// Tag for group invalidation (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Delete a key from every tier
    Delete { key: String },

    /// Delete every key carrying a tag
    DeleteTag { tag: String },

    /// Empty every tier
    Clear,

    /// Print statistics
    Stats,

    /// Remove expired durable records
    Sweep,

    /// Print tier health
    Health,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let engine = build_engine(&args)?;
    let output = run(&engine, args.command).await?;
    engine.shutdown().await;

    print_json(&output)
}

fn build_engine(args: &Args) -> anyhow::Result<CacheEngine> {
    let mut config = CacheConfig::from_env().context("invalid configuration")?;
    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    if args.no_remote {
        config.use_remote_cache = false;
    }
    debug!(?config, "Loaded configuration");

    let mut builder = CacheEngine::builder(config);
    if let Some(dir) = &args.durable_dir {
        let store = FileStore::open(dir)
            .with_context(|| format!("cannot open durable directory {}", dir.display()))?;
        builder = builder.durable_store(Arc::new(store));
    }

    builder.build().context("failed to build cache engine")
}

async fn run(engine: &CacheEngine, command: Command) -> anyhow::Result<Value> {
    let output = match command {
        Command::Get { key } => {
            let value: Option<Value> = engine.get(&key).await?;
            json!({ "key": key, "hit": value.is_some(), "value": value })
        }
        Command::Set {
            key,
            value,
            ttl_ms,
            tags,
        } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            let mut opts = CacheOptions::new().tags(tags);
            if let Some(ttl_ms) = ttl_ms {
                opts = opts.ttl(Duration::from_millis(ttl_ms));
            }
            engine.set(&key, &value, opts).await?;
            json!({ "key": key, "stored": true })
        }
        Command::Delete { key } => {
            engine.delete(&key).await;
            json!({ "key": key, "deleted": true })
        }
        Command::DeleteTag { tag } => to_json(&engine.delete_by_tag(&tag).await)?,
        Command::Clear => {
            engine.clear().await;
            json!({ "cleared": true })
        }
        Command::Stats => to_json(&engine.stats().await)?,
        Command::Sweep => json!({ "removed": engine.sweep().await }),
        Command::Health => to_json(&engine.health().await)?,
    };
    Ok(output)
}

fn to_json<T: Serialize>(value: &T) -> anyhow::Result<Value> {
    serde_json::to_value(value).context("failed to encode output")
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{}", text);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr; stdout carries the JSON result
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_with_tags() {
        let args = Args::try_parse_from([
            "tiercache",
            "--no-remote",
            "set",
            "user:42",
            r#"{"name":"Ada"}"#,
            "--ttl-ms",
            "5000",
            "--tag",
            "users",
            "--tag",
            "init-chat",
        ])
        .unwrap();

        assert!(args.no_remote);
        match args.command {
            Command::Set { key, ttl_ms, tags, .. } => {
                assert_eq!(key, "user:42");
                assert_eq!(ttl_ms, Some(5000));
                assert_eq!(tags, vec!["users", "init-chat"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_delete_tag() {
        let args = Args::try_parse_from(["tiercache", "delete-tag", "init-chat"]).unwrap();
        assert!(matches!(args.command, Command::DeleteTag { ref tag } if tag == "init-chat"));
    }

    #[tokio::test]
    async fn test_run_against_local_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = CacheEngine::builder(CacheConfig {
            use_remote_cache: false,
            ..CacheConfig::default()
        })
        .durable_store(Arc::new(FileStore::open(dir.path()).unwrap()))
        .build()
        .unwrap();

        let set = Command::Set {
            key: "greeting".into(),
            value: "hello".into(),
            ttl_ms: None,
            tags: vec![],
        };
        run(&engine, set).await.unwrap();

        let got = run(&engine, Command::Get { key: "greeting".into() })
            .await
            .unwrap();
        assert_eq!(got["value"], json!("hello"));
        assert_eq!(got["hit"], json!(true));

        let stats = run(&engine, Command::Stats).await.unwrap();
        assert_eq!(stats["durable"]["entries"], json!(1));
        assert_eq!(stats["remote"]["enabled"], json!(false));
    }
}
