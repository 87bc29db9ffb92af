//! REST key-value backend
//!
//! Speaks the JSON command protocol of REST-fronted key-value services: each
//! command is POSTed as a JSON array (`["SET", "k", "v", "EX", "60"]`) with a
//! bearer token, and the reply is `{"result": ...}` or `{"error": "..."}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use super::backend::RemoteStore;
use crate::error::{Error, RemoteError, Result};

/// Page size for SCAN
const SCAN_COUNT: &str = "100";

#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for a REST key-value endpoint
pub struct RestKvStore {
    client: Client,
    url: String,
    token: String,
}

impl RestKvStore {
    /// Build a client. `connect_timeout` bounds TCP/TLS setup only; per
    /// command deadlines are enforced by the remote tier.
    pub fn new(url: impl Into<String>, token: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    #[instrument(skip(self, args), fields(command = %args.first().map(String::as_str).unwrap_or("")))]
    async fn command(&self, args: Vec<String>) -> std::result::Result<Value, RemoteError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&args)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        let reply: CommandReply = response.json().await.map_err(|e| {
            if status.is_success() {
                RemoteError::Protocol(format!("invalid reply: {}", e))
            } else {
                RemoteError::Protocol(format!("HTTP {}", status))
            }
        })?;

        if let Some(error) = reply.error {
            return Err(RemoteError::Protocol(error));
        }
        if !status.is_success() {
            return Err(RemoteError::Protocol(format!("HTTP {}", status)));
        }

        Ok(reply.result.unwrap_or(Value::Null))
    }
}

/// Map transport failures onto the connection/operation split
fn classify(err: reqwest::Error) -> RemoteError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        RemoteError::Connection(err.to_string())
    } else {
        RemoteError::Protocol(err.to_string())
    }
}

/// Escape glob metacharacters so a prefix matches literally in SCAN
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

fn as_string(value: Value) -> std::result::Result<String, RemoteError> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(RemoteError::Protocol(format!("expected string, got {}", other))),
    }
}

fn as_strings(value: Value) -> std::result::Result<Vec<String>, RemoteError> {
    match value {
        Value::Array(items) => items.into_iter().map(as_string).collect(),
        Value::Null => Ok(Vec::new()),
        other => Err(RemoteError::Protocol(format!("expected array, got {}", other))),
    }
}

#[async_trait]
impl RemoteStore for RestKvStore {
    async fn ping(&self) -> std::result::Result<(), RemoteError> {
        let reply = self.command(vec!["PING".into()]).await?;
        match reply {
            Value::String(s) if s.eq_ignore_ascii_case("pong") => Ok(()),
            other => Err(RemoteError::Protocol(format!("unexpected PING reply: {}", other))),
        }
    }

    async fn get(&self, key: &str) -> std::result::Result<Option<String>, RemoteError> {
        match self.command(vec!["GET".into(), key.into()]).await? {
            Value::Null => Ok(None),
            other => as_string(other).map(Some),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> std::result::Result<(), RemoteError> {
        self.command(vec![
            "SET".into(),
            key.into(),
            value.into(),
            "EX".into(),
            ttl_secs.to_string(),
        ])
        .await
        .map(|_| ())
    }

    async fn del(&self, keys: &[String]) -> std::result::Result<u64, RemoteError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut args = Vec::with_capacity(keys.len() + 1);
        args.push("DEL".to_string());
        args.extend(keys.iter().cloned());

        let reply = self.command(args).await?;
        Ok(reply.as_u64().unwrap_or(0))
    }

    async fn sadd(&self, key: &str, members: &[String]) -> std::result::Result<(), RemoteError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut args = Vec::with_capacity(members.len() + 2);
        args.push("SADD".to_string());
        args.push(key.to_string());
        args.extend(members.iter().cloned());
        self.command(args).await.map(|_| ())
    }

    async fn smembers(&self, key: &str) -> std::result::Result<Vec<String>, RemoteError> {
        let reply = self.command(vec!["SMEMBERS".into(), key.into()]).await?;
        as_strings(reply)
    }

    async fn expire_gt(&self, key: &str, ttl_secs: u64) -> std::result::Result<(), RemoteError> {
        // GT treats a key without expiry as never expiring, so NX covers that case first
        for mode in ["NX", "GT"] {
            self.command(vec![
                "EXPIRE".into(),
                key.into(),
                ttl_secs.to_string(),
                mode.into(),
            ])
            .await?;
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> std::result::Result<Vec<String>, RemoteError> {
        let pattern = glob_escape(prefix);
        let mut cursor = "0".to_string();
        let mut keys = Vec::new();

        loop {
            let reply = self
                .command(vec![
                    "SCAN".into(),
                    cursor.clone(),
                    "MATCH".into(),
                    pattern.clone(),
                    "COUNT".into(),
                    SCAN_COUNT.into(),
                ])
                .await?;

            let mut parts = match reply {
                Value::Array(parts) if parts.len() == 2 => parts.into_iter(),
                other => {
                    return Err(RemoteError::Protocol(format!(
                        "unexpected SCAN reply: {}",
                        other
                    )))
                }
            };

            // Length checked above
            let next = parts.next().map(as_string).unwrap_or(Ok("0".into()))?;
            let page = parts.next().map(as_strings).unwrap_or(Ok(Vec::new()))?;
            keys.extend(page);

            debug!(cursor = %next, total = keys.len(), "SCAN page");
            if next == "0" {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "rest"
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_glob_escape() {
        assert_eq!(glob_escape("cache:"), "cache:*");
        assert_eq!(glob_escape("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\*");
    }

    #[test]
    fn test_reply_decoding() {
        assert_eq!(as_string(json!("v")).unwrap(), "v");
        assert_eq!(as_string(json!(42)).unwrap(), "42");
        assert!(as_string(json!({"x": 1})).is_err());

        assert_eq!(as_strings(json!(["a", "b"])).unwrap(), vec!["a", "b"]);
        assert!(as_strings(Value::Null).unwrap().is_empty());
        assert!(as_strings(json!("a")).is_err());
    }

    #[test]
    fn test_command_reply_shapes() {
        let ok: CommandReply = serde_json::from_str(r#"{"result":"PONG"}"#).unwrap();
        assert_eq!(ok.result, Some(json!("PONG")));
        assert!(ok.error.is_none());

        let err: CommandReply = serde_json::from_str(r#"{"error":"WRONGTYPE"}"#).unwrap();
        assert_eq!(err.error.as_deref(), Some("WRONGTYPE"));
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        let store = RestKvStore::new("https://kv.example.com/", "t", Duration::from_secs(1)).unwrap();
        assert_eq!(store.url, "https://kv.example.com");
        assert_eq!(store.name(), "rest");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_error() {
        // Port 9 (discard) on localhost is closed in test environments
        let store = RestKvStore::new("http://127.0.0.1:9", "t", Duration::from_millis(200)).unwrap();
        let err = store.ping().await.unwrap_err();
        assert!(err.is_connection(), "expected connection error, got {:?}", err);
    }
}
