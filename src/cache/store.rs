//! Persistent key-value surfaces for the durable tier
//!
//! A [`PersistentStore`] is a plain string-to-string store, the smallest
//! surface a runtime can offer for on-device persistence. The durable tier
//! layers namespacing, record encoding and sweeping on top.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::fs;

/// Key-value persistence surface
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Read a value
    async fn get_item(&self, key: &str) -> io::Result<Option<String>>;

    /// Write a value, replacing any previous one
    async fn set_item(&self, key: &str, value: &str) -> io::Result<()>;

    /// Remove a value; removing a missing key is not an error
    async fn remove_item(&self, key: &str) -> io::Result<()>;

    /// List every stored key
    async fn keys(&self) -> io::Result<Vec<String>>;
}

// =============================================================================
// File Store
// =============================================================================

/// Suffix of in-progress writes. `%` followed by a non-hex character never
/// appears in an encoded key.
const TMP_SUFFIX: &str = ".%tmp";

/// One file per key inside a directory. File names are the url-encoded key.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(urlencoding::encode(key).as_ref())
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn get_item(&self, key: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> io::Result<()> {
        // Write-then-rename so readers never observe a torn record
        let target = self.path_for(key);
        let tmp = self.dir.join(format!(
            "{}{}",
            urlencoding::encode(key),
            TMP_SUFFIX
        ));
        fs::write(&tmp, value).await?;
        fs::rename(&tmp, &target).await
    }

    async fn remove_item(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn keys(&self) -> io::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(dirent) = entries.next_entry().await? {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            if let Ok(key) = urlencoding::decode(name) {
                keys.push(key.into_owned());
            }
        }
        Ok(keys)
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Volatile store with an optional byte quota.
///
/// Writes that would push the total past the quota fail with
/// `ErrorKind::OutOfMemory`.
pub struct InMemoryStore {
    items: RwLock<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
    used_bytes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            quota_bytes: None,
            used_bytes: AtomicUsize::new(0),
        }
    }

    /// Store that rejects writes once `quota_bytes` is reached
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistentStore for InMemoryStore {
    async fn get_item(&self, key: &str) -> io::Result<Option<String>> {
        Ok(self.items.read().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> io::Result<()> {
        let mut items = self.items.write();
        let old = items.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
        let new = key.len() + value.len();
        let used = self.used_bytes.load(Ordering::Relaxed) - old + new;

        if let Some(quota) = self.quota_bytes {
            if used > quota {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    format!("quota of {} bytes exceeded", quota),
                ));
            }
        }

        items.insert(key.to_string(), value.to_string());
        self.used_bytes.store(used, Ordering::Relaxed);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> io::Result<()> {
        let mut items = self.items.write();
        if let Some(value) = items.remove(key) {
            self.used_bytes
                .fetch_sub(key.len() + value.len(), Ordering::Relaxed);
        }
        Ok(())
    }

    async fn keys(&self) -> io::Result<Vec<String>> {
        Ok(self.items.read().keys().cloned().collect())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_basic() {
        let store = InMemoryStore::new();
        assert!(store.get_item("a").await.unwrap().is_none());

        store.set_item("a", "1").await.unwrap();
        store.set_item("b", "2").await.unwrap();
        assert_eq!(store.get_item("a").await.unwrap().as_deref(), Some("1"));

        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);

        store.remove_item("a").await.unwrap();
        store.remove_item("a").await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_store_quota() {
        let store = InMemoryStore::with_quota(10);
        store.set_item("k", "12345").await.unwrap();
        assert_eq!(store.used_bytes(), 6);

        let err = store.set_item("k2", "123456789").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
        assert!(store.get_item("k2").await.unwrap().is_none());

        // Replacing an item only charges the difference
        store.set_item("k", "123456789").await.unwrap();
        assert_eq!(store.used_bytes(), 10);

        store.remove_item("k").await.unwrap();
        assert_eq!(store.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("durable")).unwrap();

        store.set_item("cache:user:42 profile", "{\"v\":1}").await.unwrap();
        assert_eq!(
            store.get_item("cache:user:42 profile").await.unwrap().as_deref(),
            Some("{\"v\":1}")
        );
        assert_eq!(store.keys().await.unwrap(), vec!["cache:user:42 profile".to_string()]);

        store.remove_item("cache:user:42 profile").await.unwrap();
        assert!(store.get_item("cache:user:42 profile").await.unwrap().is_none());
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.set_item("k", "persisted").await.unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get_item("k").await.unwrap().as_deref(), Some("persisted"));
    }
}
