//! Tiered archive cache.
//!
//! Lookups go memory LRU, then the persistent [`ArchiveStore`], then the
//! [`TarballFetcher`]. The persistent tier is best-effort: any read, write or
//! parse failure there counts as a miss and is only logged.

use super::error::PkgError;
use super::fetch::TarballFetcher;
use crate::config::Channel;
use crate::paths::archive_cache_dir;
use crate::version::SCHEMA_VERSION;
use async_trait::async_trait;
use bytes::Bytes;
use hashlink::LruCache;
use memnode_util::fs::{atomic_write, remove_file_if_exists};
use memnode_util::hash::{blake3_digest, key_file_name, verify_digest, DIGEST_LEN};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

/// Namespace holding downloaded package archives.
pub const ARCHIVE_NAMESPACE: &str = "tarballs";

/// Default runtime tag baked into cache keys.
pub const DEFAULT_RUNTIME: &str = "node";

/// Default number of archives kept in memory.
pub const DEFAULT_MEMORY_ENTRIES: usize = 256;

/// Default number of archives kept per namespace on disk.
pub const DEFAULT_DISK_ENTRIES: usize = 4096;

/// Versioned cache key: `schema:epoch:runtime:namespace:scope:raw`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub schema: u32,
    pub epoch: u64,
    pub runtime: String,
    pub namespace: String,
    pub scope: String,
    pub raw: String,
}

impl CacheKey {
    #[must_use]
    pub fn new(namespace: &str, scope: &str, raw: &str) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            epoch: 0,
            runtime: DEFAULT_RUNTIME.to_string(),
            namespace: namespace.to_string(),
            scope: scope.to_string(),
            raw: raw.to_string(),
        }
    }

    /// Key for a tarball URL, scoped by its host.
    #[must_use]
    pub fn archive(url: &str) -> Self {
        let scope = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_default();
        Self::new(ARCHIVE_NAMESPACE, &scope, url)
    }

    #[must_use]
    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    #[must_use]
    pub fn with_runtime(mut self, runtime: &str) -> Self {
        self.runtime = runtime.to_string();
        self
    }

    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.schema, self.epoch, self.runtime, self.namespace, self.scope, self.raw
        )
    }
}

/// Persistent archive tier.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Look up an entry. Corrupt entries are reported as `Ok(None)`.
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, PkgError>;

    /// Store an entry. Callers hold the namespace lock.
    async fn put(&self, key: &CacheKey, data: Bytes) -> Result<(), PkgError>;

    /// Drop an entry. Callers hold the namespace lock.
    async fn remove(&self, key: &CacheKey) -> Result<(), PkgError>;
}

/// Per-namespace writer locks.
#[derive(Debug, Default)]
pub struct NamespaceLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl NamespaceLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the writer lock for `namespace`.
    pub async fn lock(&self, namespace: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(namespace.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NamespaceIndex {
    /// File names, oldest first.
    entries: Vec<String>,
}

/// Host-disk [`ArchiveStore`].
///
/// Each entry file starts with the BLAKE3 digest of its payload; a namespace
/// directory keeps an `index.json` used for oldest-first eviction.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
    max_entries: usize,
}

impl DiskStore {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            max_entries: DEFAULT_DISK_ENTRIES,
        }
    }

    /// Store under the platform cache directory for `channel`.
    #[must_use]
    pub fn for_channel(channel: Channel) -> Self {
        Self::new(archive_cache_dir(channel))
    }

    #[must_use]
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key_file_name(&key.namespace))
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.namespace_dir(key)
            .join(format!("{}.bin", key_file_name(&key.encode())))
    }

    fn read_entry(path: &Path) -> Result<Option<Bytes>, PkgError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < DIGEST_LEN || !verify_digest(&bytes[DIGEST_LEN..], &bytes[..DIGEST_LEN]) {
            warn!(path = %path.display(), "discarding corrupt cache entry");
            remove_file_if_exists(path)?;
            return Ok(None);
        }
        let mut bytes = Bytes::from(bytes);
        Ok(Some(bytes.split_off(DIGEST_LEN)))
    }

    fn write_entry(&self, key: &CacheKey, data: &[u8]) -> Result<(), PkgError> {
        let dir = self.namespace_dir(key);
        let path = self.entry_path(key);
        let mut framed = Vec::with_capacity(DIGEST_LEN + data.len());
        framed.extend_from_slice(&blake3_digest(data));
        framed.extend_from_slice(data);
        atomic_write(&path, &framed)?;

        let index_path = dir.join("index.json");
        let mut index: NamespaceIndex = fs::read(&index_path)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default();
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        index.entries.retain(|e| *e != file);
        index.entries.push(file);

        while index.entries.len() > self.max_entries {
            let evicted = index.entries.remove(0);
            debug!(namespace = %key.namespace, file = %evicted, "evicting cache entry");
            remove_file_if_exists(&dir.join(&evicted))?;
        }

        let encoded = serde_json::to_vec(&index)
            .map_err(|e| PkgError::cache_error(format!("Failed to encode cache index: {e}")))?;
        atomic_write(&index_path, &encoded)?;
        Ok(())
    }
}

#[async_trait]
impl ArchiveStore for DiskStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, PkgError> {
        let path = self.entry_path(key);
        tokio::task::spawn_blocking(move || Self::read_entry(&path))
            .await
            .map_err(|e| PkgError::cache_error(e.to_string()))?
    }

    async fn put(&self, key: &CacheKey, data: Bytes) -> Result<(), PkgError> {
        let store = self.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || store.write_entry(&key, &data))
            .await
            .map_err(|e| PkgError::cache_error(e.to_string()))?
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), PkgError> {
        let path = self.entry_path(key);
        tokio::task::spawn_blocking(move || remove_file_if_exists(&path).map_err(PkgError::from))
            .await
            .map_err(|e| PkgError::cache_error(e.to_string()))?
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: usize,
    pub store_hits: usize,
    pub fetches: usize,
}

/// Archive cache in front of a fetcher.
pub struct ArchiveCache {
    memory: Mutex<LruCache<String, Bytes>>,
    store: Option<Arc<dyn ArchiveStore>>,
    fetcher: Arc<dyn TarballFetcher>,
    locks: NamespaceLocks,
    memory_hits: AtomicUsize,
    store_hits: AtomicUsize,
    fetches: AtomicUsize,
}

impl std::fmt::Debug for ArchiveCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveCache")
            .field("persistent", &self.store.is_some())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ArchiveCache {
    #[must_use]
    pub fn new(fetcher: Arc<dyn TarballFetcher>) -> Self {
        Self {
            memory: Mutex::new(LruCache::new(DEFAULT_MEMORY_ENTRIES)),
            store: None,
            fetcher,
            locks: NamespaceLocks::new(),
            memory_hits: AtomicUsize::new(0),
            store_hits: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ArchiveStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_memory_capacity(mut self, entries: usize) -> Self {
        self.memory = Mutex::new(LruCache::new(entries.max(1)));
        self
    }

    fn memory(&self) -> MutexGuard<'_, LruCache<String, Bytes>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            store_hits: self.store_hits.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
        }
    }

    /// Archive bytes for `url`.
    pub async fn fetch(&self, url: &str) -> Result<Bytes, PkgError> {
        self.get_or_fetch(&CacheKey::archive(url), url).await
    }

    /// Look `key` up across the tiers, fetching `url` on a miss.
    pub async fn get_or_fetch(&self, key: &CacheKey, url: &str) -> Result<Bytes, PkgError> {
        let encoded = key.encode();
        if let Some(hit) = self.memory().get(&encoded).cloned() {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        if let Some(store) = &self.store {
            match store.get(key).await {
                Ok(Some(hit)) => {
                    self.store_hits.fetch_add(1, Ordering::Relaxed);
                    self.memory().insert(encoded, hit.clone());
                    return Ok(hit);
                }
                Ok(None) => {}
                Err(e) => debug!(url, error = %e, "archive store read failed"),
            }
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let bytes = self.fetcher.fetch(url).await?;
        self.memory().insert(encoded, bytes.clone());

        if let Some(store) = &self.store {
            let _guard = self.locks.lock(&key.namespace).await;
            if let Err(e) = store.put(key, bytes.clone()).await {
                debug!(url, error = %e, "archive store write failed");
            }
        }
        Ok(bytes)
    }

    /// Drop `key` from every tier, e.g. after its bytes failed verification.
    pub async fn invalidate(&self, key: &CacheKey) {
        self.memory().remove(&key.encode());
        if let Some(store) = &self.store {
            let _guard = self.locks.lock(&key.namespace).await;
            if let Err(e) = store.remove(key).await {
                debug!(key = %key.raw, error = %e, "archive store remove failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TarballFetcher for CountingFetcher {
        async fn fetch(&self, url: &str) -> Result<Bytes, PkgError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from(format!("bytes of {url}")))
        }
    }

    fn fetcher() -> Arc<CountingFetcher> {
        Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_key_encoding() {
        let key = CacheKey::archive("https://registry.npmjs.org/a/-/a-1.0.0.tgz").with_epoch(3);
        assert_eq!(
            key.encode(),
            format!(
                "{SCHEMA_VERSION}:3:node:tarballs:registry.npmjs.org:https://registry.npmjs.org/a/-/a-1.0.0.tgz"
            )
        );
    }

    #[test]
    fn test_runtime_partitions_keys() {
        let node = CacheKey::archive("https://example.com/a.tgz");
        let bun = node.clone().with_runtime("bun");
        assert_ne!(node.encode(), bun.encode());
        assert!(bun.encode().contains(":bun:tarballs:"));
    }

    #[tokio::test]
    async fn test_memory_capacity_evicts_least_recent() {
        let fetcher = fetcher();
        let cache = ArchiveCache::new(fetcher.clone()).with_memory_capacity(1);

        cache.fetch("https://example.com/one.tgz").await.unwrap();
        cache.fetch("https://example.com/two.tgz").await.unwrap();
        cache.fetch("https://example.com/one.tgz").await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_memory_tier_serves_repeat_requests() {
        let fetcher = fetcher();
        let cache = ArchiveCache::new(fetcher.clone());
        let url = "https://example.com/a.tgz";

        let first = cache.fetch(url).await.unwrap();
        let second = cache.fetch(url).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().memory_hits, 1);
    }

    #[tokio::test]
    async fn test_disk_tier_survives_new_cache() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DiskStore::new(dir.path().to_path_buf()));
        let url = "https://example.com/b.tgz";

        let fetcher_a = fetcher();
        ArchiveCache::new(fetcher_a.clone())
            .with_store(store.clone())
            .fetch(url)
            .await
            .unwrap();

        let fetcher_b = fetcher();
        let cache = ArchiveCache::new(fetcher_b.clone()).with_store(store);
        let bytes = cache.fetch(url).await.unwrap();
        assert_eq!(bytes, Bytes::from(format!("bytes of {url}")));
        assert_eq!(fetcher_b.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.stats().store_hits, 1);
    }

    #[tokio::test]
    async fn test_invalidate_clears_both_tiers() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DiskStore::new(dir.path().to_path_buf()));
        let fetcher = fetcher();
        let cache = ArchiveCache::new(fetcher.clone()).with_store(store.clone());
        let url = "https://example.com/d.tgz";
        let key = CacheKey::archive(url);

        cache.fetch(url).await.unwrap();
        cache.invalidate(&key).await;
        assert!(store.get(&key).await.unwrap().is_none());

        cache.fetch(url).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_corrupt_disk_entry_is_a_miss() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path().to_path_buf());
        let key = CacheKey::archive("https://example.com/c.tgz");
        store.put(&key, Bytes::from_static(b"payload")).await.unwrap();

        let path = store.entry_path(&key);
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&path, raw).unwrap();

        assert!(store.get(&key).await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_disk_eviction_is_oldest_first() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path().to_path_buf()).with_max_entries(2);
        let keys: Vec<CacheKey> = ["a", "b", "c"]
            .iter()
            .map(|n| CacheKey::archive(&format!("https://example.com/{n}.tgz")))
            .collect();
        for key in &keys {
            store.put(key, Bytes::from_static(b"x")).await.unwrap();
        }

        assert!(store.get(&keys[0]).await.unwrap().is_none());
        assert!(store.get(&keys[1]).await.unwrap().is_some());
        assert!(store.get(&keys[2]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_namespace_lock_serializes_writers() {
        let locks = Arc::new(NamespaceLocks::new());
        let guard = locks.lock("tarballs").await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.lock("tarballs").await;
            })
        };
        let other = locks.lock("metadata").await;
        drop(other);

        tokio::task::yield_now().await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }
}
