//! On-disk cache storage.
//!
//! Layout: one directory per store under the storage root, named by the
//! hex-encoded store name. Each entry is a single file named by the SHA-256
//! of its key, holding one line of JSON metadata followed by the raw body.
//! Entries are written to a temp file and renamed into place, so readers
//! always see a complete entry and concurrent writers resolve last-rename-wins.

use crate::error::CacheError;
use crate::traits::{check_cacheable, CacheKey, CacheStats, CacheStorage, CacheStore, CachedResponse};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

const ENTRY_EXT: &str = "entry";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize, Deserialize)]
struct EntryMeta {
    method: String,
    url: String,
    #[serde(default)]
    partition: Option<String>,
    status: u16,
    headers: Vec<(String, String)>,
    stored_at_ms: u64,
}

fn entry_file_name(key: &CacheKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.method.as_bytes());
    hasher.update(b" ");
    hasher.update(key.url.as_bytes());
    if let Some(partition) = &key.partition {
        hasher.update(b" ");
        hasher.update(partition.as_bytes());
    }
    format!("{}.{ENTRY_EXT}", hex::encode(hasher.finalize()))
}

fn encode_entry(key: &CacheKey, value: &CachedResponse) -> Result<Vec<u8>, CacheError> {
    let stored_at_ms = value
        .stored_at
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let meta = EntryMeta {
        method: key.method.clone(),
        url: key.url.clone(),
        partition: key.partition.clone(),
        status: value.status,
        headers: value.headers.clone(),
        stored_at_ms,
    };

    let mut buf = serde_json::to_vec(&meta)?;
    buf.push(b'\n');
    buf.extend_from_slice(&value.body);
    Ok(buf)
}

fn decode_entry(raw: Vec<u8>) -> Result<(CacheKey, CachedResponse), CacheError> {
    let split = raw
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| CacheError::Unavailable("entry has no metadata line".into()))?;
    let meta: EntryMeta = serde_json::from_slice(&raw[..split])?;
    let body = Bytes::from(raw).slice(split + 1..);

    let key = CacheKey {
        method: meta.method,
        url: meta.url,
        partition: meta.partition,
    };
    let value = CachedResponse {
        status: meta.status,
        headers: meta.headers,
        body,
        stored_at: UNIX_EPOCH + Duration::from_millis(meta.stored_at_ms),
    };
    Ok((key, value))
}

/// A single store backed by a directory.
pub struct DiskCache {
    name: String,
    dir: PathBuf,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    size: AtomicU64,
}

impl DiskCache {
    async fn open(name: &str, dir: PathBuf) -> Result<Self, CacheError> {
        tokio::fs::create_dir_all(&dir).await?;
        let cache = Self {
            name: name.to_string(),
            dir,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            size: AtomicU64::new(0),
        };
        let existing = cache.entry_paths().await?.len();
        cache.size.store(existing as u64, Ordering::Relaxed);
        Ok(cache)
    }

    async fn entry_paths(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut paths = Vec::new();
        let mut rd = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(paths),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXT) {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

#[async_trait]
impl CacheStore for DiskCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_key(&self, key: &CacheKey) -> Result<Option<Arc<CachedResponse>>, CacheError> {
        let path = self.dir.join(entry_file_name(key));
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let (stored_key, value) = decode_entry(raw)?;
        if &stored_key != key {
            // SHA-256 collision or a foreign file; treat as a miss.
            tracing::warn!(cache = %self.name, key = %key, "disk entry key mismatch");
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(Arc::new(value)))
    }

    async fn put(&self, key: CacheKey, value: CachedResponse) -> Result<(), CacheError> {
        check_cacheable(&key, &value)?;

        let final_path = self.dir.join(entry_file_name(&key));
        let tmp_path = self.dir.join(format!(
            ".tmp-{}-{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let existed = tokio::fs::try_exists(&final_path).await?;
        tokio::fs::write(&tmp_path, encode_entry(&key, &value)?).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        if !existed {
            self.size.fetch_add(1, Ordering::Relaxed);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        match tokio::fs::remove_file(self.dir.join(entry_file_name(key))).await {
            Ok(()) => {
                self.size.fetch_sub(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<CacheKey>, CacheError> {
        let mut keys = Vec::new();
        for path in self.entry_paths().await? {
            match tokio::fs::read(&path).await {
                Ok(raw) => keys.push(decode_entry(raw)?.0),
                // Deleted between listing and reading.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(keys)
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            current_size: self.size.load(Ordering::Relaxed) as usize,
        }
    }
}

/// Named stores persisted under a root directory. Survives process restarts.
pub struct DiskCacheStorage {
    root: PathBuf,
    opened: RwLock<HashMap<String, Arc<DiskCache>>>,
}

impl DiskCacheStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            opened: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_dir(&self, name: &str) -> PathBuf {
        self.root.join(hex::encode(name.as_bytes()))
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheStore>, CacheError> {
        if let Some(existing) = self.opened.read().get(name) {
            return Ok(Arc::clone(existing) as Arc<dyn CacheStore>);
        }

        let cache = Arc::new(DiskCache::open(name, self.store_dir(name)).await?);
        let mut opened = self.opened.write();
        let cache = opened.entry(name.to_string()).or_insert(cache);
        tracing::debug!(cache = name, root = %self.root.display(), "disk cache opened");
        Ok(Arc::clone(cache) as Arc<dyn CacheStore>)
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(tokio::fs::try_exists(self.store_dir(name)).await?)
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        self.opened.write().remove(name);
        match tokio::fs::remove_dir_all(self.store_dir(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut names = Vec::new();
        let mut rd = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let decoded = entry
                .file_name()
                .to_str()
                .and_then(|n| hex::decode(n).ok())
                .and_then(|b| String::from_utf8(b).ok());
            if let Some(name) = decoded {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn backend(&self) -> &'static str {
        "disk"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(body: &'static [u8]) -> CachedResponse {
        CachedResponse::new(
            200,
            vec![("content-type".into(), "text/html".into())],
            Bytes::from_static(body),
        )
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::get("http://origin/offline");

        {
            let storage = DiskCacheStorage::new(dir.path());
            let cache = storage.open("mind-v2").await.unwrap();
            cache.put(key.clone(), resp(b"<h1>offline</h1>")).await.unwrap();
        }

        let storage = DiskCacheStorage::new(dir.path());
        assert_eq!(storage.keys().await.unwrap(), vec!["mind-v2".to_string()]);
        let cache = storage.open("mind-v2").await.unwrap();
        let hit = cache.match_key(&key).await.unwrap().unwrap();
        assert_eq!(hit.status, 200);
        assert_eq!(hit.body, Bytes::from_static(b"<h1>offline</h1>"));
        assert_eq!(hit.header("Content-Type"), Some("text/html"));
        assert_eq!(cache.stats().current_size, 1);
    }

    #[tokio::test]
    async fn body_may_contain_newlines() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskCacheStorage::new(dir.path());
        let cache = storage.open("mind-v2").await.unwrap();
        let key = CacheKey::get("http://origin/app.css");

        cache.put(key.clone(), resp(b"a {\n  color: red;\n}\n")).await.unwrap();
        let hit = cache.match_key(&key).await.unwrap().unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"a {\n  color: red;\n}\n"));
    }

    #[tokio::test]
    async fn overwrite_keeps_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskCacheStorage::new(dir.path());
        let cache = storage.open("mind-v2").await.unwrap();
        let key = CacheKey::get("http://origin/");

        cache.put(key.clone(), resp(b"old")).await.unwrap();
        cache.put(key.clone(), resp(b"new")).await.unwrap();

        assert_eq!(cache.keys().await.unwrap(), vec![key.clone()]);
        assert_eq!(cache.stats().current_size, 1);
        let hit = cache.match_key(&key).await.unwrap().unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn session_entries_are_stored_apart() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskCacheStorage::new(dir.path());
        let cache = storage.open("mind-v2").await.unwrap();
        let alice = CacheKey::get("http://origin/").partitioned("session=ALICE");
        let bob = CacheKey::get("http://origin/").partitioned("session=BOB");

        cache.put(alice.clone(), resp(b"alice feed")).await.unwrap();
        assert!(cache.match_key(&bob).await.unwrap().is_none());
        assert!(cache.match_key(&CacheKey::get("http://origin/")).await.unwrap().is_none());

        let reopened = DiskCacheStorage::new(dir.path()).open("mind-v2").await.unwrap();
        let hit = reopened.match_key(&alice).await.unwrap().unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"alice feed"));
        assert_eq!(reopened.keys().await.unwrap(), vec![alice]);
    }

    #[tokio::test]
    async fn delete_store_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskCacheStorage::new(dir.path());
        let cache = storage.open("mind-v1").await.unwrap();
        let key = CacheKey::get("http://origin/login");
        cache.put(key.clone(), resp(b"login")).await.unwrap();

        assert!(cache.delete(&key).await.unwrap());
        assert!(!cache.delete(&key).await.unwrap());

        assert!(storage.delete("mind-v1").await.unwrap());
        assert!(!storage.has("mind-v1").await.unwrap());
        assert!(!storage.delete("mind-v1").await.unwrap());
    }

    #[tokio::test]
    async fn missing_root_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskCacheStorage::new(dir.path().join("not-yet"));
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_non_success() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskCacheStorage::new(dir.path());
        let cache = storage.open("mind-v2").await.unwrap();
        let bad = CachedResponse::new(503, vec![], Bytes::new());
        assert!(matches!(
            cache.put(CacheKey::get("http://origin/"), bad).await,
            Err(CacheError::StatusNotCacheable(503))
        ));
        assert!(cache.keys().await.unwrap().is_empty());
    }
}
