use crate::error::CacheError;
use crate::traits::{check_cacheable, CacheKey, CacheStats, CacheStorage, CacheStore, CachedResponse};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Number of shards. Must be a power of two for fast modulo via bitmask.
const NUM_SHARDS: usize = 64;
const SHARD_MASK: u64 = (NUM_SHARDS as u64) - 1;

type Shard = RwLock<HashMap<CacheKey, Arc<CachedResponse>>>;

/// In-memory cache store.
///
/// Keys are spread across 64 independent shards, each behind its own
/// `RwLock`, so concurrent requests for different URLs rarely contend.
/// Lookups take a read lock on one shard; writes take a write lock on one
/// shard. Shard selection uses `ahash` with fixed seeds.
pub struct MemoryCache {
    name: String,
    shards: Box<[Shard; NUM_SHARDS]>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl MemoryCache {
    pub fn new(name: impl Into<String>) -> Self {
        let shards: Vec<Shard> = (0..NUM_SHARDS).map(|_| RwLock::new(HashMap::new())).collect();
        let shards: Box<[Shard; NUM_SHARDS]> = shards
            .into_boxed_slice()
            .try_into()
            .unwrap_or_else(|_| unreachable!());

        Self {
            name: name.into(),
            shards,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard(&self, key: &CacheKey) -> &Shard {
        let hash = ahash::RandomState::with_seeds(1, 2, 3, 4).hash_one(key);
        &self.shards[(hash & SHARD_MASK) as usize]
    }

    /// Total number of entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_key(&self, key: &CacheKey) -> Result<Option<Arc<CachedResponse>>, CacheError> {
        let found = self.shard(key).read().get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    async fn put(&self, key: CacheKey, value: CachedResponse) -> Result<(), CacheError> {
        check_cacheable(&key, &value)?;
        self.shard(&key).write().insert(key, Arc::new(value));
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(self.shard(key).write().remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<CacheKey>, CacheError> {
        Ok(self
            .shards
            .iter()
            .flat_map(|s| s.read().keys().cloned().collect::<Vec<_>>())
            .collect())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            current_size: self.len(),
        }
    }
}

/// In-memory set of named stores. Lives as long as the process.
#[derive(Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<Vec<Arc<MemoryCache>>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheStore>, CacheError> {
        if let Some(existing) = self.caches.read().iter().find(|c| c.name() == name) {
            return Ok(Arc::clone(existing) as Arc<dyn CacheStore>);
        }

        let mut caches = self.caches.write();
        // Another opener may have raced us between the two locks.
        if let Some(existing) = caches.iter().find(|c| c.name() == name) {
            return Ok(Arc::clone(existing) as Arc<dyn CacheStore>);
        }
        let cache = Arc::new(MemoryCache::new(name));
        caches.push(Arc::clone(&cache));
        tracing::debug!(cache = name, "memory cache created");
        Ok(cache)
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.read().iter().any(|c| c.name() == name))
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let mut caches = self.caches.write();
        let before = caches.len();
        caches.retain(|c| c.name() != name);
        Ok(caches.len() != before)
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.caches.read().iter().map(|c| c.name().to_string()).collect())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
