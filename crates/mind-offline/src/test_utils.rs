//! Shared fixtures for unit tests: a scripted fetcher and a broken store.

use crate::config::WorkerConfig;
use crate::fetch::{FetchError, Fetcher, NetworkResponse};
use crate::metrics::SwMetrics;
use crate::request::InterceptedRequest;
use crate::strategy::StrategyContext;
use async_trait::async_trait;
use bytes::Bytes;
use mind_cache::memory::MemoryCache;
use mind_cache::{CacheError, CacheKey, CacheStats, CacheStorage, CacheStore, CachedResponse};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::task::TaskTracker;

#[derive(Clone)]
enum Script {
    Respond(u16, Bytes),
    Fail,
    Gated(u16, Bytes, Arc<Notify>),
}

#[derive(Default)]
struct MockInner {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<HashMap<String, usize>>,
}

/// Fetcher whose answer per URL is scripted by the test. Unscripted URLs
/// fail like an unreachable network.
#[derive(Clone, Default)]
pub struct MockFetcher {
    inner: Arc<MockInner>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) {
        self.script(url, Script::Respond(status, Bytes::copy_from_slice(body.as_bytes())));
    }

    pub fn fail(&self, url: &str) {
        self.script(url, Script::Fail);
    }

    /// Answer only after the returned `Notify` is signalled.
    pub fn respond_after_release(&self, url: &str, status: u16, body: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.script(
            url,
            Script::Gated(status, Bytes::copy_from_slice(body.as_bytes()), Arc::clone(&gate)),
        );
        gate
    }

    pub fn calls(&self, url: &str) -> usize {
        self.inner.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.inner.calls.lock().values().sum()
    }

    fn script(&self, url: &str, script: Script) {
        self.inner.scripts.lock().insert(url.to_string(), script);
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, req: &InterceptedRequest) -> Result<NetworkResponse, FetchError> {
        *self.inner.calls.lock().entry(req.url.clone()).or_default() += 1;
        let script = self.inner.scripts.lock().get(&req.url).cloned();
        match script {
            Some(Script::Respond(status, body)) => Ok(NetworkResponse::new(status, body)),
            Some(Script::Gated(status, body, gate)) => {
                gate.notified().await;
                Ok(NetworkResponse::new(status, body))
            }
            Some(Script::Fail) | None => Err(FetchError::Connect(format!("{} unreachable", req.url))),
        }
    }
}

/// Strategy context over a fresh in-memory store and default config.
pub fn context(fetcher: &MockFetcher) -> StrategyContext {
    let config = WorkerConfig::default();
    StrategyContext {
        store: Arc::new(MemoryCache::new(config.cache_name.clone())),
        config: Arc::new(config),
        fetcher: Arc::new(fetcher.clone()),
        metrics: Arc::new(SwMetrics::new()),
        background: TaskTracker::new(),
    }
}

/// A store whose every operation fails.
pub struct BrokenStore;

#[async_trait]
impl CacheStore for BrokenStore {
    fn name(&self) -> &str {
        "broken"
    }

    async fn match_key(&self, _key: &CacheKey) -> Result<Option<Arc<CachedResponse>>, CacheError> {
        Err(CacheError::Unavailable("disk gone".into()))
    }

    async fn put(&self, _key: CacheKey, _value: CachedResponse) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("disk gone".into()))
    }

    async fn delete(&self, _key: &CacheKey) -> Result<bool, CacheError> {
        Err(CacheError::Unavailable("disk gone".into()))
    }

    async fn keys(&self) -> Result<Vec<CacheKey>, CacheError> {
        Err(CacheError::Unavailable("disk gone".into()))
    }

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

/// Storage that opens [`BrokenStore`]s and holds no named stores.
pub struct BrokenStorage;

#[async_trait]
impl CacheStorage for BrokenStorage {
    async fn open(&self, _name: &str) -> Result<Arc<dyn CacheStore>, CacheError> {
        Ok(Arc::new(BrokenStore))
    }

    async fn has(&self, _name: &str) -> Result<bool, CacheError> {
        Ok(false)
    }

    async fn delete(&self, _name: &str) -> Result<bool, CacheError> {
        Ok(false)
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(Vec::new())
    }

    fn backend(&self) -> &'static str {
        "broken"
    }
}
