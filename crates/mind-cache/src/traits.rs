use crate::error::CacheError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Identity of a cached request: HTTP method plus absolute URL, optionally
/// scoped to one client session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
    /// SHA-256 of the client's credentials. `None` for entries shared by
    /// every client (app shell, static assets).
    #[serde(default)]
    pub partition: Option<String>,
}

impl CacheKey {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            partition: None,
        }
    }

    /// Key for a GET of `url`, the only method a store accepts.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    /// Scope the key to the session identified by `credentials` (the raw
    /// cookie / authorization values). Only a digest is kept.
    pub fn partitioned(mut self, credentials: &str) -> Self {
        self.partition = Some(hex::encode(Sha256::digest(credentials.as_bytes())));
        self
    }

    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)?;
        if let Some(partition) = &self.partition {
            write!(f, " [session {}]", partition.get(..8).unwrap_or(partition))?;
        }
        Ok(())
    }
}

/// Captured HTTP response held by a cache store.
#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub stored_at: SystemTime,
}

impl CachedResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            stored_at: SystemTime::now(),
        }
    }

    /// 2xx, the only statuses a store accepts.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Snapshot of per-store statistics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub current_size: usize,
}

/// Reject writes that would break the store invariants: GET only, 2xx only.
pub fn check_cacheable(key: &CacheKey, value: &CachedResponse) -> Result<(), CacheError> {
    if !key.is_get() {
        return Err(CacheError::MethodNotCacheable(key.method.clone()));
    }
    if !value.is_success() {
        return Err(CacheError::StatusNotCacheable(value.status));
    }
    Ok(())
}

/// A single named key-value store of captured responses.
///
/// Writes are last-write-wins per key. No multi-key transactions.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Name of the store (the cache generation it belongs to).
    fn name(&self) -> &str;

    /// Look up a request. Returns the stored response if present.
    async fn match_key(&self, key: &CacheKey) -> Result<Option<Arc<CachedResponse>>, CacheError>;

    /// Store a response, replacing any previous entry for the key.
    async fn put(&self, key: CacheKey, value: CachedResponse) -> Result<(), CacheError>;

    /// Remove an entry. Returns whether anything was removed.
    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// All keys currently stored.
    async fn keys(&self) -> Result<Vec<CacheKey>, CacheError>;

    /// Current statistics snapshot.
    fn stats(&self) -> CacheStats;
}

/// The set of named stores, one per cache generation.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a store by name, creating it if it doesn't exist.
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheStore>, CacheError>;

    /// Whether a store with this name exists.
    async fn has(&self, name: &str) -> Result<bool, CacheError>;

    /// Delete a store and everything in it. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;

    /// Names of all existing stores.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Human-readable backend name.
    fn backend(&self) -> &'static str;
}
