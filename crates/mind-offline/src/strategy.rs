//! The three caching strategies.
//!
//! Each strategy owns its request end-to-end and is terminal for network
//! failures: it always produces a [`Served`] response. Only a failing cache
//! store escapes, as `Err(CacheError)`, which the caller treats as a handler
//! failure.

use crate::config::WorkerConfig;
use crate::fetch::{FetchError, Fetcher, NetworkResponse};
use crate::metrics::SwMetrics;
use crate::request::InterceptedRequest;
use crate::response::Served;
use crate::router::Strategy;
use mind_cache::{CacheError, CacheKey, CacheStore};
use std::sync::Arc;
use tokio_util::task::TaskTracker;

/// Everything a strategy needs, injected at construction.
#[derive(Clone)]
pub struct StrategyContext {
    pub config: Arc<WorkerConfig>,
    pub store: Arc<dyn CacheStore>,
    pub fetcher: Arc<dyn Fetcher>,
    pub metrics: Arc<SwMetrics>,
    /// Background revalidations are spawned here so they can be awaited.
    pub background: TaskTracker,
}

impl StrategyContext {
    /// One network fetch, bounded by the configured timeout.
    pub async fn fetch(&self, req: &InterceptedRequest) -> Result<NetworkResponse, FetchError> {
        match self.config.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, self.fetcher.fetch(req))
                .await
                .map_err(|_| FetchError::Timeout(limit))?,
            None => self.fetcher.fetch(req).await,
        }
    }

    async fn lookup(
        &self,
        strategy: Strategy,
        key: &CacheKey,
    ) -> Result<Option<Arc<mind_cache::CachedResponse>>, CacheError> {
        let found = self.store.match_key(key).await?;
        self.metrics.record_lookup(strategy, found.is_some());
        Ok(found)
    }

    /// Store a copy of a storable response. A failed write is logged; the
    /// caller still has the network response to serve.
    async fn store_copy(&self, key: CacheKey, resp: &NetworkResponse) -> bool {
        if !resp.may_store(&key) {
            return false;
        }
        match self.store.put(key.clone(), resp.to_cached()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "failed to store response copy");
                false
            }
        }
    }
}

/// Run `strategy` for `req`.
pub async fn respond(
    ctx: &StrategyContext,
    strategy: Strategy,
    req: &InterceptedRequest,
) -> Result<Served, CacheError> {
    match strategy {
        Strategy::CacheFirst => cache_first(ctx, req).await,
        Strategy::NetworkFirst => network_first(ctx, req).await,
        Strategy::StaleWhileRevalidate => stale_while_revalidate(ctx, req).await,
    }
}

/// Serve from the store; only hit the network on a miss. Never revalidates
/// a hit.
pub async fn cache_first(
    ctx: &StrategyContext,
    req: &InterceptedRequest,
) -> Result<Served, CacheError> {
    // Static assets are the same for every client.
    let key = req.shared_cache_key();
    if let Some(cached) = ctx.lookup(Strategy::CacheFirst, &key).await? {
        return Ok(Served::from_cache(&cached));
    }

    match ctx.fetch(req).await {
        Ok(resp) => {
            ctx.store_copy(key, &resp).await;
            Ok(Served::from_network(resp))
        }
        Err(e) => {
            tracing::debug!(error = %e, url = %req.url, "cache-first fetch failed");
            ctx.metrics.record_network_failure(Strategy::CacheFirst, &e);
            Ok(Served::unavailable())
        }
    }
}

/// Prefer the network; the store is the last resort.
pub async fn network_first(
    ctx: &StrategyContext,
    req: &InterceptedRequest,
) -> Result<Served, CacheError> {
    let key = req.cache_key();
    match ctx.fetch(req).await {
        Ok(resp) => {
            ctx.store_copy(key, &resp).await;
            Ok(Served::from_network(resp))
        }
        Err(e) => {
            tracing::debug!(error = %e, url = %req.url, "network-first fetch failed, trying cache");
            ctx.metrics.record_network_failure(Strategy::NetworkFirst, &e);
            Ok(match ctx.lookup(Strategy::NetworkFirst, &key).await? {
                Some(cached) => Served::from_cache(&cached),
                None => Served::unavailable(),
            })
        }
    }
}

/// Serve the cached copy at once and refresh it in the background.
///
/// The refresh runs on `ctx.background` whether or not a cached copy
/// exists; without one, the caller waits for that same fetch. A failed
/// refresh never mutates the store and never reaches the caller, but it is
/// logged and counted.
pub async fn stale_while_revalidate(
    ctx: &StrategyContext,
    req: &InterceptedRequest,
) -> Result<Served, CacheError> {
    let key = req.cache_key();
    let cached = ctx.lookup(Strategy::StaleWhileRevalidate, &key).await?;

    let revalidation = {
        let ctx = ctx.clone();
        let req = req.clone();
        ctx.background.clone().spawn(async move { revalidate(&ctx, &req).await })
    };

    if let Some(cached) = cached {
        return Ok(Served::from_cache(&cached));
    }

    let fresh = match revalidation.await {
        Ok(fresh) => fresh,
        Err(e) => {
            tracing::error!(error = %e, url = %req.url, "revalidation task panicked");
            None
        }
    };
    if let Some(resp) = fresh {
        return Ok(Served::from_network(resp));
    }

    let offline_key = CacheKey::get(ctx.config.resolve(&ctx.config.offline_path));
    Ok(match ctx.store.match_key(&offline_key).await? {
        Some(page) => Served::offline_fallback(&page),
        None => Served::offline(),
    })
}

async fn revalidate(ctx: &StrategyContext, req: &InterceptedRequest) -> Option<NetworkResponse> {
    match ctx.fetch(req).await {
        Ok(resp) => {
            let stored = ctx.store_copy(req.cache_key(), &resp).await;
            tracing::debug!(url = %req.url, status = resp.status, stored, "revalidated");
            ctx.metrics.record_revalidation(true);
            Some(resp)
        }
        Err(e) => {
            tracing::warn!(error = %e, url = %req.url, "background revalidation failed");
            ctx.metrics.record_network_failure(Strategy::StaleWhileRevalidate, &e);
            ctx.metrics.record_revalidation(false);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Source;
    use crate::test_utils::{context, MockFetcher};
    use bytes::Bytes;
    use mind_cache::CachedResponse;
    use std::time::Duration;

    fn stored(body: &'static str) -> CachedResponse {
        CachedResponse::new(200, vec![], Bytes::from_static(body.as_bytes()))
    }

    #[tokio::test]
    async fn cache_first_miss_then_hit() {
        let fetcher = MockFetcher::new();
        let ctx = context(&fetcher);
        let req = InterceptedRequest::get(&ctx.config, "/dashboard/chunk-abc123.js");
        fetcher.respond(&req.url, 200, "chunk");

        let first = cache_first(&ctx, &req).await.unwrap();
        assert_eq!(first.source, Source::Network);
        assert_eq!(first.body, Bytes::from_static(b"chunk"));
        assert_eq!(fetcher.calls(&req.url), 1);
        assert!(ctx.store.match_key(&req.cache_key()).await.unwrap().is_some());

        let second = cache_first(&ctx, &req).await.unwrap();
        assert_eq!(second.source, Source::Cache);
        assert_eq!(second.body, Bytes::from_static(b"chunk"));
        assert_eq!(fetcher.calls(&req.url), 1);
    }

    #[tokio::test]
    async fn cache_first_hit_never_touches_network() {
        let fetcher = MockFetcher::new();
        let ctx = context(&fetcher);
        let req = InterceptedRequest::get(&ctx.config, "/icons/icon-192.png");
        ctx.store.put(req.cache_key(), stored("png-bytes")).await.unwrap();

        let served = cache_first(&ctx, &req).await.unwrap();
        assert_eq!(served.source, Source::Cache);
        assert_eq!(served.body, Bytes::from_static(b"png-bytes"));
        assert_eq!(fetcher.total_calls(), 0);
    }

    #[tokio::test]
    async fn cache_first_does_not_store_errors() {
        let fetcher = MockFetcher::new();
        let ctx = context(&fetcher);
        let req = InterceptedRequest::get(&ctx.config, "/missing.js");
        fetcher.respond(&req.url, 404, "not found");

        let served = cache_first(&ctx, &req).await.unwrap();
        assert_eq!(served.status, 404);
        assert!(ctx.store.match_key(&req.cache_key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cache_first_offline_is_empty_503() {
        let fetcher = MockFetcher::new();
        let ctx = context(&fetcher);
        let req = InterceptedRequest::get(&ctx.config, "/app.css");
        fetcher.fail(&req.url);

        let served = cache_first(&ctx, &req).await.unwrap();
        assert_eq!(served.status, 503);
        assert_eq!(served.source, Source::Synthetic);
        assert!(served.body.is_empty());
        assert_eq!(ctx.metrics.network_failures(Strategy::CacheFirst), 1);
    }

    #[tokio::test]
    async fn network_first_prefers_network_and_stores() {
        let fetcher = MockFetcher::new();
        let ctx = context(&fetcher);
        let req = InterceptedRequest::get(&ctx.config, "/feed?page=2");
        ctx.store.put(req.cache_key(), stored("old")).await.unwrap();
        fetcher.respond(&req.url, 200, "new");

        let served = network_first(&ctx, &req).await.unwrap();
        assert_eq!(served.source, Source::Network);
        assert_eq!(served.body, Bytes::from_static(b"new"));

        let entry = ctx.store.match_key(&req.cache_key()).await.unwrap().unwrap();
        assert_eq!(entry.body, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn network_first_falls_back_to_cache() {
        let fetcher = MockFetcher::new();
        let ctx = context(&fetcher);
        let req = InterceptedRequest::get(&ctx.config, "/feed");
        ctx.store.put(req.cache_key(), stored("cached feed")).await.unwrap();
        fetcher.fail(&req.url);

        let served = network_first(&ctx, &req).await.unwrap();
        assert_eq!(served.source, Source::Cache);
        assert_eq!(served.body, Bytes::from_static(b"cached feed"));
    }

    #[tokio::test]
    async fn network_first_without_cache_is_503() {
        let fetcher = MockFetcher::new();
        let ctx = context(&fetcher);
        let req = InterceptedRequest::get(&ctx.config, "/feed");
        fetcher.fail(&req.url);

        let served = network_first(&ctx, &req).await.unwrap();
        assert_eq!(served.status, 503);
        assert!(served.body.is_empty());
    }

    #[tokio::test]
    async fn network_first_returns_server_errors_as_is() {
        let fetcher = MockFetcher::new();
        let ctx = context(&fetcher);
        let req = InterceptedRequest::get(&ctx.config, "/feed");
        ctx.store.put(req.cache_key(), stored("cached feed")).await.unwrap();
        fetcher.respond(&req.url, 500, "boom");

        let served = network_first(&ctx, &req).await.unwrap();
        assert_eq!(served.status, 500);
        let entry = ctx.store.match_key(&req.cache_key()).await.unwrap().unwrap();
        assert_eq!(entry.body, Bytes::from_static(b"cached feed"));
    }

    #[tokio::test]
    async fn swr_returns_stale_copy_without_waiting() {
        let fetcher = MockFetcher::new();
        let ctx = context(&fetcher);
        let req = InterceptedRequest::navigate(&ctx.config, "/");
        ctx.store.put(req.cache_key(), stored("stale")).await.unwrap();
        let gate = fetcher.respond_after_release(&req.url, 200, "fresh");

        // The network never answers until released; the response must not wait for it.
        let served = tokio::time::timeout(
            Duration::from_secs(1),
            stale_while_revalidate(&ctx, &req),
        )
        .await
        .expect("stale response must not wait for the network")
        .unwrap();
        assert_eq!(served.source, Source::Cache);
        assert_eq!(served.body, Bytes::from_static(b"stale"));

        gate.notify_one();
        ctx.background.close();
        ctx.background.wait().await;

        let again = stale_while_revalidate(&ctx, &req).await.unwrap();
        assert_eq!(again.body, Bytes::from_static(b"fresh"));
    }

    #[tokio::test]
    async fn swr_failed_revalidation_is_swallowed_and_counted() {
        let fetcher = MockFetcher::new();
        let ctx = context(&fetcher);
        let req = InterceptedRequest::navigate(&ctx.config, "/");
        ctx.store.put(req.cache_key(), stored("stale")).await.unwrap();
        fetcher.fail(&req.url);

        let served = stale_while_revalidate(&ctx, &req).await.unwrap();
        assert_eq!(served.body, Bytes::from_static(b"stale"));

        ctx.background.close();
        ctx.background.wait().await;

        assert_eq!(ctx.metrics.revalidation_failures(), 1);
        let entry = ctx.store.match_key(&req.cache_key()).await.unwrap().unwrap();
        assert_eq!(entry.body, Bytes::from_static(b"stale"));
    }

    #[tokio::test]
    async fn swr_without_cache_waits_for_network() {
        let fetcher = MockFetcher::new();
        let ctx = context(&fetcher);
        let req = InterceptedRequest::navigate(&ctx.config, "/");
        fetcher.respond(&req.url, 200, "fresh");

        let served = stale_while_revalidate(&ctx, &req).await.unwrap();
        assert_eq!(served.source, Source::Network);
        assert_eq!(served.body, Bytes::from_static(b"fresh"));
        assert_eq!(fetcher.calls(&req.url), 1);
        assert!(ctx.store.match_key(&req.cache_key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn swr_offline_serves_offline_page() {
        let fetcher = MockFetcher::new();
        let ctx = context(&fetcher);
        let offline = CacheKey::get(ctx.config.resolve("/offline"));
        ctx.store.put(offline, stored("<h1>You're offline</h1>")).await.unwrap();
        let req = InterceptedRequest::navigate(&ctx.config, "/share");
        fetcher.fail(&req.url);

        let served = stale_while_revalidate(&ctx, &req).await.unwrap();
        assert_eq!(served.source, Source::OfflineFallback);
        assert_eq!(served.status, 200);
        assert_eq!(served.body, Bytes::from_static(b"<h1>You're offline</h1>"));
    }

    #[tokio::test]
    async fn swr_offline_without_page_is_plain_text() {
        let fetcher = MockFetcher::new();
        let ctx = context(&fetcher);
        let req = InterceptedRequest::navigate(&ctx.config, "/");
        fetcher.fail(&req.url);

        let served = stale_while_revalidate(&ctx, &req).await.unwrap();
        assert_eq!(served.status, 503);
        assert_eq!(served.body, Bytes::from_static(b"Offline"));
        assert_eq!(
            served.headers,
            vec![("content-type".to_string(), "text/plain".to_string())]
        );
    }

    #[tokio::test]
    async fn fetch_timeout_counts_as_network_failure() {
        let fetcher = MockFetcher::new();
        let mut ctx = context(&fetcher);
        ctx.config = Arc::new(WorkerConfig {
            fetch_timeout: Some(Duration::from_millis(20)),
            ..(*ctx.config).clone()
        });
        let req = InterceptedRequest::get(&ctx.config, "/feed");
        let _gate = fetcher.respond_after_release(&req.url, 200, "never");

        let served = network_first(&ctx, &req).await.unwrap();
        assert_eq!(served.status, 503);
        assert_eq!(ctx.metrics.network_failures(Strategy::NetworkFirst), 1);
    }

    #[tokio::test]
    async fn broken_store_escapes_as_error() {
        let fetcher = MockFetcher::new();
        let mut ctx = context(&fetcher);
        ctx.store = Arc::new(crate::test_utils::BrokenStore);
        let req = InterceptedRequest::get(&ctx.config, "/app.js");
        fetcher.respond(&req.url, 200, "x");

        assert!(cache_first(&ctx, &req).await.is_err());
        assert_eq!(fetcher.total_calls(), 0);
    }
}
