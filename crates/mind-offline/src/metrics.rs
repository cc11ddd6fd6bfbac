use crate::fetch::FetchError;
use crate::proxy::AppState;
use crate::response::Source;
use crate::router::{PassReason, Strategy};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Worker counters. Every record also feeds the Prometheus recorder, when
/// one is installed.
pub struct SwMetrics {
    started: Instant,
    requests: [AtomicU64; 3],
    cache_hits: [AtomicU64; 3],
    cache_misses: [AtomicU64; 3],
    network_failures: [AtomicU64; 3],
    pass_through: AtomicU64,
    handler_failures: AtomicU64,
    revalidations: AtomicU64,
    revalidation_failures: AtomicU64,
    latency_us: [Mutex<Histogram<u64>>; 3],
}

impl SwMetrics {
    pub fn new() -> Self {
        let histogram = || {
            // 1µs .. 10min, 3 significant figures. Constant bounds cannot fail.
            Mutex::new(
                Histogram::new_with_bounds(1, 600_000_000, 3).expect("valid histogram bounds"),
            )
        };
        Self {
            started: Instant::now(),
            requests: Default::default(),
            cache_hits: Default::default(),
            cache_misses: Default::default(),
            network_failures: Default::default(),
            pass_through: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            revalidations: AtomicU64::new(0),
            revalidation_failures: AtomicU64::new(0),
            latency_us: [histogram(), histogram(), histogram()],
        }
    }

    pub fn record_pass_through(&self, reason: PassReason) {
        self.pass_through.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mind_sw_pass_through_total", "reason" => reason.as_str()).increment(1);
    }

    pub fn record_served(&self, strategy: Strategy, source: Source, elapsed: Duration) {
        let i = strategy.index();
        self.requests[i].fetch_add(1, Ordering::Relaxed);
        let micros = (elapsed.as_micros() as u64).max(1);
        // Out-of-range samples are clamped rather than dropped.
        self.latency_us[i].lock().saturating_record(micros);

        metrics::counter!(
            "mind_sw_requests_total",
            "strategy" => strategy.as_str(),
            "source" => source.as_str()
        )
        .increment(1);
        metrics::histogram!("mind_sw_response_seconds", "strategy" => strategy.as_str())
            .record(elapsed.as_secs_f64());
    }

    pub fn record_lookup(&self, strategy: Strategy, hit: bool) {
        let i = strategy.index();
        if hit {
            self.cache_hits[i].fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses[i].fetch_add(1, Ordering::Relaxed);
        }
        metrics::counter!(
            "mind_sw_cache_lookups_total",
            "strategy" => strategy.as_str(),
            "result" => if hit { "hit" } else { "miss" }
        )
        .increment(1);
    }

    pub fn record_network_failure(&self, strategy: Strategy, error: &FetchError) {
        self.network_failures[strategy.index()].fetch_add(1, Ordering::Relaxed);
        let kind = match error {
            FetchError::Timeout(_) => "timeout",
            _ => "error",
        };
        metrics::counter!(
            "mind_sw_network_failures_total",
            "strategy" => strategy.as_str(),
            "kind" => kind
        )
        .increment(1);
    }

    /// Outcome of a stale-while-revalidate background refresh.
    pub fn record_revalidation(&self, ok: bool) {
        self.revalidations.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.revalidation_failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("mind_sw_revalidation_failures_total").increment(1);
        }
    }

    pub fn record_handler_failure(&self, strategy: Strategy) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mind_sw_handler_failures_total", "strategy" => strategy.as_str())
            .increment(1);
    }

    pub fn revalidation_failures(&self) -> u64 {
        self.revalidation_failures.load(Ordering::Relaxed)
    }

    pub fn network_failures(&self, strategy: Strategy) -> u64 {
        self.network_failures[strategy.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let strategies = Strategy::ALL
            .iter()
            .map(|&strategy| {
                let i = strategy.index();
                let hits = self.cache_hits[i].load(Ordering::Relaxed);
                let misses = self.cache_misses[i].load(Ordering::Relaxed);
                let lookups = hits + misses;
                let hist = self.latency_us[i].lock();
                StrategyMetrics {
                    strategy,
                    requests: self.requests[i].load(Ordering::Relaxed),
                    cache_hits: hits,
                    cache_misses: misses,
                    hit_rate: if lookups > 0 {
                        hits as f64 / lookups as f64
                    } else {
                        0.0
                    },
                    network_failures: self.network_failures[i].load(Ordering::Relaxed),
                    p50_us: hist.value_at_quantile(0.50),
                    p99_us: hist.value_at_quantile(0.99),
                    max_us: hist.max(),
                }
            })
            .collect();

        MetricsSnapshot {
            uptime_seconds: self.started.elapsed().as_secs(),
            pass_through: self.pass_through.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            revalidations: self.revalidations.load(Ordering::Relaxed),
            revalidation_failures: self.revalidation_failures(),
            strategies,
        }
    }
}

impl Default for SwMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub pass_through: u64,
    pub handler_failures: u64,
    pub revalidations: u64,
    pub revalidation_failures: u64,
    pub strategies: Vec<StrategyMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyMetrics {
    pub strategy: Strategy,
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate: f64,
    pub network_failures: u64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// GET /api/stats: one-shot stats endpoint.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registration = &state.registration;
    let controller = registration.controller();

    let caches = match registration.storage().keys().await {
        Ok(keys) => keys,
        Err(e) => {
            tracing::warn!(error = %e, "failed to list cache stores");
            Vec::new()
        }
    };

    Json(serde_json::json!({
        "backend": registration.storage().backend(),
        "controller": controller.as_ref().map(|w| w.summary()),
        "waiting": registration.waiting().map(|w| w.summary()),
        "caches": caches,
        "store": controller.as_ref().map(|w| w.context().store.stats()),
        "metrics": state.metrics.snapshot(),
    }))
}
