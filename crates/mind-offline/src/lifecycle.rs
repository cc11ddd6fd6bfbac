//! Worker lifecycle: install, activate, skip-waiting.
//!
//! A [`Registration`] owns at most one active worker (the controller) and
//! at most one waiting worker. Each deployment creates a fresh
//! [`ServiceWorker`] that walks
//! `installing → installed → activating → activated`, or ends up
//! `redundant` when its install fails or a newer worker replaces it.

use crate::config::WorkerConfig;
use crate::fetch::{FetchError, Fetcher};
use crate::metrics::SwMetrics;
use crate::request::InterceptedRequest;
use crate::response::Served;
use crate::router::{self, Disposition, PassReason, Strategy};
use crate::strategy::{self, StrategyContext};
use arc_swap::ArcSwapOption;
use futures_util::future::try_join_all;
use mind_cache::{CacheError, CacheStorage};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;

/// Control message that promotes a waiting worker.
pub const SKIP_WAITING_MESSAGE: &str = "skipWaiting";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

fn is_valid_transition(from: WorkerState, to: WorkerState) -> bool {
    use WorkerState::*;
    matches!(
        (from, to),
        (Installing, Installed) | (Installed, Activating) | (Activating, Activated)
    ) || (to == Redundant && from != Redundant)
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid worker state transition {from:?} -> {to:?}")]
    InvalidTransition { from: WorkerState, to: WorkerState },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("failed to fetch app shell entry {path}: {source}")]
    ShellFetch {
        path: String,
        #[source]
        source: FetchError,
    },

    #[error("app shell entry {path} answered {status}")]
    ShellStatus { path: String, status: u16 },
}

/// Notifications for pages, mirroring `statechange` and `controllerchange`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LifecycleEvent {
    StateChange {
        worker_id: u64,
        generation: String,
        from: WorkerState,
        to: WorkerState,
    },
    ControllerChange {
        worker_id: u64,
        generation: String,
    },
}

/// Result of handing one request to a worker.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; the caller sends it to the network untouched.
    PassThrough(PassReason),
    Responded { strategy: Strategy, served: Served },
    /// The strategy could not run (store unavailable). The caller falls
    /// back to the network, as if the request had not been intercepted.
    Failed { strategy: Strategy, error: CacheError },
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub id: u64,
    pub generation: String,
    pub state: WorkerState,
}

/// One deployment's worker: an immutable config, its cache store, and a
/// lifecycle state.
pub struct ServiceWorker {
    id: u64,
    ctx: StrategyContext,
    state: Mutex<WorkerState>,
    skip_waiting: AtomicBool,
}

impl ServiceWorker {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn generation(&self) -> &str {
        &self.ctx.config.cache_name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.ctx.config
    }

    pub fn context(&self) -> &StrategyContext {
        &self.ctx
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            id: self.id,
            generation: self.generation().to_string(),
            state: self.state(),
        }
    }

    /// Route a request and, when intercepted, run its strategy.
    pub async fn handle_fetch(&self, req: &InterceptedRequest) -> FetchOutcome {
        let strategy = match router::route(&self.ctx.config, req) {
            Disposition::PassThrough(reason) => {
                self.ctx.metrics.record_pass_through(reason);
                return FetchOutcome::PassThrough(reason);
            }
            Disposition::Respond(strategy) => strategy,
        };

        let start = Instant::now();
        match strategy::respond(&self.ctx, strategy, req).await {
            Ok(served) => {
                self.ctx
                    .metrics
                    .record_served(strategy, served.source, start.elapsed());
                tracing::debug!(
                    url = %req.url,
                    strategy = strategy.as_str(),
                    source = served.source.as_str(),
                    status = served.status,
                    latency_us = start.elapsed().as_micros(),
                    "served"
                );
                FetchOutcome::Responded { strategy, served }
            }
            Err(error) => {
                tracing::error!(error = %error, url = %req.url, strategy = strategy.as_str(), "strategy failed");
                self.ctx.metrics.record_handler_failure(strategy);
                FetchOutcome::Failed { strategy, error }
            }
        }
    }

    fn transition(
        &self,
        to: WorkerState,
        events: &broadcast::Sender<LifecycleEvent>,
    ) -> Result<(), LifecycleError> {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if !is_valid_transition(from, to) {
                return Err(LifecycleError::InvalidTransition { from, to });
            }
            *state = to;
            from
        };

        tracing::info!(
            worker = self.id,
            generation = self.generation(),
            ?from,
            ?to,
            "worker state changed"
        );
        // No subscribers is fine.
        let _ = events.send(LifecycleEvent::StateChange {
            worker_id: self.id,
            generation: self.generation().to_string(),
            from,
            to,
        });
        Ok(())
    }
}

/// What a control message did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageOutcome {
    Activated,
    NoWaitingWorker,
    Unrecognized,
}

/// Delete every store whose name is not `current`. Returns what was deleted.
/// Safe to call repeatedly.
pub async fn purge_stale_caches(
    storage: &dyn CacheStorage,
    current: &str,
) -> Result<Vec<String>, CacheError> {
    let mut deleted = Vec::new();
    for name in storage.keys().await? {
        if name != current && storage.delete(&name).await? {
            deleted.push(name);
        }
    }
    Ok(deleted)
}

/// The worker registration for the proxied origin.
pub struct Registration {
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    metrics: Arc<SwMetrics>,
    background: TaskTracker,
    active: ArcSwapOption<ServiceWorker>,
    waiting: Mutex<Option<Arc<ServiceWorker>>>,
    events: broadcast::Sender<LifecycleEvent>,
    next_id: AtomicU64,
    /// Serializes install/activate so two deployments never interleave.
    deploy_lock: tokio::sync::Mutex<()>,
}

impl Registration {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        metrics: Arc<SwMetrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            storage,
            fetcher,
            metrics,
            background: TaskTracker::new(),
            active: ArcSwapOption::empty(),
            waiting: Mutex::new(None),
            events,
            next_id: AtomicU64::new(1),
            deploy_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    /// The active worker, which handles every intercepted request.
    pub fn controller(&self) -> Option<Arc<ServiceWorker>> {
        self.active.load_full()
    }

    pub fn waiting(&self) -> Option<Arc<ServiceWorker>> {
        self.waiting.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Install a new worker for `config` and activate it when allowed:
    /// immediately if nothing is active or it asked to skip waiting,
    /// otherwise it stays waiting until a skip-waiting message.
    pub async fn deploy(&self, config: WorkerConfig) -> Result<Arc<ServiceWorker>, LifecycleError> {
        let _guard = self.deploy_lock.lock().await;

        let store = self.storage.open(&config.cache_name).await?;
        let worker = Arc::new(ServiceWorker {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            ctx: StrategyContext {
                config: Arc::new(config),
                store,
                fetcher: Arc::clone(&self.fetcher),
                metrics: Arc::clone(&self.metrics),
                background: self.background.clone(),
            },
            state: Mutex::new(WorkerState::Installing),
            skip_waiting: AtomicBool::new(false),
        });
        tracing::info!(worker = worker.id, generation = worker.generation(), "installing worker");

        if let Err(e) = self.install(&worker).await {
            tracing::error!(worker = worker.id, error = %e, "install failed");
            worker.transition(WorkerState::Redundant, &self.events)?;
            return Err(e);
        }

        let replaced = self.waiting.lock().replace(Arc::clone(&worker));
        if let Some(old) = replaced {
            old.transition(WorkerState::Redundant, &self.events)?;
        }

        if self.active.load().is_none() || worker.skip_waiting.load(Ordering::Relaxed) {
            self.activate_waiting().await?;
        } else {
            tracing::info!(worker = worker.id, "worker installed and waiting");
        }
        Ok(worker)
    }

    /// Handle a control message from a page.
    pub async fn post_message(&self, message: &str) -> Result<MessageOutcome, LifecycleError> {
        if message != SKIP_WAITING_MESSAGE {
            tracing::debug!(message, "ignoring unrecognized control message");
            return Ok(MessageOutcome::Unrecognized);
        }
        self.skip_waiting().await
    }

    /// Activate the waiting worker now, if there is one.
    pub async fn skip_waiting(&self) -> Result<MessageOutcome, LifecycleError> {
        let _guard = self.deploy_lock.lock().await;
        match self.waiting() {
            Some(worker) => {
                worker.skip_waiting.store(true, Ordering::Relaxed);
                self.activate_waiting().await?;
                Ok(MessageOutcome::Activated)
            }
            None => Ok(MessageOutcome::NoWaitingWorker),
        }
    }

    /// Close the background task tracker and wait for in-flight
    /// revalidations, up to `limit`.
    pub async fn drain(&self, limit: Duration) {
        self.background.close();
        if tokio::time::timeout(limit, self.background.wait()).await.is_err() {
            tracing::warn!(
                pending = self.background.len(),
                "gave up waiting for background revalidations"
            );
        }
    }

    /// Pre-populate the worker's store with the app shell. All entries must
    /// fetch with 2xx before any is written.
    async fn install(&self, worker: &ServiceWorker) -> Result<(), LifecycleError> {
        let ctx = &worker.ctx;
        let fetches = ctx.config.app_shell.iter().map(|path| async move {
            let req = InterceptedRequest::get(&ctx.config, path);
            let resp = ctx.fetch(&req).await.map_err(|source| LifecycleError::ShellFetch {
                path: path.clone(),
                source,
            })?;
            if !resp.is_ok() {
                return Err(LifecycleError::ShellStatus {
                    path: path.clone(),
                    status: resp.status,
                });
            }
            Ok((req.cache_key(), resp.to_cached()))
        });
        let entries = try_join_all(fetches).await?;

        let count = entries.len();
        for (key, value) in entries {
            ctx.store.put(key, value).await?;
        }
        tracing::info!(worker = worker.id, entries = count, "app shell cached");

        if ctx.config.skip_waiting_on_install {
            worker.skip_waiting.store(true, Ordering::Relaxed);
        }
        worker.transition(WorkerState::Installed, &self.events)
    }

    /// Promote the waiting worker: purge stale stores, then claim clients.
    /// Caller holds `deploy_lock`.
    async fn activate_waiting(&self) -> Result<(), LifecycleError> {
        let Some(worker) = self.waiting.lock().take() else {
            return Ok(());
        };
        worker.transition(WorkerState::Activating, &self.events)?;

        match purge_stale_caches(self.storage.as_ref(), worker.generation()).await {
            Ok(deleted) if !deleted.is_empty() => {
                tracing::info!(deleted = ?deleted, "stale cache stores deleted");
            }
            Ok(_) => {}
            // Cleanup is retried at the next activation; it must not keep
            // the new worker from taking over.
            Err(e) => tracing::warn!(error = %e, "failed to purge stale cache stores"),
        }

        worker.transition(WorkerState::Activated, &self.events)?;

        // Claim: every request from now on goes through the new worker.
        let previous = self.active.swap(Some(Arc::clone(&worker)));
        if let Some(previous) = previous {
            previous.transition(WorkerState::Redundant, &self.events)?;
        }
        let _ = self.events.send(LifecycleEvent::ControllerChange {
            worker_id: worker.id,
            generation: worker.generation().to_string(),
        });
        tracing::info!(worker = worker.id, generation = worker.generation(), "worker is now the controller");
        Ok(())
    }
}
