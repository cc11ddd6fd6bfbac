use axum::routing::get;
use axum::Router;
use clap::Parser;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use mind_cache::disk::DiskCacheStorage;
use mind_cache::memory::MemoryCacheStorage;
use mind_cache::CacheStorage;
use mind_offline::config::{self, Config, StorageBackend, WorkerConfig};
use mind_offline::fetch::{HttpClient, HttpFetcher};
use mind_offline::lifecycle::Registration;
use mind_offline::metrics::{stats_handler, SwMetrics};
use mind_offline::proxy::{self, AppState};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mind-offline", about = "Offline caching proxy for the Mind web app")]
struct Args {
    /// Path to the TOML config file (watched for changes)
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = load_config(&args.config);
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(2);
    }

    let prom_handle = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "failed to install prometheus recorder");
            std::process::exit(1);
        }
    };

    let storage: Arc<dyn CacheStorage> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryCacheStorage::new()),
        StorageBackend::Disk => Arc::new(DiskCacheStorage::new(config.storage.dir.clone())),
    };

    let client: HttpClient = Client::builder(TokioExecutor::new()).build_http();
    let metrics = Arc::new(SwMetrics::new());
    let registration = Arc::new(Registration::new(
        storage,
        Arc::new(HttpFetcher::new(client.clone())),
        Arc::clone(&metrics),
    ));

    let state = Arc::new(AppState {
        registration: Arc::clone(&registration),
        client,
        upstream_url: config.upstream.url.clone(),
        metrics,
    });

    let shutdown = CancellationToken::new();

    // Requests pass straight through until the first worker takes control.
    tokio::spawn(initial_deploy(
        Arc::clone(&registration),
        config.worker_config(),
        shutdown.clone(),
    ));

    let admin_router = Router::new()
        .route("/api/stats", get(stats_handler))
        .route(
            "/metrics",
            get(move || {
                let h = prom_handle.clone();
                async move { h.render() }
            }),
        )
        .with_state(Arc::clone(&state));

    let proxy_router = proxy::router(Arc::clone(&state));

    let proxy_addr = config.server.listen_addr.clone();
    let metrics_addr = config.server.metrics_addr.clone();

    tracing::info!(
        proxy = %proxy_addr,
        metrics = %metrics_addr,
        upstream = %config.upstream.url,
        generation = %config.worker.generation,
        backend = registration.storage().backend(),
        "mind offline proxy starting"
    );

    let proxy_listener = tokio::net::TcpListener::bind(&proxy_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind proxy to {proxy_addr}: {e}"));

    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind metrics to {metrics_addr}: {e}"));

    spawn_config_watcher(args.config.clone(), config, Arc::clone(&registration));

    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    let proxy_future = axum::serve(proxy_listener, proxy_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let metrics_future = axum::serve(metrics_listener, admin_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::select! {
        result = proxy_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "proxy server error");
            }
        }
        result = metrics_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        }
    }

    registration.drain(Duration::from_secs(5)).await;
    tracing::info!("mind offline proxy shut down");
}

fn load_config(path: &Path) -> Config {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file found, using defaults");
        return Config::default_config();
    }
    match Config::load(path) {
        Ok(c) => {
            tracing::info!(path = %path.display(), "loaded config");
            c
        }
        Err(e) => {
            tracing::error!(error = %e, path = %path.display(), "failed to load config, using defaults");
            Config::default_config()
        }
    }
}

/// Deploy the first worker, retrying with backoff while the origin is
/// unreachable.
async fn initial_deploy(
    registration: Arc<Registration>,
    worker: WorkerConfig,
    shutdown: CancellationToken,
) {
    let mut backoff = Duration::from_millis(500);
    loop {
        // A config reload may have deployed a newer worker meanwhile.
        if registration.controller().is_some() {
            return;
        }
        match registration.deploy(worker.clone()).await {
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "initial worker install failed"
                );
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(Duration::from_secs(30));
    }
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}

/// Watch the config file and deploy a new worker generation when worker
/// settings change.
fn spawn_config_watcher(config_path: PathBuf, initial_config: Config, registration: Arc<Registration>) {
    let current_config = Arc::new(Mutex::new(initial_config));
    // The notify callback runs on its own thread.
    let runtime = tokio::runtime::Handle::current();

    let config_path_clone = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        let Ok(event) = res else {
            return;
        };
        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
            return;
        }
        let new_config = match Config::load(&config_path_clone) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "failed to reload config");
                return;
            }
        };
        if let Err(e) = new_config.validate() {
            tracing::error!(error = %e, "reloaded config is invalid, keeping the running worker");
            return;
        }
        let mut old = current_config.lock();
        config::diff_and_apply(&old, &new_config, &registration, &runtime);
        *old = new_config;
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start config watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, path = %config_path.display(), "failed to watch config file");
        return;
    }

    // Leak the watcher so it lives for the process lifetime
    std::mem::forget(watcher);
    tracing::info!("config file watcher started");
}
