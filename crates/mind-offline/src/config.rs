use crate::lifecycle::Registration;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    /// Upper bound on every fetch made by a strategy or install. 0 disables it.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    /// Cache generation tag; also the name of the active cache store.
    #[serde(default = "default_generation")]
    pub generation: String,
    #[serde(default = "default_offline_path")]
    pub offline_path: String,
    #[serde(default = "default_app_shell")]
    pub app_shell: Vec<String>,
    #[serde(default = "default_skip_waiting")]
    pub skip_waiting_on_install: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_excluded_prefixes")]
    pub excluded_prefixes: Vec<String>,
    #[serde(default = "default_static_prefixes")]
    pub static_prefixes: Vec<String>,
    #[serde(default = "default_static_extensions")]
    pub static_extensions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Disk,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
}

/// Immutable per-deployment settings handed to the router, the strategies
/// and the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub cache_name: String,
    /// Upstream origin without a trailing slash, e.g. `http://127.0.0.1:3000`.
    pub origin: String,
    pub app_shell: Vec<String>,
    pub offline_path: String,
    pub excluded_prefixes: Vec<String>,
    pub static_prefixes: Vec<String>,
    pub static_extensions: Vec<String>,
    pub fetch_timeout: Option<Duration>,
    pub skip_waiting_on_install: bool,
}

impl WorkerConfig {
    /// Absolute upstream URL for an origin-relative path (with optional query).
    pub fn resolve(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{}", self.origin, path_and_query)
        } else {
            format!("{}/{}", self.origin, path_and_query)
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Config::default_config().worker_config()
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                url: "http://127.0.0.1:3000".to_string(),
                timeout_ms: default_timeout_ms(),
            },
            worker: WorkerSection::default(),
            routing: RoutingConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    /// Validate configuration values after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // The upstream client speaks plain HTTP only.
        if !self.upstream.url.starts_with("http://") {
            return Err(invalid("upstream.url", "must be an http:// URL"));
        }
        if self.upstream.timeout_ms > 300_000 {
            return Err(invalid("upstream.timeout_ms", "must not exceed 5 minutes (300000ms)"));
        }

        if self.worker.generation.trim().is_empty() {
            return Err(invalid("worker.generation", "must not be empty"));
        }
        if !self.worker.offline_path.starts_with('/') {
            return Err(invalid("worker.offline_path", "must start with '/'"));
        }
        if let Some(bad) = self.worker.app_shell.iter().find(|p| !p.starts_with('/')) {
            return Err(invalid("worker.app_shell", format!("path {bad:?} must start with '/'")));
        }

        if let Some(bad) = self
            .routing
            .static_extensions
            .iter()
            .find(|e| e.is_empty() || e.contains('.') || e.contains('/'))
        {
            return Err(invalid(
                "routing.static_extensions",
                format!("{bad:?} must be a bare extension such as \"js\""),
            ));
        }
        for (field, prefixes) in [
            ("routing.excluded_prefixes", &self.routing.excluded_prefixes),
            ("routing.static_prefixes", &self.routing.static_prefixes),
        ] {
            if let Some(bad) = prefixes.iter().find(|p| !p.starts_with('/')) {
                return Err(invalid(field, format!("prefix {bad:?} must start with '/'")));
            }
        }

        if !self.worker.app_shell.contains(&self.worker.offline_path) {
            tracing::warn!(
                offline_path = %self.worker.offline_path,
                "offline_path is not part of app_shell; navigations with no cache will get the plain-text fallback"
            );
        }

        Ok(())
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            cache_name: self.worker.generation.clone(),
            origin: self.upstream.url.trim_end_matches('/').to_string(),
            app_shell: self.worker.app_shell.clone(),
            offline_path: self.worker.offline_path.clone(),
            excluded_prefixes: self.routing.excluded_prefixes.clone(),
            static_prefixes: self.routing.static_prefixes.clone(),
            static_extensions: self.routing.static_extensions.clone(),
            fetch_timeout: match self.upstream.timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            skip_waiting_on_install: self.worker.skip_waiting_on_install,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            generation: default_generation(),
            offline_path: default_offline_path(),
            app_shell: default_app_shell(),
            skip_waiting_on_install: default_skip_waiting(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            excluded_prefixes: default_excluded_prefixes(),
            static_prefixes: default_static_prefixes(),
            static_extensions: default_static_extensions(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            dir: default_storage_dir(),
        }
    }
}

/// Whether a reload changes anything a running worker was built from.
/// Any such change is a new deployment.
pub fn needs_redeploy(old: &Config, new: &Config) -> bool {
    old.worker_config() != new.worker_config()
}

/// Compare old and new config, apply safe changes, reject unsafe ones.
///
/// - Worker settings changed → install a new worker generation
/// - Listen addresses, upstream URL or storage changed → WARN, ignore (restart required)
pub fn diff_and_apply(
    old: &Config,
    new: &Config,
    registration: &Arc<Registration>,
    runtime: &tokio::runtime::Handle,
) {
    if old.server.listen_addr != new.server.listen_addr
        || old.server.metrics_addr != new.server.metrics_addr
    {
        tracing::warn!("listen address change detected, ignoring. Restart to rebind");
    }
    if old.upstream.url != new.upstream.url {
        tracing::warn!(
            old = %old.upstream.url,
            new = %new.upstream.url,
            "upstream change detected, ignoring. Restart to switch origins"
        );
        return;
    }
    if old.storage.backend != new.storage.backend || old.storage.dir != new.storage.dir {
        tracing::warn!("storage change detected, ignoring. Restart to switch backends");
    }

    if !needs_redeploy(old, new) {
        return;
    }

    let worker_config = new.worker_config();
    tracing::info!(
        old = %old.worker.generation,
        new = %worker_config.cache_name,
        "config reloaded: deploying new worker"
    );
    let registration = Arc::clone(registration);
    runtime.spawn(async move {
        if let Err(e) = registration.deploy(worker_config).await {
            tracing::error!(error = %e, "deployment after config reload failed");
        }
    });
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_metrics_addr() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_generation() -> String {
    "mind-v2".to_string()
}
fn default_offline_path() -> String {
    "/offline".to_string()
}
fn default_app_shell() -> Vec<String> {
    [
        "/offline",
        "/login",
        "/icons/icon-192.png",
        "/icons/icon-512.png",
        "/icons/apple-touch-icon.png",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_skip_waiting() -> bool {
    true
}
fn default_excluded_prefixes() -> Vec<String> {
    vec!["/api/".to_string(), "/_next/webpack".to_string()]
}
fn default_static_prefixes() -> Vec<String> {
    vec!["/_next/static".to_string(), "/icons".to_string()]
}
fn default_static_extensions() -> Vec<String> {
    ["js", "css", "woff", "woff2", "png", "jpg", "svg", "ico"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_backend() -> StorageBackend {
    StorageBackend::Memory
}
fn default_storage_dir() -> PathBuf {
    PathBuf::from(".mind-cache")
}
