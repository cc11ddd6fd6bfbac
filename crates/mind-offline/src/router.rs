use crate::config::WorkerConfig;
use crate::request::{InterceptedRequest, RequestMode};
use hyper::Method;
use serde::Serialize;

/// Caching strategy a request is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [
        Strategy::CacheFirst,
        Strategy::NetworkFirst,
        Strategy::StaleWhileRevalidate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::CacheFirst => "cache-first",
            Strategy::NetworkFirst => "network-first",
            Strategy::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Path-derived request category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Dynamic endpoints and dev-server channels. Never cached.
    Api,
    StaticAsset,
    Navigation,
    Other,
}

impl RequestClass {
    pub fn strategy(self) -> Option<Strategy> {
        match self {
            RequestClass::Api => None,
            RequestClass::StaticAsset => Some(Strategy::CacheFirst),
            RequestClass::Navigation => Some(Strategy::StaleWhileRevalidate),
            RequestClass::Other => Some(Strategy::NetworkFirst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    NonGet,
    Excluded,
}

impl PassReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PassReason::NonGet => "non-get",
            PassReason::Excluded => "excluded",
        }
    }
}

/// What the worker does with an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave the request alone; it goes to the network untouched.
    PassThrough(PassReason),
    Respond(Strategy),
}

/// Classify a path. Order matters: excluded prefixes win over static
/// patterns, static patterns win over navigation mode.
pub fn classify(config: &WorkerConfig, path: &str, mode: RequestMode) -> RequestClass {
    if config
        .excluded_prefixes
        .iter()
        .any(|p| path.starts_with(p.as_str()))
    {
        return RequestClass::Api;
    }

    if config
        .static_prefixes
        .iter()
        .any(|p| path.starts_with(p.as_str()))
        || has_static_extension(path, &config.static_extensions)
    {
        return RequestClass::StaticAsset;
    }

    match mode {
        RequestMode::Navigate => RequestClass::Navigation,
        RequestMode::Other => RequestClass::Other,
    }
}

/// Decide the disposition of a request. Every request gets exactly one.
pub fn route(config: &WorkerConfig, req: &InterceptedRequest) -> Disposition {
    if req.method != Method::GET {
        return Disposition::PassThrough(PassReason::NonGet);
    }
    match classify(config, &req.path, req.mode).strategy() {
        Some(strategy) => Disposition::Respond(strategy),
        None => Disposition::PassThrough(PassReason::Excluded),
    }
}

fn has_static_extension(path: &str, extensions: &[String]) -> bool {
    match path.rsplit_once('.') {
        Some((_, ext)) if !ext.contains('/') => extensions.iter().any(|e| e == ext),
        _ => false,
    }
}
