use crate::config::WorkerConfig;
use hyper::Method;
use mind_cache::CacheKey;

/// Whether the request is a top-level page navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Navigate,
    Other,
}

/// An outgoing request as seen by the worker, independent of the HTTP
/// server that received it.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: Method,
    /// Absolute upstream URL, including query.
    pub url: String,
    /// Path only, used for classification.
    pub path: String,
    pub mode: RequestMode,
    /// End-to-end headers to send upstream.
    pub headers: Vec<(String, String)>,
}

impl InterceptedRequest {
    pub fn new(
        config: &WorkerConfig,
        method: Method,
        path_and_query: &str,
        mode: RequestMode,
    ) -> Self {
        let path = path_and_query
            .split_once('?')
            .map_or(path_and_query, |(path, _)| path)
            .to_string();
        Self {
            method,
            url: config.resolve(path_and_query),
            path,
            mode,
            headers: Vec::new(),
        }
    }

    pub fn get(config: &WorkerConfig, path_and_query: &str) -> Self {
        Self::new(config, Method::GET, path_and_query, RequestMode::Other)
    }

    pub fn navigate(config: &WorkerConfig, path_and_query: &str) -> Self {
        Self::new(config, Method::GET, path_and_query, RequestMode::Navigate)
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    /// Key shared by every client. Used for the app shell and static assets.
    pub fn shared_cache_key(&self) -> CacheKey {
        CacheKey::new(self.method.as_str(), self.url.clone())
    }

    /// Key scoped to the caller's session when the request carries
    /// credentials, so one client's pages are never served to another.
    pub fn cache_key(&self) -> CacheKey {
        match self.credentials() {
            Some(credentials) => self.shared_cache_key().partitioned(&credentials),
            None => self.shared_cache_key(),
        }
    }

    /// `cookie` and `authorization` values, in a stable order.
    fn credentials(&self) -> Option<String> {
        let mut found: Vec<String> = self
            .headers
            .iter()
            .filter(|(k, _)| {
                k.eq_ignore_ascii_case("cookie") || k.eq_ignore_ascii_case("authorization")
            })
            .map(|(k, v)| format!("{}={v}", k.to_ascii_lowercase()))
            .collect();
        if found.is_empty() {
            return None;
        }
        found.sort();
        Some(found.join("\n"))
    }
}
