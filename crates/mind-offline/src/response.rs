use crate::fetch::{is_session_header, NetworkResponse};
use bytes::Bytes;
use mind_cache::CachedResponse;
use serde::Serialize;

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Cache,
    Network,
    /// The cached offline page, served for a failed navigation.
    OfflineFallback,
    /// Made up by the worker (503s).
    Synthetic,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Cache => "cache",
            Source::Network => "network",
            Source::OfflineFallback => "offline-fallback",
            Source::Synthetic => "synthetic",
        }
    }
}

/// Terminal result of a strategy.
#[derive(Debug, Clone)]
pub struct Served {
    pub source: Source,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Served {
    pub fn from_cache(entry: &CachedResponse) -> Self {
        Self::cached_as(entry, Source::Cache)
    }

    pub fn offline_fallback(entry: &CachedResponse) -> Self {
        Self::cached_as(entry, Source::OfflineFallback)
    }

    fn cached_as(entry: &CachedResponse, source: Source) -> Self {
        Self {
            source,
            status: entry.status,
            headers: entry
                .headers
                .iter()
                .filter(|(k, _)| !is_session_header(k))
                .cloned()
                .collect(),
            body: entry.body.clone(),
        }
    }

    pub fn from_network(resp: NetworkResponse) -> Self {
        Self {
            source: Source::Network,
            status: resp.status,
            headers: resp.headers,
            body: resp.body,
        }
    }

    /// Empty 503, used when neither network nor cache can answer.
    pub fn unavailable() -> Self {
        Self {
            source: Source::Synthetic,
            status: 503,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Plain-text 503 for navigations with no cache and no offline page.
    pub fn offline() -> Self {
        Self {
            source: Source::Synthetic,
            status: 503,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: Bytes::from_static(b"Offline"),
        }
    }
}
