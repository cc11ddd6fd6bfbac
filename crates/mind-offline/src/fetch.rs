use crate::request::InterceptedRequest;
use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{HeaderMap, Request};
use hyper_util::client::legacy::Client;
use mind_cache::{CacheKey, CachedResponse};
use std::time::Duration;
use thiserror::Error;

pub type HttpClient = Client<hyper_util::client::legacy::connect::HttpConnector, Body>;

/// Headers that describe a single connection and must not be stored or
/// relayed. `content-length` is recomputed whenever a body is re-served.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// End-to-end headers as owned pairs, dropping hop-by-hop ones and, when
/// `skip_length` is set, `content-length`.
pub fn collect_headers(headers: &HeaderMap, skip_length: bool) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(k, _)| !is_hop_by_hop(k.as_str()))
        .filter(|(k, _)| !(skip_length && k.as_str() == "content-length"))
        .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
        .collect()
}

/// Headers that set client session state. Never kept in a store, so a
/// cached copy can't hand one client's session to another.
const SESSION_HEADERS: [&str; 2] = ["set-cookie", "set-cookie2"];

pub fn is_session_header(name: &str) -> bool {
    SESSION_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// The `Cache-Control` directives that limit storing a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_store: bool,
    pub private: bool,
}

pub fn parse_cache_control(value: &str) -> CacheControl {
    let mut result = CacheControl::default();
    for directive in value.split(',').map(|s| s.trim().to_ascii_lowercase()) {
        match directive.as_str() {
            "no-store" => result.no_store = true,
            "private" => result.private = true,
            _ => {}
        }
    }
    result
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),

    #[error("upstream unreachable: {0}")]
    Connect(String),

    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to read upstream body: {0}")]
    Body(String),
}

/// A complete response received from the network.
#[derive(Debug, Clone)]
pub struct NetworkResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl NetworkResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// 2xx.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn cache_control(&self) -> CacheControl {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("cache-control"))
            .map(|(_, v)| parse_cache_control(v))
            .fold(CacheControl::default(), |acc, cc| CacheControl {
                no_store: acc.no_store || cc.no_store,
                private: acc.private || cc.private,
            })
    }

    /// Whether a copy may be kept under `key`: 2xx, not `no-store`, and
    /// `private` responses only under a session-scoped key.
    pub fn may_store(&self, key: &CacheKey) -> bool {
        let cc = self.cache_control();
        self.is_ok() && !cc.no_store && (!cc.private || key.partition.is_some())
    }

    /// The copy to store, without session headers.
    pub fn to_cached(&self) -> CachedResponse {
        let headers = self
            .headers
            .iter()
            .filter(|(k, _)| !is_session_header(k))
            .cloned()
            .collect();
        CachedResponse::new(self.status, headers, self.body.clone())
    }
}

/// Performs a single network fetch for the worker.
///
/// Implementations report transport failures as `Err`; any HTTP status,
/// including 5xx, is a successful fetch.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, req: &InterceptedRequest) -> Result<NetworkResponse, FetchError>;
}

/// Fetcher backed by the shared hyper client.
pub struct HttpFetcher {
    client: HttpClient,
}

impl HttpFetcher {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, req: &InterceptedRequest) -> Result<NetworkResponse, FetchError> {
        let mut builder = Request::builder().method(req.method.clone()).uri(&req.url);
        for (k, v) in &req.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        let upstream_req = builder
            .body(Body::empty())
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

        let resp = self
            .client
            .request(upstream_req)
            .await
            .map_err(|e| FetchError::Connect(e.to_string()))?;

        let status = resp.status().as_u16();
        let headers = collect_headers(resp.headers(), true);
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| FetchError::Body(e.to_string()))?
            .to_bytes();

        Ok(NetworkResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn strips_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-length", HeaderValue::from_static("12"));

        let kept = collect_headers(&headers, true);
        assert_eq!(kept, vec![("content-type".to_string(), "text/html".to_string())]);

        let kept = collect_headers(&headers, false);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn ok_means_2xx() {
        assert!(NetworkResponse::new(200, "x").is_ok());
        assert!(NetworkResponse::new(204, "").is_ok());
        assert!(!NetworkResponse::new(304, "").is_ok());
        assert!(!NetworkResponse::new(500, "").is_ok());
    }

    fn with_headers(headers: &[(&str, &str)]) -> NetworkResponse {
        NetworkResponse {
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..NetworkResponse::new(200, "feed")
        }
    }

    #[test]
    fn stored_copy_drops_session_headers() {
        let resp = with_headers(&[
            ("content-type", "text/html"),
            ("Set-Cookie", "session=ALICE; Path=/"),
            ("set-cookie2", "legacy=1"),
        ]);
        let cached = resp.to_cached();
        assert_eq!(cached.headers, vec![("content-type".to_string(), "text/html".to_string())]);
        // The live response keeps them for its own client.
        assert_eq!(resp.headers.len(), 3);
    }

    #[test]
    fn cache_control_limits_storing() {
        let shared = CacheKey::get("http://origin/");
        let session = shared.clone().partitioned("session=ALICE");

        let plain = with_headers(&[("cache-control", "max-age=60")]);
        assert!(plain.may_store(&shared));

        let no_store = with_headers(&[("Cache-Control", "max-age=0, No-Store")]);
        assert!(!no_store.may_store(&shared));
        assert!(!no_store.may_store(&session));

        let private = with_headers(&[("cache-control", "private, max-age=0")]);
        assert!(!private.may_store(&shared));
        assert!(private.may_store(&session));

        assert!(!NetworkResponse::new(404, "").may_store(&session));
    }
}
