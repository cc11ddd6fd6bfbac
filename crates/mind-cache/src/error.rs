use thiserror::Error;

/// Errors raised by cache stores and cache storage backends.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("only GET requests can be cached, got {0}")]
    MethodNotCacheable(String),

    #[error("only 2xx responses can be cached, got {0}")]
    StatusNotCacheable(u16),

    #[error("cache store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt cache entry: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}
