//! Generation-tagged response cache stores.
//!
//! A [`CacheStorage`](traits::CacheStorage) holds named
//! [`CacheStore`](traits::CacheStore)s, one per cache generation. Two
//! backends are provided: [`memory`] (sharded, process lifetime) and
//! [`disk`] (directory per store, survives restarts).

pub mod disk;
pub mod error;
pub mod memory;
pub mod traits;

pub use error::CacheError;
pub use traits::{CacheKey, CacheStats, CacheStorage, CacheStore, CachedResponse};
