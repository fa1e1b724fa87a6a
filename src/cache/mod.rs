//! Cross-request key/value cache exposed to pipeline modules.
//!
//! The only non-trivial operation is `get_and_store`: concurrent callers of
//! the same key are collapsed onto one fetch (single-flight) and all observe
//! the same result. Failures are shared with waiters but never cached.

pub mod memory;
pub mod null;
pub mod pin;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::CacheConfig;
use crate::error::{VgateError, VgateResult};

pub use memory::MemoryCache;
pub use null::NullCache;
pub use pin::PinStore;

/// Cache failure modes. Cloneable so single-flight waiters share one error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The key is not present
    #[error("cache miss")]
    Miss,
    /// The cache was closed during shutdown
    #[error("cache closed")]
    Closed,
    /// The fetcher of a get_and_store failed
    #[error("fetch failed: {0}")]
    Fetch(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

/// Used by the cache to retrieve a value for a key after a miss
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Produce the value and the TTL it should be stored with
    async fn fetch(&self, key: &[u8]) -> CacheResult<(Bytes, Duration)>;
}

/// Cache the reverse proxy hands to its modules for cross-request state
#[async_trait]
pub trait Cache: Send + Sync {
    /// Store a value; a zero ttl means no expiry
    async fn set(&self, key: &[u8], value: Bytes, ttl: Duration) -> CacheResult<()>;

    /// Get the value of a key; `CacheError::Miss` when absent
    async fn get(&self, key: &[u8]) -> CacheResult<Bytes>;

    /// Get a value, fetching it on miss. At most one concurrent fetch runs
    /// per key; other callers block and share its result
    async fn get_and_store(&self, key: &[u8], fetcher: &dyn Fetcher) -> CacheResult<Bytes>;

    /// Delete a key
    async fn delete(&self, key: &[u8]);

    /// Drop everything
    async fn clear(&self);

    /// Close the cache; later operations fail with `Closed`
    async fn close(&self) -> CacheResult<()>;

    /// Monotonic hit/miss/error counters
    fn stats(&self) -> CacheStats;
}

impl std::fmt::Debug for dyn Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Cache")
    }
}

/// Build a cache from the handler configuration. No configuration means the
/// null cache, which lets cache-dependent features degrade to stateless
/// behavior instead of failing.
pub fn build_cache(cfg: Option<&CacheConfig>) -> VgateResult<Arc<dyn Cache>> {
    match cfg {
        None => Ok(Arc::new(NullCache::new())),
        Some(cfg) => match cfg.r#type.as_str() {
            "Memory" => Ok(Arc::new(MemoryCache::new(
                cfg.config.clone().unwrap_or_default(),
            ))),
            other => Err(VgateError::config(format!("Unknown Cache type {}", other))),
        },
    }
}
