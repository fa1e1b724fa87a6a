use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{Cache, CacheError, CacheResult, CacheStats, Fetcher};

/// A cache that stores nothing.
///
/// Every lookup misses and `get_and_store` goes straight to the fetcher, so
/// features relying on the cache (backend pinning in particular) degrade to
/// correct stateless behavior when caching is disabled.
#[derive(Debug, Default)]
pub struct NullCache {
    misses: AtomicU64,
    errors: AtomicU64,
}

impl NullCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for NullCache {
    async fn set(&self, _key: &[u8], _value: Bytes, _ttl: Duration) -> CacheResult<()> {
        Ok(())
    }

    async fn get(&self, _key: &[u8]) -> CacheResult<Bytes> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        Err(CacheError::Miss)
    }

    async fn get_and_store(&self, key: &[u8], fetcher: &dyn Fetcher) -> CacheResult<Bytes> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        match fetcher.fetch(key).await {
            Ok((value, _ttl)) => Ok(value),
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn delete(&self, _key: &[u8]) {}

    async fn clear(&self) {}

    async fn close(&self) -> CacheResult<()> {
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: 0,
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticFetcher;

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, _key: &[u8]) -> CacheResult<(Bytes, Duration)> {
            Ok((Bytes::from_static(b"fetched"), Duration::from_secs(1)))
        }
    }

    #[tokio::test]
    async fn test_always_misses() {
        let cache = NullCache::new();
        cache
            .set(b"k", Bytes::from_static(b"v"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(cache.get(b"k").await.unwrap_err(), CacheError::Miss);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_get_and_store_delegates() {
        let cache = NullCache::new();
        let v = cache.get_and_store(b"k", &StaticFetcher).await.unwrap();
        assert_eq!(v, Bytes::from_static(b"fetched"));
        // The fetched value was not retained
        assert_eq!(cache.get(b"k").await.unwrap_err(), CacheError::Miss);
    }
}
