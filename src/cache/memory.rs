use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

use super::{Cache, CacheError, CacheResult, CacheStats, Fetcher};
use crate::config::MemoryCacheConfig;

/// An in-flight fetch. The producer publishes into `result` before waking
/// waiters, so a woken waiter always finds the slot filled.
struct Flight {
    result: OnceLock<CacheResult<Bytes>>,
    notify: Notify,
}

impl Flight {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            result: OnceLock::new(),
            notify: Notify::new(),
        })
    }

    async fn wait(&self) -> CacheResult<Bytes> {
        loop {
            let notified = self.notify.notified();
            if let Some(res) = self.result.get() {
                return res.clone();
            }
            notified.await;
        }
    }

    fn publish(&self, res: CacheResult<Bytes>) {
        let _ = self.result.set(res);
        self.notify.notify_waiters();
    }
}

struct StoredEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// In-memory TTL cache with single-flight fetch coalescing.
///
/// The flight table mutex is held only for lookup/insert/remove, never
/// across the fetch itself.
pub struct MemoryCache {
    store: Mutex<HashMap<Vec<u8>, StoredEntry>>,
    flights: Mutex<HashMap<Vec<u8>, Arc<Flight>>>,
    max_items: usize,
    max_item_size: usize,
    closed: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            max_items: config.max_items_count.max(1),
            max_item_size: config.max_item_size.max(1),
            closed: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    fn lookup(&self, key: &[u8]) -> CacheResult<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        let mut store = self.store.lock().expect("cache store mutex poisoned");
        let now = Instant::now();
        match store.get(key) {
            Some(entry) if !entry.expired(now) => Ok(entry.value.clone()),
            Some(_) => {
                store.remove(key);
                Err(CacheError::Miss)
            }
            None => Err(CacheError::Miss),
        }
    }

    fn insert(&self, key: &[u8], value: Bytes, ttl: Duration) {
        if value.len() > self.max_item_size {
            debug!(len = value.len(), "value exceeds max item size, not cached");
            return;
        }
        let mut store = self.store.lock().expect("cache store mutex poisoned");
        if store.len() >= self.max_items && !store.contains_key(key) {
            let now = Instant::now();
            store.retain(|_, e| !e.expired(now));
            if store.len() >= self.max_items {
                // Still full of live entries: drop an arbitrary one
                if let Some(victim) = store.keys().next().cloned() {
                    store.remove(&victim);
                }
            }
        }
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        store.insert(key.to_vec(), StoredEntry { value, expires_at });
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn set(&self, key: &[u8], value: Bytes, ttl: Duration) -> CacheResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        self.insert(key, value, ttl);
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> CacheResult<Bytes> {
        match self.lookup(key) {
            Ok(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(v)
            }
            Err(CacheError::Miss) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::Miss)
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn get_and_store(&self, key: &[u8], fetcher: &dyn Fetcher) -> CacheResult<Bytes> {
        match self.get(key).await {
            Ok(v) => return Ok(v),
            Err(CacheError::Miss) => {}
            Err(e) => return Err(e),
        }

        // Miss: join an in-flight fetch for this key or become the producer
        enum FlightSlot {
            Existing(Arc<Flight>),
            New(Arc<Flight>),
        }
        let slot = {
            let mut flights = self.flights.lock().expect("flight table mutex poisoned");
            if let Some(existing) = flights.get(key) {
                FlightSlot::Existing(Arc::clone(existing))
            } else {
                let flight = Flight::new();
                flights.insert(key.to_vec(), Arc::clone(&flight));
                FlightSlot::New(flight)
            }
        };
        let flight = match slot {
            FlightSlot::Existing(existing) => return existing.wait().await,
            FlightSlot::New(flight) => flight,
        };

        let result = match fetcher.fetch(key).await {
            Ok((value, ttl)) => {
                if !value.is_empty() {
                    self.insert(key, value.clone(), ttl);
                }
                Ok(value)
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        };

        // Value is stored before waiters wake; the entry goes away right
        // after release so the next miss starts a fresh fetch
        flight.publish(result.clone());
        self.flights
            .lock()
            .expect("flight table mutex poisoned")
            .remove(key);

        result
    }

    async fn delete(&self, key: &[u8]) {
        self.store
            .lock()
            .expect("cache store mutex poisoned")
            .remove(key);
    }

    async fn clear(&self) {
        self.store
            .lock()
            .expect("cache store mutex poisoned")
            .clear();
    }

    async fn close(&self) -> CacheResult<()> {
        self.closed.store(true, Ordering::Release);
        self.store
            .lock()
            .expect("cache store mutex poisoned")
            .clear();
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
