use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use super::Cache;

/// Typed view over the cache mapping a routing key to a backend slot index.
///
/// Pins are advisory: absent keys and decode failures come back as `None`
/// and selection degrades to plain round-robin. Indices are stored as
/// unsigned varints.
#[derive(Clone, Debug)]
pub struct PinStore {
    cache: Arc<dyn Cache>,
}

impl PinStore {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub async fn set(&self, key: &str, index: usize, ttl: Duration) {
        let buf = encode_uvarint(index as u64);
        // Pin loss only degrades selection, so write failures are ignored
        let _ = self.cache.set(key.as_bytes(), Bytes::from(buf), ttl).await;
    }

    pub async fn get(&self, key: &str) -> Option<usize> {
        let raw = self.cache.get(key.as_bytes()).await.ok()?;
        decode_uvarint(&raw).map(|v| v as usize)
    }

    pub async fn delete(&self, key: &str) {
        self.cache.delete(key.as_bytes()).await;
    }
}

fn encode_uvarint(mut v: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
    buf
}

fn decode_uvarint(buf: &[u8]) -> Option<u64> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    for &b in buf {
        if shift >= 64 {
            return None;
        }
        v |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Some(v);
        }
        shift += 7;
    }
    None
}
