//! A small bounded, TTL-expiring cache.
//!
//! Grounded on `kb_retrieval.py`'s two `TTLCache` instances (query-embedding:
//! 256 entries / 1h; result cache: 256 entries / 90s) and on the teacher's
//! `agent/cache.rs::LLMCache` shape (`Arc<RwLock<HashMap<..>>>`, no external
//! caching crate in the teacher's stack). Eviction is oldest-insertion-first
//! once capacity is exceeded, which is sufficient for the spec's stated
//! "may duplicate work under contention — acceptable" tolerance.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    seq: u64,
}

pub struct TtlCache<K, V> {
    capacity: usize,
    ttl: Duration,
    entries: RwLock<HashMap<K, Entry<V>>>,
    seq: std::sync::atomic::AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: RwLock::new(HashMap::new()),
            seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    pub async fn set(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;
        // Best-effort cleanup of expired entries before considering eviction.
        entries.retain(|_, e| e.inserted_at.elapsed() <= self.ttl);

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.seq)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest_key);
            }
        }

        let seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                seq,
            },
        );
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hit_then_miss_after_ttl() {
        let cache: TtlCache<String, i32> = TtlCache::new(4, Duration::from_millis(20));
        cache.set("a".to_string(), 1).await;
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn evicts_oldest_over_capacity() {
        let cache: TtlCache<i32, i32> = TtlCache::new(2, Duration::from_secs(60));
        cache.set(1, 1).await;
        cache.set(2, 2).await;
        cache.set(3, 3).await;
        assert_eq!(cache.get(&1).await, None);
        assert_eq!(cache.get(&2).await, Some(2));
        assert_eq!(cache.get(&3).await, Some(3));
    }
}
