use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::metrics::Metrics;

/// Default TTL for describe-style lookups.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

struct Slot<V> {
    stored_at: Instant,
    value: V,
}

/// Short-TTL cache in front of an AWS describe operation, keyed by the
/// operation name plus a hash of the serialized input. Each entry has its own
/// async lock, so concurrent misses for one key coalesce into a single
/// upstream call while other keys proceed independently.
pub struct DescribeCache<V> {
    name: &'static str,
    ttl: Duration,
    metrics: Metrics,
    entries: StdMutex<HashMap<String, Arc<Mutex<Option<Slot<V>>>>>>,
}

impl<V: Clone> DescribeCache<V> {
    pub fn new(name: &'static str, ttl: Duration, metrics: Metrics) -> Self {
        DescribeCache {
            name,
            ttl,
            metrics,
            entries: StdMutex::new(HashMap::new()),
        }
    }

    fn key<I: Serialize>(operation: &str, input: &I) -> String {
        let serialized = serde_json::to_string(input).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        serialized.hash(&mut hasher);
        format!("{operation}:{:x}", hasher.finish())
    }

    pub async fn get_or_fetch<I, F, Fut>(&self, operation: &str, input: &I, fetch: F) -> Result<V>
    where
        I: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let key = Self::key(operation, input);
        let entry = {
            let mut entries = self.entries.lock().expect("cache map poisoned");
            entries.entry(key).or_default().clone()
        };

        let mut slot = entry.lock().await;
        if let Some(existing) = slot.as_ref() {
            if existing.stored_at.elapsed() < self.ttl {
                self.metrics.cache_hit(self.name);
                return Ok(existing.value.clone());
            }
        }
        self.metrics.cache_miss(self.name);
        let value = fetch().await?;
        *slot = Some(Slot {
            stored_at: Instant::now(),
            value: value.clone(),
        });
        Ok(value)
    }

    /// Drops every cached entry; used after mutations that invalidate
    /// whole-operation results.
    pub fn invalidate_all(&self) {
        self.entries.lock().expect("cache map poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cache(ttl: Duration) -> DescribeCache<u32> {
        DescribeCache::new("test", ttl, Metrics::new())
    }

    #[tokio::test]
    async fn second_lookup_hits() {
        let cache = cache(Duration::from_secs(3600));
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let got = cache
                .get_or_fetch("DescribeSubnets", &"input", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(7u32) }
                })
                .await
                .unwrap();
            assert_eq!(got, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_inputs_miss_independently() {
        let cache = cache(Duration::from_secs(3600));
        let calls = AtomicU32::new(0);
        for input in ["a", "b", "a"] {
            cache
                .get_or_fetch("DescribeSubnets", &input, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(0u32) }
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_ttl_always_refetches() {
        let cache = cache(Duration::ZERO);
        let calls = AtomicU32::new(0);
        for _ in 0..2 {
            cache
                .get_or_fetch("DescribeSubnets", &"input", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(0u32) }
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_clears_entries() {
        let cache = cache(Duration::from_secs(3600));
        let calls = AtomicU32::new(0);
        let fetch = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(0u32) }
        };
        cache.get_or_fetch("Op", &"x", fetch).await.unwrap();
        cache.invalidate_all();
        cache
            .get_or_fetch("Op", &"x", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(0u32) }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
