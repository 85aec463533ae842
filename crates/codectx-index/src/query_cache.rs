//! Recent search results, bounded by count and age.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use crate::search::SearchHit;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    query: String,
    k: usize,
}

struct CacheEntry {
    inserted: Instant,
    hits: Vec<SearchHit>,
}

/// LRU of search results. Entries expire `ttl` after insertion whether or
/// not they are read.
///
/// Every [`clear`](QueryCache::clear) starts a new generation. A result
/// computed under an older generation is never stored.
pub struct QueryCache {
    inner: Mutex<LruCache<CacheKey, CacheEntry>>,
    generation: AtomicU64,
    ttl: Duration,
}

/// Lowercase and collapse whitespace.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            generation: AtomicU64::new(0),
            ttl,
        }
    }

    pub async fn get(&self, query: &str, k: usize) -> Option<Vec<SearchHit>> {
        let key = CacheKey {
            query: normalize_query(query),
            k,
        };
        let mut cache = self.inner.lock().await;
        let expired = cache.peek(&key)?.inserted.elapsed() >= self.ttl;
        if expired {
            cache.pop(&key);
            return None;
        }
        cache.get(&key).map(|entry| entry.hits.clone())
    }

    /// Read before computing a result that will be passed to `put`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Store `hits` unless the cache was cleared since `generation` was read.
    pub async fn put(&self, query: &str, k: usize, generation: u64, hits: Vec<SearchHit>) {
        let key = CacheKey {
            query: normalize_query(query),
            k,
        };
        let mut cache = self.inner.lock().await;
        if self.generation.load(Ordering::Acquire) != generation {
            debug!("Dropping result for {:?} computed before the last clear", key.query);
            return;
        }
        cache.put(
            key,
            CacheEntry {
                inserted: Instant::now(),
                hits,
            },
        );
    }

    pub async fn clear(&self) {
        let mut cache = self.inner.lock().await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        cache.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
